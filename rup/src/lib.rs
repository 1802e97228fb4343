//! RUP procurement-data proxy: validates region and year selections, fetches
//! the matching upstream JSON file, caches it, and serves filtered views of
//! it over HTTP.

use crate::api::RupApiError;
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use tokio::net::TcpListener;

pub mod api;
pub mod cache;
pub mod config;
pub mod fetcher;
pub mod metrics_defs;
pub mod negative_cache;
pub mod orchestrator;
pub mod params;
pub mod records;
pub mod source;
#[cfg(test)]
mod testutils;
pub mod types;

/// Binds the listeners, starts the initial load in the background and
/// serves until a listener fails.
pub async fn run(config: Config) -> Result<(), RupApiError> {
    let orchestrator = Orchestrator::from_config(&config)?;

    let listener = TcpListener::bind(config.listener.address()).await?;
    let admin_listener = match &config.admin_listener {
        Some(admin) => Some(TcpListener::bind(admin.address()).await?),
        None => None,
    };

    let startup = orchestrator.clone();
    tokio::spawn(async move {
        // Failures are logged inside; the API keeps serving without data.
        let _ = startup.initialize().await;
    });

    let api_task = api::serve(listener, orchestrator.clone());

    match admin_listener {
        Some(admin_listener) => {
            tracing::info!(addr = ?admin_listener.local_addr()?, "serving admin endpoints");
            let ready = orchestrator.clone();
            let admin = AdminService::new(move || ready.is_ready());
            let admin_task = async {
                run_http_service(admin_listener, admin)
                    .await
                    .map_err(RupApiError::from)
            };
            tokio::try_join!(api_task, admin_task)?;
        }
        None => api_task.await?,
    }

    Ok(())
}
