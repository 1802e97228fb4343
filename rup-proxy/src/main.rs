mod config;

use clap::Parser;
use config::{Config, ConfigError, LoggingConfig, MetricsConfig, Overrides};
use metrics_exporter_statsd::StatsdBuilder;
use rup::metrics_defs::ALL_METRICS;
use shared::metrics_defs::describe_all;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const METRICS_PREFIX: &str = "rup";

#[derive(Parser, Debug)]
#[command(version, about = "Caching proxy for RUP procurement data")]
struct Cli {
    /// Path to the YAML config file. Built-in defaults are used when omitted.
    #[arg(long, short, env = "RUP_CONFIG")]
    config: Option<PathBuf>,
    /// Region code loaded at startup
    #[arg(long, env = "DEFAULT_KLPD")]
    default_klpd: Option<String>,
    /// Year loaded at startup
    #[arg(long, env = "DEFAULT_TAHUN")]
    default_tahun: Option<String>,
    /// Fixed dataset URL that replaces the per-region URL
    #[arg(long, env = "JSON_DATA_URL")]
    data_url: Option<String>,
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

fn load_config(cli: Cli) -> Result<Config, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    config.apply_overrides(Overrides {
        default_klpd: cli.default_klpd,
        default_tahun: cli.default_tahun,
        data_url: cli.data_url,
        port: cli.port,
    });
    config.validate()?;

    Ok(config)
}

/// Installs the log subscriber. The returned guard flushes Sentry on drop
/// and must live until shutdown.
fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let level = logging.map_or("info", |l| l.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let guard = logging
        .and_then(|l| l.sentry_dsn.as_deref())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(metrics: &MetricsConfig) -> Result<(), String> {
    let recorder = StatsdBuilder::from(metrics.statsd_host.clone(), metrics.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| e.to_string())?;
    metrics::set_global_recorder(recorder).map_err(|e| e.to_string())?;
    describe_all(ALL_METRICS);

    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "sending metrics to statsd"
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let _sentry = init_logging(config.common.logging.as_ref());

    if let Some(metrics) = &config.common.metrics
        && let Err(e) = init_metrics(metrics)
    {
        tracing::error!(error = %e, "could not set up metrics");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "could not start runtime");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        klpd = %config.rup.defaults.klpd,
        tahun = %config.rup.defaults.tahun,
        addr = %config.rup.listener.address(),
        "starting RUP proxy"
    );

    match runtime.block_on(rup::run(config.rup)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "RUP proxy stopped");
            ExitCode::FAILURE
        }
    }
}
