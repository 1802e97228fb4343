use crate::cache::CacheStats;
use crate::orchestrator::{Orchestrator, ParamEcho, RupError};
use crate::params::{KLPD_LIST, KlpdInfo, Validation};
use crate::records::{self, DEFAULT_PARTIAL_LIMIT};
use crate::types::{DatasetKey, RecordSet, RupRecord};
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, Request, State, rejection::JsonRejection},
    http::{Method, StatusCode, Uri, header, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

const DEFAULT_DEBUG_SAMPLE: usize = 10;

#[derive(thiserror::Error, Debug)]
pub enum RupApiError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("could not start service: {0}")]
    Startup(#[from] RupError),
}

pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/validate", get(validate))
        .route("/api/test-connection", get(test_connection))
        .route("/api/rup", get(rup_list))
        .route("/api/rup/{kd_satker}", get(rup_by_satker))
        .route("/api/{klpd}/{tahun}/rup", get(rup_list_for))
        .route("/api/{klpd}/{tahun}/rup/{kd_satker}", get(rup_by_satker_for))
        .route("/api/satker/list", get(satker_list))
        .route("/api/stats", get(stats))
        .route("/api/klpd/list", get(klpd_list))
        .route("/api/columns", get(columns))
        .route("/api/search-satker/{partial}", get(search_satker))
        .route("/api/debug", get(debug))
        .route("/api/config", get(get_config).post(set_config))
        .route("/api/refresh", post(refresh))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(middleware::from_fn(catch_panic))
        .layer(cors())
        .with_state(orchestrator)
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

pub async fn serve(listener: TcpListener, orchestrator: Orchestrator) -> Result<(), RupApiError> {
    tracing::info!(addr = ?listener.local_addr()?, "serving RUP API");
    axum::serve(listener, router(orchestrator)).await?;
    Ok(())
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    let body = Json(ErrorBody {
        success: false,
        message,
    });
    (status, body).into_response()
}

impl IntoResponse for RupError {
    fn into_response(self) -> Response {
        let status = match self {
            RupError::Validation(_) | RupError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            RupError::SatkerNotFound { .. } => StatusCode::NOT_FOUND,
            RupError::NotPublished { .. }
            | RupError::Fetch(_)
            | RupError::ConnectionFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RupError::NotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            RupError::Loading => StatusCode::ACCEPTED,
        };

        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }

        error_response(status, self.to_string())
    }
}

async fn catch_panic(req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(_) => {
            tracing::error!(%path, "request handler panicked");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

async fn not_found(method: Method, uri: Uri) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        format!("Endpoint {method} {} not found", uri.path()),
    )
}

async fn method_not_allowed(method: Method, uri: Uri) -> Response {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        format!("Method {method} not allowed for {}", uri.path()),
    )
}

/// Query string extractor that reports malformed input as a JSON error.
struct Params<T>(T);

impl<S, T> FromRequestParts<S> for Params<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = RupError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| RupError::Validation(rejection.body_text()))?;
        Ok(Params(value))
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parses an optional positive integer. Anything else is treated as absent.
fn positive(value: Option<&str>) -> Option<usize> {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
}

fn blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

#[derive(Deserialize, Debug, Default)]
struct DatasetParams {
    klpd: Option<String>,
    tahun: Option<String>,
    search: Option<String>,
    page: Option<String>,
    limit: Option<String>,
}

impl DatasetParams {
    fn page(&self) -> Option<usize> {
        positive(self.page.as_deref())
    }

    fn limit(&self) -> Option<usize> {
        positive(self.limit.as_deref())
    }
}

/// Records for explicit parameters, or the current selection when neither
/// region nor year is given.
async fn dataset(
    orchestrator: &Orchestrator,
    klpd: Option<&str>,
    tahun: Option<&str>,
) -> Result<(DatasetKey, RecordSet), RupError> {
    if blank(klpd) && blank(tahun) {
        let key = orchestrator.current_key();
        return orchestrator.current_records().map(|records| (key, records));
    }

    let key = orchestrator.resolve_key(klpd, tahun)?;
    let records = orchestrator.records_for(&key).await?;
    Ok((key, records))
}

fn list_response(records: &RecordSet, params: &DatasetParams) -> Json<Vec<RupRecord>> {
    let matched = match params.search.as_deref().map(str::trim) {
        Some(term) if !term.is_empty() => records::search(records, term),
        _ => records.to_vec(),
    };
    Json(records::paginate(matched, params.page(), params.limit()))
}

fn satker_response(
    key: &DatasetKey,
    records: &RecordSet,
    kd_satker: &str,
    params: &DatasetParams,
) -> Result<Json<Vec<RupRecord>>, RupError> {
    let matched = records::filter_by_satker(records, kd_satker);
    if matched.is_empty() {
        return Err(RupError::SatkerNotFound {
            kd_satker: kd_satker.to_string(),
            klpd: key.klpd.clone(),
            tahun: key.tahun.clone(),
        });
    }
    Ok(Json(records::paginate(matched, params.page(), params.limit())))
}

async fn rup_list(
    State(orchestrator): State<Orchestrator>,
    Params(params): Params<DatasetParams>,
) -> Result<Json<Vec<RupRecord>>, RupError> {
    let (_, records) =
        dataset(&orchestrator, params.klpd.as_deref(), params.tahun.as_deref()).await?;
    Ok(list_response(&records, &params))
}

async fn rup_by_satker(
    State(orchestrator): State<Orchestrator>,
    Path(kd_satker): Path<String>,
    Params(params): Params<DatasetParams>,
) -> Result<Json<Vec<RupRecord>>, RupError> {
    let (key, records) =
        dataset(&orchestrator, params.klpd.as_deref(), params.tahun.as_deref()).await?;
    satker_response(&key, &records, &kd_satker, &params)
}

async fn rup_list_for(
    State(orchestrator): State<Orchestrator>,
    Path((klpd, tahun)): Path<(String, String)>,
    Params(params): Params<DatasetParams>,
) -> Result<Json<Vec<RupRecord>>, RupError> {
    let (_, records) = dataset(&orchestrator, Some(&klpd), Some(&tahun)).await?;
    Ok(list_response(&records, &params))
}

async fn rup_by_satker_for(
    State(orchestrator): State<Orchestrator>,
    Path((klpd, tahun, kd_satker)): Path<(String, String, String)>,
    Params(params): Params<DatasetParams>,
) -> Result<Json<Vec<RupRecord>>, RupError> {
    let (key, records) = dataset(&orchestrator, Some(&klpd), Some(&tahun)).await?;
    satker_response(&key, &records, &kd_satker, &params)
}

async fn satker_list(
    State(orchestrator): State<Orchestrator>,
) -> Result<Json<Vec<records::SatkerSummary>>, RupError> {
    let records = orchestrator.current_records()?;
    Ok(Json(records::list_distinct_satker(&records)))
}

async fn stats(State(orchestrator): State<Orchestrator>) -> Result<Json<records::Stats>, RupError> {
    let records = orchestrator.current_records()?;
    Ok(Json(records::compute_stats(&records)))
}

async fn klpd_list() -> Json<&'static [KlpdInfo]> {
    Json(KLPD_LIST)
}

async fn columns(State(orchestrator): State<Orchestrator>) -> Result<Response, RupError> {
    let records = orchestrator.current_records()?;
    if records.is_empty() {
        let body = json!({
            "success": true,
            "message": "No data available",
            "data": [],
        });
        return Ok(Json(body).into_response());
    }
    Ok(Json(records::columns(&records)).into_response())
}

#[derive(Deserialize, Debug)]
struct LimitParams {
    limit: Option<String>,
}

async fn search_satker(
    State(orchestrator): State<Orchestrator>,
    Path(partial): Path<String>,
    Params(params): Params<LimitParams>,
) -> Result<Json<Vec<records::SatkerMatch>>, RupError> {
    let records = orchestrator.current_records().map_err(|err| match err {
        RupError::Loading => RupError::NotLoaded,
        other => other,
    })?;
    let limit = positive(params.limit.as_deref()).unwrap_or(DEFAULT_PARTIAL_LIMIT);
    Ok(Json(records::search_satker_by_partial(
        &records, &partial, limit,
    )))
}

#[derive(Deserialize, Debug)]
struct KeyParams {
    klpd: Option<String>,
    tahun: Option<String>,
}

#[derive(Serialize)]
struct ValidatedParam {
    input: String,
    #[serde(flatten)]
    validation: Validation,
}

#[derive(Serialize, Default)]
struct ValidationResults {
    #[serde(skip_serializing_if = "Option::is_none")]
    klpd: Option<ValidatedParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tahun: Option<ValidatedParam>,
}

#[derive(Serialize)]
struct ValidateResponse {
    success: bool,
    message: String,
    results: ValidationResults,
    valid_klpd: Vec<&'static str>,
    total_valid_klpd: usize,
}

async fn validate(
    State(orchestrator): State<Orchestrator>,
    Params(params): Params<KeyParams>,
) -> Result<Json<ValidateResponse>, RupError> {
    let klpd = params.klpd.as_deref().filter(|v| !v.is_empty());
    let tahun = params.tahun.as_deref().filter(|v| !v.is_empty());
    if klpd.is_none() && tahun.is_none() {
        return Err(RupError::MissingParameter(
            "Provide klpd and/or tahun to validate".to_string(),
        ));
    }

    let validator = orchestrator.validator();
    let results = ValidationResults {
        klpd: klpd.map(|input| ValidatedParam {
            input: input.to_string(),
            validation: validator.validate_region(Some(input)),
        }),
        tahun: tahun.map(|input| ValidatedParam {
            input: input.to_string(),
            validation: validator.validate_year(Some(input)),
        }),
    };

    let all_valid = [&results.klpd, &results.tahun]
        .into_iter()
        .flatten()
        .all(|param| param.validation.valid);
    let message = if all_valid {
        "All parameters are valid"
    } else {
        "Some parameters are not valid"
    };

    Ok(Json(ValidateResponse {
        success: all_valid,
        message: message.to_string(),
        results,
        valid_klpd: KLPD_LIST.iter().map(|k| k.kd_klpd).collect(),
        total_valid_klpd: KLPD_LIST.len(),
    }))
}

#[derive(Serialize)]
struct ConnectionResponse {
    success: bool,
    message: String,
    url: String,
    klpd: ParamEcho,
    tahun: ParamEcho,
    status: u16,
    response_time_ms: u64,
    timestamp: String,
}

async fn test_connection(
    State(orchestrator): State<Orchestrator>,
    Params(params): Params<KeyParams>,
) -> Result<Json<ConnectionResponse>, RupError> {
    let report = orchestrator
        .test_connection(params.klpd.as_deref(), params.tahun.as_deref())
        .await?;

    Ok(Json(ConnectionResponse {
        success: true,
        message: format!("Connection succeeded with HTTP {}", report.status),
        url: report.url,
        klpd: report.klpd,
        tahun: report.tahun,
        status: report.status,
        response_time_ms: report.response_time_ms,
        timestamp: timestamp(),
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    success: bool,
    message: &'static str,
    timestamp: String,
    data_loaded: bool,
    data_loading: bool,
    total_records: usize,
    current_url: String,
    current_klpd: String,
    current_tahun: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    cache_stats: CacheStats,
}

async fn health(State(orchestrator): State<Orchestrator>) -> Json<HealthResponse> {
    let status = orchestrator.status();
    Json(HealthResponse {
        success: true,
        message: "RUP API is running",
        timestamp: timestamp(),
        data_loaded: status.data_loaded,
        data_loading: status.data_loading,
        total_records: status.total_records,
        current_url: status.url,
        current_klpd: status.klpd,
        current_tahun: status.tahun,
        last_error: status.last_error,
        cache_stats: status.cache_stats,
    })
}

async fn debug(
    State(orchestrator): State<Orchestrator>,
    Params(params): Params<LimitParams>,
) -> Json<Value> {
    let limit = positive(params.limit.as_deref()).unwrap_or(DEFAULT_DEBUG_SAMPLE);
    Json(json!({
        "success": true,
        "message": "Debug information",
        "debug": orchestrator.debug(limit),
    }))
}

#[derive(Serialize)]
struct ConfigResponse {
    success: bool,
    message: String,
    klpd: String,
    tahun: String,
    url: String,
    data_loaded: bool,
    total_records: usize,
}

async fn get_config(State(orchestrator): State<Orchestrator>) -> Json<ConfigResponse> {
    let status = orchestrator.status();
    Json(ConfigResponse {
        success: true,
        message: "Current configuration".to_string(),
        klpd: status.klpd,
        tahun: status.tahun,
        url: status.url,
        data_loaded: status.data_loaded,
        total_records: status.total_records,
    })
}

#[derive(Deserialize, Debug, Default)]
struct ConfigRequest {
    klpd: Option<Value>,
    tahun: Option<Value>,
}

/// Accepts a JSON string or number.
fn value_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

async fn set_config(
    State(orchestrator): State<Orchestrator>,
    body: Result<Json<ConfigRequest>, JsonRejection>,
) -> Result<Json<Value>, RupError> {
    let request = match body {
        Ok(Json(request)) => request,
        // No body at all is reported below as missing parameters.
        Err(JsonRejection::MissingJsonContentType(_)) => ConfigRequest::default(),
        Err(rejection) => return Err(RupError::Validation(rejection.body_text())),
    };
    let klpd = value_text(request.klpd.as_ref());
    let tahun = value_text(request.tahun.as_ref());

    let (key, records) = orchestrator
        .select(klpd.as_deref(), tahun.as_deref())
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Configuration changed to KLPD {} tahun {}", key.klpd, key.tahun),
        "klpd": key.klpd,
        "tahun": key.tahun,
        "total_records": records.len(),
        "timestamp": timestamp(),
    })))
}

async fn refresh(State(orchestrator): State<Orchestrator>) -> Result<Json<Value>, RupError> {
    let records = orchestrator.refresh().await?;
    Ok(Json(json!({
        "success": true,
        "message": "Data refreshed",
        "total_records": records.len(),
        "timestamp": timestamp(),
    })))
}
