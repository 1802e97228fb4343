use crate::metrics_defs::{UPSTREAM_FETCH_DURATION, UPSTREAM_FETCH_ROWS};
use crate::types::{DatasetKey, RupRecord, json_type_name};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use shared::histogram;
use std::error::Error as _;
use std::fmt;
use std::io;
use tokio::time::{Duration, Instant};

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const CLIENT_USER_AGENT: &str = "RUP-API-Satker/1.0";

// Keys that may wrap the record array, in priority order.
const WRAPPER_KEYS: &[&str] = &["data", "results", "items"];

const REQUIRED_FIELDS: &[&str] = &["kd_satker"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Dns,
    ConnectionRefused,
    Timeout,
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NetworkErrorKind::Dns => "domain not found, check the network connection or URL",
            NetworkErrorKind::ConnectionRefused => "connection refused, the server may be unavailable",
            NetworkErrorKind::Timeout => "timeout, the server did not respond in time",
            NetworkErrorKind::Other => "network error",
        };
        f.write_str(text)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP {status}")]
    Http { status: u16 },
    #[error("data could not be parsed as JSON: {0}")]
    Parse(String),
    #[error("data is not a valid JSON array: {0}")]
    Schema(String),
    #[error("{kind} ({message})")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            classify_connect_error(&err)
        } else {
            NetworkErrorKind::Other
        };

        FetchError::Network {
            kind,
            message: err.to_string(),
        }
    }
}

/// Walks the error chain of a failed connection attempt to find out why it failed.
fn classify_connect_error(err: &reqwest::Error) -> NetworkErrorKind {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return NetworkErrorKind::ConnectionRefused,
                io::ErrorKind::TimedOut => return NetworkErrorKind::Timeout,
                _ => {}
            }
        }
        let text = cause.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return NetworkErrorKind::Dns;
        }
        source = cause.source();
    }
    NetworkErrorKind::Other
}

/// Result of a HEAD request against a dataset URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Probe {
    pub status: u16,
    pub response_time_ms: u64,
}

/// Where record sets come from.
#[async_trait]
pub trait RupSource: Send + Sync {
    async fn fetch(&self, key: &DatasetKey, url: &str) -> Result<Vec<RupRecord>, FetchError>;
    async fn probe(&self, url: &str) -> Result<Probe, FetchError>;
}

pub struct HttpSource {
    client: reqwest::Client,
    fetch_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpSource {
    pub fn new(fetch_timeout: Duration, probe_timeout: Duration) -> Self {
        HttpSource {
            client: reqwest::Client::new(),
            fetch_timeout,
            probe_timeout,
        }
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        HttpSource::new(FETCH_TIMEOUT, PROBE_TIMEOUT)
    }
}

#[async_trait]
impl RupSource for HttpSource {
    async fn fetch(&self, key: &DatasetKey, url: &str) -> Result<Vec<RupRecord>, FetchError> {
        let url = parse_url(url)?;
        let start = Instant::now();

        let response = self
            .client
            .get(url)
            .timeout(self.fetch_timeout)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Http {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.contains("application/json") && !content_type.contains("text/plain") {
            tracing::warn!(%key, %content_type, "upstream content type is not JSON");
        }

        let body = response.bytes().await?;
        let records = normalize_payload(key, parse_body(&body)?)?;

        let elapsed = start.elapsed();
        histogram!(UPSTREAM_FETCH_DURATION).record(elapsed.as_secs_f64());
        histogram!(UPSTREAM_FETCH_ROWS).record(records.len() as f64);
        tracing::info!(
            %key,
            records = records.len(),
            bytes = body.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "fetched upstream dataset"
        );

        Ok(records)
    }

    async fn probe(&self, url: &str) -> Result<Probe, FetchError> {
        let url = parse_url(url)?;
        let start = Instant::now();

        let response = self
            .client
            .head(url)
            .timeout(self.probe_timeout)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
            });
        }

        Ok(Probe {
            status: status.as_u16(),
            response_time_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn parse_url(url: &str) -> Result<Url, FetchError> {
    Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))
}

/// Parses a response body. A body that is a JSON string holding JSON is
/// unpacked once more.
pub fn parse_body(body: &[u8]) -> Result<Value, FetchError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| FetchError::Parse(e.to_string()))?;

    match value {
        Value::String(inner) => {
            serde_json::from_str(&inner).map_err(|e| FetchError::Parse(e.to_string()))
        }
        other => Ok(other),
    }
}

/// Turns the parsed payload into records. The array may arrive bare or
/// wrapped in an object under one of [`WRAPPER_KEYS`].
pub fn normalize_payload(key: &DatasetKey, value: Value) -> Result<Vec<RupRecord>, FetchError> {
    let value = match value {
        Value::Object(mut map) => {
            let wrapper = WRAPPER_KEYS
                .iter()
                .find(|k| map.get(**k).is_some_and(Value::is_array));
            match wrapper {
                Some(k) => map.remove(*k).unwrap_or_default(),
                None => {
                    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                    return Err(FetchError::Schema(format!(
                        "got an object with keys [{}]",
                        keys.join(", ")
                    )));
                }
            }
        }
        other => other,
    };

    let items = match value {
        Value::Array(items) => items,
        Value::Null => return Err(FetchError::Schema("got null".to_string())),
        other => {
            return Err(FetchError::Schema(format!("got {}", json_type_name(&other))));
        }
    };

    let total = items.len();
    let records: Vec<RupRecord> = items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(record) => Some(record),
            _ => None,
        })
        .collect();

    if records.len() < total {
        tracing::warn!(
            %key,
            dropped = total - records.len(),
            "ignoring array elements that are not objects"
        );
    }

    match records.first() {
        None => tracing::warn!(%key, "upstream returned no records"),
        Some(first) => {
            let missing: Vec<&str> = REQUIRED_FIELDS
                .iter()
                .copied()
                .filter(|field| !first.contains_key(*field))
                .collect();
            if !missing.is_empty() {
                let available: Vec<&str> = first.keys().map(String::as_str).collect();
                tracing::warn!(
                    %key,
                    missing = ?missing,
                    available = ?available,
                    "records are missing expected fields"
                );
            }
        }
    }

    Ok(records)
}
