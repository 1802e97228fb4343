//! Coordinates dataset selection, fetching and caching.
//!
//! The orchestrator tracks one "current" dataset that the listing endpoints
//! read from, and serves any other (KLPD, year) pair on demand through the
//! same cache. At most one fetch per dataset is in flight at a time.

use crate::cache::{CacheStats, CacheStore, Clock, SystemClock};
use crate::config::{Config, Startup};
use crate::fetcher::{FetchError, HttpSource, RupSource};
use crate::metrics_defs::{STALE_FALLBACK, UPSTREAM_FETCH_FAILED};
use crate::negative_cache::NegativeCache;
use crate::params::ParamValidator;
use crate::source::UrlBuilder;
use crate::types::{DatasetKey, RecordSet, RupRecord};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum RupError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    MissingParameter(String),
    #[error("No RUP data found for kd_satker {kd_satker} in KLPD {klpd} tahun {tahun}")]
    SatkerNotFound {
        kd_satker: String,
        klpd: String,
        tahun: String,
    },
    #[error(
        "RUP data for KLPD {klpd} tahun {tahun} has not been published or does not exist ({url})"
    )]
    NotPublished {
        klpd: String,
        tahun: String,
        url: String,
    },
    #[error("failed to load RUP data: {0}")]
    Fetch(FetchError),
    #[error("RUP data has not been loaded. Try POST /api/refresh")]
    NotLoaded,
    #[error("RUP data is still loading, try again shortly")]
    Loading,
    #[error("connection to {url} failed: {source}")]
    ConnectionFailed { url: String, source: FetchError },
}

impl RupError {
    fn from_fetch(key: &DatasetKey, url: &str, err: FetchError) -> Self {
        match err {
            FetchError::Http { status: 404 } => RupError::NotPublished {
                klpd: key.klpd.clone(),
                tahun: key.tahun.clone(),
                url: url.to_string(),
            },
            other => RupError::Fetch(other),
        }
    }
}

#[derive(Clone, Debug)]
pub enum LoadState {
    Idle,
    Loading,
    Loaded(RecordSet),
    Failed(String),
}

impl LoadState {
    fn name(&self) -> &'static str {
        match self {
            LoadState::Idle => "idle",
            LoadState::Loading => "loading",
            LoadState::Loaded(_) => "loaded",
            LoadState::Failed(_) => "failed",
        }
    }
}

struct Selection {
    key: DatasetKey,
    url: String,
    state: LoadState,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub klpd: String,
    pub tahun: String,
    pub url: String,
    pub data_loaded: bool,
    pub data_loading: bool,
    pub total_records: usize,
    pub last_error: Option<String>,
    pub cache_stats: CacheStats,
}

#[derive(Clone, Debug, Serialize)]
pub struct DebugSnapshot {
    pub current_klpd: String,
    pub current_tahun: String,
    pub current_url: String,
    pub url_overridden: bool,
    pub load_state: &'static str,
    pub last_error: Option<String>,
    pub total_records: usize,
    pub first_record_keys: Vec<String>,
    pub sample: Vec<RupRecord>,
    pub cache_ttl_secs: u64,
    pub cached_keys: Vec<String>,
    pub cache_stats: CacheStats,
}

/// How a request parameter was interpreted.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ParamEcho {
    pub input: String,
    pub normalized: String,
    pub changed: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ConnectionReport {
    pub url: String,
    pub klpd: ParamEcho,
    pub tahun: ParamEcho,
    pub status: u16,
    pub response_time_ms: u64,
}

struct OrchestratorInner {
    source: Arc<dyn RupSource>,
    urls: UrlBuilder,
    validator: ParamValidator,
    cache: CacheStore,
    negative_cache: NegativeCache,
    selection: RwLock<Selection>,
    in_flight: Mutex<HashMap<DatasetKey, Arc<tokio::sync::Mutex<()>>>>,
    startup: Startup,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn from_config(config: &Config) -> Result<Self, RupError> {
        let source = HttpSource::new(config.source.fetch_timeout(), config.source.probe_timeout());
        Orchestrator::new(config, Arc::new(source), Arc::new(SystemClock))
    }

    pub fn new(
        config: &Config,
        source: Arc<dyn RupSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RupError> {
        let validator = ParamValidator::new(config.region_policy);
        let klpd = validator
            .validate_region(Some(config.defaults.klpd.as_str()))
            .into_result()
            .map_err(RupError::Validation)?;
        let tahun = validator
            .validate_year(Some(config.defaults.tahun.as_str()))
            .into_result()
            .map_err(RupError::Validation)?;
        let key = DatasetKey::new(klpd, tahun);

        let urls = UrlBuilder::new(&config.source.base_url, config.source.url_override.clone());
        let url = urls.build(&key);

        let cache = CacheStore::new(
            Duration::from_secs(config.cache.ttl_secs),
            config.cache.max_entries,
            clock,
        );

        Ok(Orchestrator {
            inner: Arc::new(OrchestratorInner {
                source,
                urls,
                validator,
                cache,
                negative_cache: NegativeCache::new(Duration::from_secs(
                    config.cache.negative_ttl_secs,
                )),
                selection: RwLock::new(Selection {
                    key,
                    url,
                    state: LoadState::Idle,
                }),
                in_flight: Mutex::new(HashMap::new()),
                startup: config.startup.clone(),
            }),
        })
    }

    pub fn validator(&self) -> &ParamValidator {
        &self.inner.validator
    }

    pub fn current_key(&self) -> DatasetKey {
        self.inner.selection.read().key.clone()
    }

    pub fn url_for(&self, key: &DatasetKey) -> String {
        self.inner.urls.build(key)
    }

    /// Validates the given parameters, taking any that are missing or empty
    /// from the current selection.
    pub fn resolve_key(
        &self,
        klpd: Option<&str>,
        tahun: Option<&str>,
    ) -> Result<DatasetKey, RupError> {
        let current = self.current_key();
        let klpd = non_empty(klpd).unwrap_or(current.klpd.as_str());
        let tahun = non_empty(tahun).unwrap_or(current.tahun.as_str());

        let klpd = self
            .inner
            .validator
            .validate_region(Some(klpd))
            .into_result()
            .map_err(RupError::Validation)?;
        let tahun = self
            .inner
            .validator
            .validate_year(Some(tahun))
            .into_result()
            .map_err(RupError::Validation)?;

        Ok(DatasetKey::new(klpd, tahun))
    }

    /// Returns the records for `key`, fetching them if no fresh copy is cached.
    ///
    /// If the fetch fails and an expired copy exists, the expired copy is
    /// returned instead of the error.
    pub async fn records_for(&self, key: &DatasetKey) -> Result<RecordSet, RupError> {
        if let Some(records) = self.inner.cache.get(key) {
            self.mark_loaded(key, &records);
            return Ok(records);
        }

        let lock = self.flight_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.load(key).await
        };
        self.release_flight_lock(key, lock);
        result
    }

    /// Fetches `key` while holding its flight lock.
    async fn load(&self, key: &DatasetKey) -> Result<RecordSet, RupError> {
        // Another request may have finished the fetch while we waited.
        if let Some(records) = self.inner.cache.get(key) {
            self.mark_loaded(key, &records);
            return Ok(records);
        }

        self.mark_loading(key);
        let url = self.inner.urls.build(key);

        let result = if self.inner.negative_cache.contains(key) {
            tracing::debug!(%key, "dataset recently not found, skipping fetch");
            Err(FetchError::Http { status: 404 })
        } else {
            tracing::info!(%key, %url, "fetching dataset");
            let result = self.inner.source.fetch(key, &url).await;
            match &result {
                Err(FetchError::Http { status: 404 }) => {
                    counter!(UPSTREAM_FETCH_FAILED).increment(1);
                    self.inner.negative_cache.insert(key);
                }
                Err(_) => counter!(UPSTREAM_FETCH_FAILED).increment(1),
                Ok(_) => {}
            }
            result
        };

        match result {
            Ok(records) => {
                let records = Arc::new(records);
                self.inner.cache.set(key.clone(), records.clone());
                self.mark_loaded(key, &records);
                Ok(records)
            }
            Err(err) => {
                if let Some(stale) = self.inner.cache.get_stale(key) {
                    counter!(STALE_FALLBACK).increment(1);
                    tracing::warn!(
                        %key,
                        error = %err,
                        records = stale.len(),
                        "fetch failed, serving stale data"
                    );
                    self.mark_loaded(key, &stale);
                    return Ok(stale);
                }

                let err = RupError::from_fetch(key, &url, err);
                tracing::error!(%key, error = %err, "fetch failed");
                self.mark_failed(key, &err);
                Err(err)
            }
        }
    }

    /// Records of the current selection. Never fetches.
    pub fn current_records(&self) -> Result<RecordSet, RupError> {
        match &self.inner.selection.read().state {
            LoadState::Loaded(records) => Ok(records.clone()),
            LoadState::Loading => Err(RupError::Loading),
            LoadState::Idle | LoadState::Failed(_) => Err(RupError::NotLoaded),
        }
    }

    /// Switches the current selection and loads it.
    pub async fn select(
        &self,
        klpd: Option<&str>,
        tahun: Option<&str>,
    ) -> Result<(DatasetKey, RecordSet), RupError> {
        if non_empty(klpd).is_none() && non_empty(tahun).is_none() {
            return Err(RupError::MissingParameter(
                "klpd or tahun must be provided".to_string(),
            ));
        }

        let key = self.resolve_key(klpd, tahun)?;
        {
            let mut selection = self.inner.selection.write();
            if selection.key != key {
                tracing::info!(from = %selection.key, to = %key, "switching current dataset");
            }
            selection.url = self.inner.urls.build(&key);
            selection.key = key.clone();
            selection.state = LoadState::Idle;
        }
        self.inner.negative_cache.remove(&key);

        let records = self.records_for(&key).await?;
        Ok((key, records))
    }

    /// Drops the current dataset from the caches and fetches it again.
    pub async fn refresh(&self) -> Result<RecordSet, RupError> {
        let key = {
            let mut selection = self.inner.selection.write();
            selection.state = LoadState::Idle;
            selection.key.clone()
        };

        self.inner.cache.delete(&key);
        self.inner.negative_cache.remove(&key);
        tracing::info!(%key, "refreshing dataset");

        self.records_for(&key).await
    }

    /// Loads the current dataset, retrying as configured.
    pub async fn initialize(&self) -> Result<RecordSet, RupError> {
        let key = self.current_key();
        let attempts = self.inner.startup.attempts;
        let delay = Duration::from_secs(self.inner.startup.retry_delay_secs);

        let mut last_error = RupError::NotLoaded;
        for attempt in 1..=attempts {
            // Each attempt goes to the upstream, even after a 404.
            self.inner.negative_cache.remove(&key);
            match self.records_for(&key).await {
                Ok(records) => {
                    tracing::info!(%key, records = records.len(), attempt, "initial data loaded");
                    return Ok(records);
                }
                Err(err) => {
                    tracing::warn!(%key, attempt, attempts, error = %err, "initial load failed");
                    last_error = err;
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::error!(%key, "giving up on initial load, serving without data");
        Err(last_error)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.inner.selection.read().state, LoadState::Loaded(_))
    }

    pub fn status(&self) -> StatusSnapshot {
        let selection = self.inner.selection.read();
        let (total_records, last_error) = match &selection.state {
            LoadState::Loaded(records) => (records.len(), None),
            LoadState::Failed(err) => (0, Some(err.clone())),
            LoadState::Idle | LoadState::Loading => (0, None),
        };

        StatusSnapshot {
            klpd: selection.key.klpd.clone(),
            tahun: selection.key.tahun.clone(),
            url: selection.url.clone(),
            data_loaded: matches!(selection.state, LoadState::Loaded(_)),
            data_loading: matches!(selection.state, LoadState::Loading),
            total_records,
            last_error,
            cache_stats: self.inner.cache.stats(),
        }
    }

    /// Raw view of the current state, including up to `limit` sample records.
    pub fn debug(&self, limit: usize) -> DebugSnapshot {
        let (key, url, state) = {
            let selection = self.inner.selection.read();
            (
                selection.key.clone(),
                selection.url.clone(),
                selection.state.clone(),
            )
        };

        let (records, last_error) = match &state {
            LoadState::Loaded(records) => (Some(records.clone()), None),
            LoadState::Failed(err) => (None, Some(err.clone())),
            LoadState::Idle | LoadState::Loading => (None, None),
        };
        let records = records.unwrap_or_default();

        DebugSnapshot {
            current_klpd: key.klpd,
            current_tahun: key.tahun,
            current_url: url,
            url_overridden: self.inner.urls.is_overridden(),
            load_state: state.name(),
            last_error,
            total_records: records.len(),
            first_record_keys: records
                .first()
                .map(|r| r.keys().cloned().collect())
                .unwrap_or_default(),
            sample: records.iter().take(limit).cloned().collect(),
            cache_ttl_secs: self.inner.cache.ttl().as_secs(),
            cached_keys: self.inner.cache.keys(),
            cache_stats: self.inner.cache.stats(),
        }
    }

    /// Sends a HEAD request for the dataset URL without loading it.
    pub async fn test_connection(
        &self,
        klpd: Option<&str>,
        tahun: Option<&str>,
    ) -> Result<ConnectionReport, RupError> {
        let current = self.current_key();
        let klpd_input = non_empty(klpd).unwrap_or(current.klpd.as_str()).to_string();
        let tahun_input = non_empty(tahun).unwrap_or(current.tahun.as_str()).to_string();

        let key = self.resolve_key(Some(&klpd_input), Some(&tahun_input))?;
        let url = self.inner.urls.build(&key);

        let probe = self
            .inner
            .source
            .probe(&url)
            .await
            .map_err(|source| RupError::ConnectionFailed {
                url: url.clone(),
                source,
            })?;

        Ok(ConnectionReport {
            url,
            klpd: ParamEcho {
                changed: klpd_input != key.klpd,
                input: klpd_input,
                normalized: key.klpd,
            },
            tahun: ParamEcho {
                changed: tahun_input != key.tahun,
                input: tahun_input,
                normalized: key.tahun,
            },
            status: probe.status,
            response_time_ms: probe.response_time_ms,
        })
    }

    fn flight_lock(&self, key: &DatasetKey) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .in_flight
            .lock()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn release_flight_lock(&self, key: &DatasetKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.inner.in_flight.lock();
        drop(lock);
        if in_flight
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            in_flight.remove(key);
        }
    }

    fn mark_loading(&self, key: &DatasetKey) {
        let mut selection = self.inner.selection.write();
        if selection.key == *key && !matches!(selection.state, LoadState::Loaded(_)) {
            selection.state = LoadState::Loading;
        }
    }

    fn mark_loaded(&self, key: &DatasetKey, records: &RecordSet) {
        let mut selection = self.inner.selection.write();
        if selection.key == *key {
            selection.state = LoadState::Loaded(records.clone());
        }
    }

    fn mark_failed(&self, key: &DatasetKey, err: &RupError) {
        let mut selection = self.inner.selection.write();
        if selection.key == *key {
            selection.state = LoadState::Failed(err.to_string());
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{
        ManualClock, ScriptedSource, network_error, record, sample_records, test_config,
    };
    use crate::fetcher::Probe;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use serde_json::json;
    use tokio::sync::Semaphore;

    fn orchestrator(source: Arc<ScriptedSource>) -> (Orchestrator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let orchestrator = Orchestrator::new(&test_config(), source, clock.clone()).unwrap();
        (orchestrator, clock)
    }

    fn other_records() -> Vec<RupRecord> {
        vec![record(json!({"kd_satker": 555, "nama_satker": "Dinas Sosial"}))]
    }

    #[tokio::test]
    async fn test_initialize_loads_current() {
        let source = Arc::new(ScriptedSource::new([Ok(sample_records())]));
        let (orchestrator, _) = orchestrator(source.clone());

        assert!(matches!(orchestrator.current_records(), Err(RupError::NotLoaded)));
        assert!(!orchestrator.is_ready());

        let records = orchestrator.initialize().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(orchestrator.current_records().unwrap().len(), 2);
        assert!(orchestrator.is_ready());
        assert_eq!(
            source.urls(),
            vec!["https://s3-sip.pbj.my.id/rup/D197/RUP-PaketPenyedia-Terumumkan/2025/data.json"]
        );

        let status = orchestrator.status();
        assert!(status.data_loaded);
        assert!(!status.data_loading);
        assert_eq!(status.total_records, 2);
        assert_eq!(status.cache_stats.keys, 1);
    }

    #[tokio::test]
    async fn test_cached_records_skip_fetch() {
        let source = Arc::new(ScriptedSource::new([Ok(sample_records())]));
        let (orchestrator, clock) = orchestrator(source.clone());
        let key = DatasetKey::new("D197", "2025");

        orchestrator.records_for(&key).await.unwrap();
        clock.advance(Duration::from_secs(60));
        orchestrator.records_for(&key).await.unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(ScriptedSource::new([Ok(sample_records())]).gated(gate.clone()));
        let (orchestrator, _) = orchestrator(source.clone());
        let key = orchestrator.current_key();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                let key = key.clone();
                tokio::spawn(async move { orchestrator.records_for(&key).await })
            })
            .collect();

        while source.calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(matches!(orchestrator.current_records(), Err(RupError::Loading)));
        assert!(orchestrator.status().data_loading);

        gate.add_permits(1);
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 2);
        }
        assert_eq!(source.calls(), 1);
        assert!(orchestrator.is_ready());
        assert!(orchestrator.inner.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stale_fallback() {
        let source = Arc::new(ScriptedSource::new([Ok(sample_records()), Err(network_error())]));
        let (orchestrator, clock) = orchestrator(source.clone());
        let key = orchestrator.current_key();

        let fresh = orchestrator.records_for(&key).await.unwrap();
        clock.advance(Duration::from_secs(3601));

        let stale = orchestrator.records_for(&key).await.unwrap();
        assert_eq!(source.calls(), 2);
        assert!(Arc::ptr_eq(&fresh, &stale));
        assert!(orchestrator.is_ready());
    }

    #[tokio::test]
    async fn test_failure_without_fallback() {
        let source = Arc::new(ScriptedSource::new([Err(FetchError::Http { status: 500 })]));
        let (orchestrator, _) = orchestrator(source.clone());
        let key = orchestrator.current_key();

        let err = orchestrator.records_for(&key).await.unwrap_err();
        assert!(matches!(err, RupError::Fetch(FetchError::Http { status: 500 })));
        assert!(matches!(orchestrator.current_records(), Err(RupError::NotLoaded)));

        let status = orchestrator.status();
        assert!(!status.data_loaded);
        assert!(status.last_error.unwrap().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_not_published_is_remembered() {
        let source = Arc::new(ScriptedSource::new([Err(FetchError::Http { status: 404 })]));
        let (orchestrator, _) = orchestrator(source.clone());
        let key = DatasetKey::new("D198", "2030");

        for _ in 0..3 {
            let err = orchestrator.records_for(&key).await.unwrap_err();
            let RupError::NotPublished { klpd, tahun, url } = err else {
                panic!("unexpected error: {err}");
            };
            assert_eq!((klpd.as_str(), tahun.as_str()), ("D198", "2030"));
            assert!(url.ends_with("/rup/D198/RUP-PaketPenyedia-Terumumkan/2030/data.json"));
        }
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn test_not_found_hits_are_not_fetch_failures() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let source = Arc::new(ScriptedSource::new([Err(FetchError::Http { status: 404 })]));
        let (orchestrator, _) = orchestrator(source.clone());
        let key = DatasetKey::new("D198", "2030");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                for _ in 0..3 {
                    assert!(orchestrator.records_for(&key).await.is_err());
                }
            })
        });

        let counters: HashMap<String, u64> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter_map(|(key, _, _, value)| match value {
                DebugValue::Counter(n) => Some((key.key().name().to_string(), n)),
                _ => None,
            })
            .collect();
        assert_eq!(source.calls(), 1);
        assert_eq!(counters["upstream.fetch.failed"], 1);
        assert_eq!(counters["negative_cache.hit"], 2);
    }

    #[tokio::test]
    async fn test_refresh_refetches() {
        let source = Arc::new(ScriptedSource::new([
            Err(FetchError::Http { status: 404 }),
            Ok(sample_records()),
            Ok(other_records()),
        ]));
        let (orchestrator, _) = orchestrator(source.clone());
        let key = orchestrator.current_key();

        assert!(orchestrator.records_for(&key).await.is_err());

        // Refresh bypasses the not-found memory as well as the cache.
        assert_eq!(orchestrator.refresh().await.unwrap().len(), 2);
        assert_eq!(orchestrator.refresh().await.unwrap().len(), 1);
        assert_eq!(source.calls(), 3);
        assert_eq!(orchestrator.current_records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_select_switches_current() {
        let source = Arc::new(ScriptedSource::new([Ok(sample_records()), Ok(other_records())]));
        let (orchestrator, _) = orchestrator(source.clone());
        orchestrator.initialize().await.unwrap();

        let (key, records) = orchestrator.select(Some(" d198 "), None).await.unwrap();
        assert_eq!(key, DatasetKey::new("D198", "2025"));
        assert_eq!(records.len(), 1);
        assert_eq!(orchestrator.current_key(), key);
        assert_eq!(orchestrator.current_records().unwrap().len(), 1);

        // The previous dataset is still cached.
        let previous = DatasetKey::new("D197", "2025");
        assert_eq!(orchestrator.records_for(&previous).await.unwrap().len(), 2);
        assert_eq!(source.calls(), 2);
        assert_eq!(orchestrator.current_key(), key);

        // Selecting back is served from the cache.
        orchestrator.select(Some("D197"), Some("2025")).await.unwrap();
        assert_eq!(orchestrator.current_records().unwrap().len(), 2);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_select_rejects_bad_input() {
        let source = Arc::new(ScriptedSource::new([]));
        let (orchestrator, _) = orchestrator(source.clone());

        assert!(matches!(
            orchestrator.select(None, Some("  ")).await,
            Err(RupError::MissingParameter(_))
        ));
        assert!(matches!(
            orchestrator.select(Some("D999"), None).await,
            Err(RupError::Validation(_))
        ));
        assert_eq!(orchestrator.current_key(), DatasetKey::new("D197", "2025"));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_parameterized_read_keeps_selection() {
        let source = Arc::new(ScriptedSource::new([Ok(other_records())]));
        let (orchestrator, _) = orchestrator(source.clone());

        let key = orchestrator.resolve_key(Some("D198"), None).unwrap();
        orchestrator.records_for(&key).await.unwrap();

        assert_eq!(orchestrator.current_key(), DatasetKey::new("D197", "2025"));
        assert!(matches!(orchestrator.current_records(), Err(RupError::NotLoaded)));
    }

    #[tokio::test]
    async fn test_resolve_key() {
        let source = Arc::new(ScriptedSource::new([]));
        let (orchestrator, _) = orchestrator(source);

        assert_eq!(
            orchestrator.resolve_key(None, None).unwrap(),
            DatasetKey::new("D197", "2025")
        );
        assert_eq!(
            orchestrator.resolve_key(Some(""), Some(" 2024 ")).unwrap(),
            DatasetKey::new("D197", "2024")
        );
        let err = orchestrator.resolve_key(None, Some("2019")).unwrap_err();
        assert!(err.to_string().contains("2020-2030"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_retries() {
        let source = Arc::new(ScriptedSource::new([
            Err(network_error()),
            Err(network_error()),
            Ok(sample_records()),
        ]));
        let mut config = test_config();
        config.startup.retry_delay_secs = 5;
        let orchestrator =
            Orchestrator::new(&config, source.clone(), Arc::new(ManualClock::new())).unwrap();

        let start = tokio::time::Instant::now();
        orchestrator.initialize().await.unwrap();
        assert_eq!(source.calls(), 3);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(orchestrator.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_retries_after_not_found() {
        let source = Arc::new(ScriptedSource::new([
            Err(FetchError::Http { status: 404 }),
            Ok(sample_records()),
        ]));
        let mut config = test_config();
        config.startup.retry_delay_secs = 5;
        let orchestrator =
            Orchestrator::new(&config, source.clone(), Arc::new(ManualClock::new())).unwrap();

        assert_eq!(orchestrator.initialize().await.unwrap().len(), 2);
        assert_eq!(source.calls(), 2);
        assert!(orchestrator.is_ready());
    }

    #[tokio::test]
    async fn test_select_retries_not_found() {
        let source = Arc::new(ScriptedSource::new([
            Err(FetchError::Http { status: 404 }),
            Ok(other_records()),
        ]));
        let (orchestrator, _) = orchestrator(source.clone());
        let key = DatasetKey::new("D198", "2025");

        assert!(matches!(
            orchestrator.records_for(&key).await,
            Err(RupError::NotPublished { .. })
        ));
        let (_, records) = orchestrator.select(Some("D198"), None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_flight_locks_released() {
        let source = Arc::new(ScriptedSource::new([
            Ok(sample_records()),
            Err(FetchError::Http { status: 404 }),
        ]));
        let (orchestrator, _) = orchestrator(source);

        orchestrator.initialize().await.unwrap();
        let _ = orchestrator.records_for(&DatasetKey::new("D198", "2030")).await;
        let _ = orchestrator.records_for(&DatasetKey::new("D198", "2030")).await;
        assert!(orchestrator.inner.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_gives_up() {
        let source = Arc::new(ScriptedSource::new([]));
        let (orchestrator, _) = orchestrator(source.clone());

        assert!(orchestrator.initialize().await.is_err());
        assert_eq!(source.calls(), 3);
        assert!(matches!(orchestrator.current_records(), Err(RupError::NotLoaded)));
        assert!(orchestrator.status().last_error.is_some());
    }

    #[tokio::test]
    async fn test_debug_snapshot() {
        let source = Arc::new(ScriptedSource::new([Ok(sample_records())]));
        let (orchestrator, _) = orchestrator(source);

        let before = orchestrator.debug(5);
        assert_eq!(before.load_state, "idle");
        assert!(before.sample.is_empty());

        orchestrator.initialize().await.unwrap();
        let after = orchestrator.debug(1);
        assert_eq!(after.load_state, "loaded");
        assert_eq!(after.total_records, 2);
        assert_eq!(after.sample.len(), 1);
        assert_eq!(after.first_record_keys[0], "kd_satker");
        assert_eq!(after.cached_keys, vec!["D197_2025".to_string()]);
        assert_eq!(after.cache_ttl_secs, 3600);
    }

    #[tokio::test]
    async fn test_connection_report() {
        let source = Arc::new(ScriptedSource::new([]));
        let (orchestrator, _) = orchestrator(source.clone());

        let report = orchestrator
            .test_connection(Some(" d198 "), None)
            .await
            .unwrap();
        assert_eq!(report.klpd.normalized, "D198");
        assert!(report.klpd.changed);
        assert_eq!(report.tahun.input, "2025");
        assert!(!report.tahun.changed);
        assert_eq!(report.status, 200);

        source.set_probe(Err(FetchError::Http { status: 403 }));
        assert!(matches!(
            orchestrator.test_connection(None, None).await,
            Err(RupError::ConnectionFailed { .. })
        ));
        // Probing never loads data.
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_defaults_rejected() {
        let mut config = test_config();
        config.defaults.klpd = "nope".into();
        let result = Orchestrator::new(
            &config,
            Arc::new(ScriptedSource::new([])),
            Arc::new(ManualClock::new()),
        );
        assert!(matches!(result, Err(RupError::Validation(_))));
    }

    #[tokio::test]
    async fn test_probe_type_is_passed_through() {
        let source = Arc::new(ScriptedSource::new([]));
        source.set_probe(Ok(Probe {
            status: 204,
            response_time_ms: 12,
        }));
        let (orchestrator, _) = orchestrator(source);
        let report = orchestrator.test_connection(None, None).await.unwrap();
        assert_eq!((report.status, report.response_time_ms), (204, 12));
    }
}
