use crate::cache::Clock;
use crate::config::Config;
use crate::fetcher::{FetchError, NetworkErrorKind, Probe, RupSource};
use crate::types::{DatasetKey, RupRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

pub fn record(value: Value) -> RupRecord {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

/// The two-satker dataset used across the orchestrator and API tests.
pub fn sample_records() -> Vec<RupRecord> {
    vec![
        record(json!({
            "kd_satker": 197,
            "nama_satker": "Dinas Pendidikan",
            "kd_klpd": "D197",
            "nama_klpd": "Provinsi Kalimantan Barat",
            "nama_paket": "Pengadaan Alat Tulis Kantor",
            "pagu": "500000000",
            "jenis_pengadaan": "Barang",
            "metode_pengadaan": "Tender",
            "provinsi": "Kalimantan Barat"
        })),
        record(json!({
            "kd_satker": "198",
            "nama_satker": "Dinas Kesehatan",
            "kd_klpd": "D197",
            "nama_klpd": "Provinsi Kalimantan Barat",
            "nama_paket": "Jasa Konsultansi Puskesmas",
            "pagu": 250000000,
            "jenis_pengadaan": "Jasa Konsultansi",
            "metode_pengadaan": "Seleksi",
            "provinsi": "Kalimantan Barat"
        })),
    ]
}

/// Default config with no delay between startup attempts.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.startup.retry_delay_secs = 0;
    config
}

/// In-memory [`RupSource`] that replays scripted results in order.
///
/// Each call to `fetch` pops the next result. Once the script runs out every
/// fetch fails with a network error. When a gate is set, fetches wait for a
/// permit before answering, which lets tests hold a load in flight.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Vec<RupRecord>, FetchError>>>,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
    probe: Mutex<Result<Probe, FetchError>>,
}

impl ScriptedSource {
    pub fn new<I>(script: I) -> Self
    where
        I: IntoIterator<Item = Result<Vec<RupRecord>, FetchError>>,
    {
        ScriptedSource {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            gate: None,
            probe: Mutex::new(Ok(Probe {
                status: 200,
                response_time_ms: 5,
            })),
        }
    }

    /// Holds every fetch until a permit is added to `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn set_probe(&self, result: Result<Probe, FetchError>) {
        *self.probe.lock() = result;
    }

    pub fn push(&self, result: Result<Vec<RupRecord>, FetchError>) {
        self.script.lock().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

pub fn network_error() -> FetchError {
    FetchError::Network {
        kind: NetworkErrorKind::Other,
        message: "connection reset".into(),
    }
}

#[async_trait]
impl RupSource for ScriptedSource {
    async fn fetch(&self, _key: &DatasetKey, url: &str) -> Result<Vec<RupRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());

        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|_| network_error())?;
            permit.forget();
        }

        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(network_error()))
    }

    async fn probe(&self, _url: &str) -> Result<Probe, FetchError> {
        self.probe.lock().clone()
    }
}
