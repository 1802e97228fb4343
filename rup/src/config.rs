use crate::params::{ParamValidator, RegionPolicy};
use crate::source::DEFAULT_BASE_URL;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use url::Url;

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 3000,
        }
    }
}

impl Listener {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Source {
    pub base_url: String,
    /// Fixed dataset URL used for every region and year when set.
    pub url_override: Option<String>,
    pub fetch_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for Source {
    fn default() -> Self {
        Source {
            base_url: DEFAULT_BASE_URL.into(),
            url_override: None,
            fetch_timeout_secs: 30,
            probe_timeout_secs: 10,
        }
    }
}

impl Source {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Defaults {
    pub klpd: String,
    #[serde(deserialize_with = "string_or_number")]
    pub tahun: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Defaults {
            klpd: "D197".into(),
            tahun: "2025".into(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Cache {
    pub ttl_secs: u64,
    /// Upper bound on cached datasets. Unbounded when unset.
    pub max_entries: Option<usize>,
    pub negative_ttl_secs: u64,
}

impl Default for Cache {
    fn default() -> Self {
        Cache {
            ttl_secs: 3600,
            max_entries: None,
            negative_ttl_secs: 30,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Startup {
    pub attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for Startup {
    fn default() -> Self {
        Startup {
            attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    pub admin_listener: Option<Listener>,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub region_policy: RegionPolicy,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub startup: Startup,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.listener.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if let Some(admin) = &self.admin_listener
            && (admin.port == 0
                || (admin.port == self.listener.port && admin.host == self.listener.host))
        {
            return Err(ValidationError::InvalidPort);
        }

        let validator = ParamValidator::new(self.region_policy);
        validator
            .validate_region(Some(self.defaults.klpd.as_str()))
            .into_result()
            .map_err(ValidationError::InvalidDefault)?;
        validator
            .validate_year(Some(self.defaults.tahun.as_str()))
            .into_result()
            .map_err(ValidationError::InvalidDefault)?;

        Url::parse(&self.source.base_url).map_err(|e| {
            ValidationError::InvalidUrl(format!("{}: {e}", self.source.base_url))
        })?;
        if let Some(url) = &self.source.url_override {
            Url::parse(url).map_err(|e| ValidationError::InvalidUrl(format!("{url}: {e}")))?;
        }
        if self.cache.ttl_secs == 0 {
            return Err(ValidationError::ZeroDuration("cache.ttl_secs"));
        }
        if self.source.fetch_timeout_secs == 0 {
            return Err(ValidationError::ZeroDuration("source.fetch_timeout_secs"));
        }
        if self.source.probe_timeout_secs == 0 {
            return Err(ValidationError::ZeroDuration("source.probe_timeout_secs"));
        }
        if self.cache.max_entries == Some(0) {
            return Err(ValidationError::NoCacheCapacity);
        }
        if self.startup.attempts == 0 {
            return Err(ValidationError::NoStartupAttempts);
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("listener ports must be non-zero and distinct")]
    InvalidPort,
    #[error("invalid default dataset: {0}")]
    InvalidDefault(String),
    #[error("invalid source url: {0}")]
    InvalidUrl(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("cache.max_entries must be greater than zero")]
    NoCacheCapacity,
    #[error("startup.attempts must be greater than zero")]
    NoStartupAttempts,
}

/// Accepts `tahun: 2025` as well as `tahun: "2025"`.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}
