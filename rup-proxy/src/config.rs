use rup::config::{Config as RupConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;

#[derive(Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    /// Filter directive used when `RUST_LOG` is not set.
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".into()
}

#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub rup: RupConfig,
}

/// Values taken from the command line or environment, which win over the
/// config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub default_klpd: Option<String>,
    pub default_tahun: Option<String>,
    pub data_url: Option<String>,
    pub port: Option<u16>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(klpd) = overrides.default_klpd {
            self.rup.defaults.klpd = klpd;
        }
        if let Some(tahun) = overrides.default_tahun {
            self.rup.defaults.tahun = tahun;
        }
        if let Some(url) = overrides.data_url.filter(|u| !u.trim().is_empty()) {
            self.rup.source.url_override = Some(url);
        }
        if let Some(port) = overrides.port {
            self.rup.listener.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rup.validate()?;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}
