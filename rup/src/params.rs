//! Normalization and validation of the region (KLPD) and year (tahun)
//! parameters that select an upstream dataset.

use serde::{Deserialize, Serialize};

pub const MIN_TAHUN: i32 = 2020;
pub const MAX_TAHUN: i32 = 2030;

/// Number of valid codes quoted in a region validation error.
const SAMPLE_SIZE: usize = 10;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct KlpdInfo {
    pub kd_klpd: &'static str,
    pub nama_klpd: &'static str,
}

/// Province of West Kalimantan and its regencies/cities.
pub const KLPD_LIST: &[KlpdInfo] = &[
    KlpdInfo { kd_klpd: "D197", nama_klpd: "Provinsi Kalimantan Barat" },
    KlpdInfo { kd_klpd: "D198", nama_klpd: "Kabupaten Sekadau" },
    KlpdInfo { kd_klpd: "D199", nama_klpd: "Kota Pontianak" },
    KlpdInfo { kd_klpd: "D200", nama_klpd: "Kota Singkawang" },
    KlpdInfo { kd_klpd: "D201", nama_klpd: "Kabupaten Ketapang" },
    KlpdInfo { kd_klpd: "D202", nama_klpd: "Kabupaten Kubu Raya" },
    KlpdInfo { kd_klpd: "D204", nama_klpd: "Kabupaten Sanggau" },
    KlpdInfo { kd_klpd: "D205", nama_klpd: "Kabupaten Landak" },
    KlpdInfo { kd_klpd: "D206", nama_klpd: "Kabupaten Bengkayang" },
    KlpdInfo { kd_klpd: "D209", nama_klpd: "Kabupaten Kapuas Hulu" },
    KlpdInfo { kd_klpd: "D210", nama_klpd: "Kabupaten Melawi" },
    KlpdInfo { kd_klpd: "D211", nama_klpd: "Kabupaten Sintang" },
    KlpdInfo { kd_klpd: "D552", nama_klpd: "Kabupaten Mempawah" },
];

/// Which region codes are accepted.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegionPolicy {
    /// Only codes from [`KLPD_LIST`].
    #[default]
    AllowList,
    /// Any non-empty alphanumeric code.
    Any,
}

/// Outcome of validating a single parameter.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub normalized: Option<String>,
    pub error: Option<String>,
}

impl Validation {
    fn ok(normalized: String) -> Self {
        Validation {
            valid: true,
            normalized: Some(normalized),
            error: None,
        }
    }

    fn invalid(normalized: Option<String>, error: String) -> Self {
        Validation {
            valid: false,
            normalized,
            error: Some(error),
        }
    }

    /// The normalized value, or the error message.
    pub fn into_result(self) -> Result<String, String> {
        match (self.valid, self.normalized, self.error) {
            (true, Some(normalized), _) => Ok(normalized),
            (_, _, Some(error)) => Err(error),
            _ => Err("invalid value".to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParamValidator {
    policy: RegionPolicy,
}

impl ParamValidator {
    pub fn new(policy: RegionPolicy) -> Self {
        ParamValidator { policy }
    }

    pub fn policy(&self) -> RegionPolicy {
        self.policy
    }

    /// Uppercases and trims the code, then checks it against the policy.
    pub fn validate_region(&self, input: Option<&str>) -> Validation {
        let normalized = match input.map(str::trim) {
            Some(s) if !s.is_empty() => s.to_uppercase(),
            _ => return Validation::invalid(None, "KLPD must not be empty".to_string()),
        };

        let accepted = match self.policy {
            RegionPolicy::AllowList => KLPD_LIST.iter().any(|k| k.kd_klpd == normalized),
            RegionPolicy::Any => normalized.chars().all(|c| c.is_ascii_alphanumeric()),
        };

        if accepted {
            return Validation::ok(normalized);
        }

        let error = match self.policy {
            RegionPolicy::AllowList => format!(
                "KLPD '{normalized}' is not valid. Available KLPD: {}...",
                self.sample_codes().join(", ")
            ),
            RegionPolicy::Any => {
                format!("KLPD '{normalized}' is not valid. Codes may only contain letters and digits")
            }
        };
        Validation::invalid(Some(normalized), error)
    }

    /// Trims and parses the year, which must fall within [`MIN_TAHUN`, `MAX_TAHUN`].
    pub fn validate_year(&self, input: Option<&str>) -> Validation {
        let trimmed = match input.map(str::trim) {
            Some(s) if !s.is_empty() => s,
            _ => return Validation::invalid(None, "Tahun must not be empty".to_string()),
        };

        match trimmed.parse::<i32>() {
            Ok(year) if (MIN_TAHUN..=MAX_TAHUN).contains(&year) => Validation::ok(year.to_string()),
            _ => Validation::invalid(
                Some(trimmed.to_string()),
                format!("Tahun '{trimmed}' is not valid. Tahun must be between {MIN_TAHUN}-{MAX_TAHUN}"),
            ),
        }
    }

    /// The first few valid codes, as quoted in error messages.
    pub fn sample_codes(&self) -> Vec<&'static str> {
        KLPD_LIST
            .iter()
            .take(SAMPLE_SIZE)
            .map(|k| k.kd_klpd)
            .collect()
    }
}
