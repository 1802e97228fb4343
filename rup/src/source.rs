use crate::types::DatasetKey;

pub const DEFAULT_BASE_URL: &str = "https://s3-sip.pbj.my.id";

/// Builds the upstream URL for a dataset. Inputs must already be validated.
#[derive(Clone, Debug)]
pub struct UrlBuilder {
    base_url: String,
    url_override: Option<String>,
}

impl UrlBuilder {
    pub fn new(base_url: &str, url_override: Option<String>) -> Self {
        UrlBuilder {
            base_url: base_url.trim_end_matches('/').to_string(),
            url_override,
        }
    }

    pub fn build(&self, key: &DatasetKey) -> String {
        // The override pins every dataset to a single file.
        if let Some(url) = &self.url_override {
            return url.clone();
        }

        format!(
            "{}/rup/{}/RUP-PaketPenyedia-Terumumkan/{}/data.json",
            self.base_url, key.klpd, key.tahun
        )
    }

    pub fn is_overridden(&self) -> bool {
        self.url_override.is_some()
    }
}
