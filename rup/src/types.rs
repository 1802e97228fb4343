use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// One procurement package as published upstream. Field order is preserved
/// and unknown fields pass through untouched.
pub type RupRecord = Map<String, Value>;

/// Records in upstream order, shared between the cache and readers.
pub type RecordSet = Arc<Vec<RupRecord>>;

/// Normalized (KLPD, year) pair identifying one upstream file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct DatasetKey {
    pub klpd: String,
    pub tahun: String,
}

impl DatasetKey {
    pub fn new<K, T>(klpd: K, tahun: T) -> Self
    where
        K: Into<String>,
        T: Into<String>,
    {
        DatasetKey {
            klpd: klpd.into(),
            tahun: tahun.into(),
        }
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.klpd, self.tahun)
    }
}

/// Type name of a JSON value as a JavaScript client would report it.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null | Value::Array(_) | Value::Object(_) => "object",
    }
}
