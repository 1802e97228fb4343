//! Filters, searches and aggregates over a record set. None of these fail:
//! missing or oddly typed fields simply do not match, or fall into the
//! [`UNKNOWN`] bucket.

use crate::types::{RupRecord, json_type_name};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashSet;

/// Placeholder for absent names and breakdown labels.
pub const UNKNOWN: &str = "Tidak Diketahui";

pub const DEFAULT_PARTIAL_LIMIT: usize = 10;
pub const DEFAULT_PAGE_LIMIT: usize = 10;

const SEARCH_FIELDS: &[&str] = &[
    "kd_satker",
    "nama_satker",
    "nama_paket",
    "nama_klpd",
    "jenis_pengadaan",
    "metode_pengadaan",
];

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SatkerSummary {
    pub kd_satker: Value,
    pub nama_satker: Value,
    pub nama_klpd: Value,
    pub kd_klpd: Value,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SatkerMatch {
    pub kd_satker: Value,
    pub nama_satker: Value,
    pub nama_klpd: Value,
    pub count: usize,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct Stats {
    pub total_records: usize,
    pub total_satker: usize,
    pub total_provinsi: usize,
    pub total_pagu: f64,
    pub breakdown_jenis: IndexMap<String, usize>,
    pub breakdown_metode: IndexMap<String, usize>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Column {
    pub column_name: String,
    pub column_type: &'static str,
}

/// Text form of a scalar field, `None` for missing, null or composite values.
fn field_text<'a>(record: &'a RupRecord, field: &str) -> Option<Cow<'a, str>> {
    match record.get(field)? {
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        _ => None,
    }
}

/// Integer identity of a satker code, whether stored as number or string.
pub fn satker_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Grouping key for a record's satker: the integer identity when there is
/// one, the trimmed text otherwise.
fn satker_key(record: &RupRecord) -> Option<String> {
    let value = record.get("kd_satker")?;
    if let Some(number) = satker_number(value) {
        return Some(number.to_string());
    }
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn label(record: &RupRecord, field: &str) -> String {
    match field_text(record, field) {
        Some(text) if !text.is_empty() => text.into_owned(),
        _ => UNKNOWN.to_string(),
    }
}

fn value_or_unknown(record: &RupRecord, field: &str) -> Value {
    match record.get(field) {
        Some(Value::Null) | None => Value::String(UNKNOWN.to_string()),
        Some(Value::String(s)) if s.is_empty() => Value::String(UNKNOWN.to_string()),
        Some(value) => value.clone(),
    }
}

/// Records whose `kd_satker` is numerically equal to `code`. A code that is
/// not an integer matches nothing.
pub fn filter_by_satker(records: &[RupRecord], code: &str) -> Vec<RupRecord> {
    let Ok(wanted) = code.trim().parse::<i64>() else {
        return Vec::new();
    };

    records
        .iter()
        .filter(|record| {
            record
                .get("kd_satker")
                .and_then(satker_number)
                .is_some_and(|n| n == wanted)
        })
        .cloned()
        .collect()
}

/// Case-insensitive substring search across the descriptive fields. An
/// empty term returns every record.
pub fn search(records: &[RupRecord], term: &str) -> Vec<RupRecord> {
    if term.is_empty() {
        return records.to_vec();
    }

    let term = term.to_lowercase();
    records
        .iter()
        .filter(|record| {
            SEARCH_FIELDS.iter().any(|field| {
                field_text(record, field).is_some_and(|text| text.to_lowercase().contains(&term))
            })
        })
        .cloned()
        .collect()
}

/// One entry per satker, first occurrence wins, ordered by code.
pub fn list_distinct_satker(records: &[RupRecord]) -> Vec<SatkerSummary> {
    let mut seen: IndexMap<String, SatkerSummary> = IndexMap::new();

    for record in records {
        let Some(key) = satker_key(record) else {
            continue;
        };
        seen.entry(key).or_insert_with(|| SatkerSummary {
            kd_satker: record.get("kd_satker").cloned().unwrap_or(Value::Null),
            nama_satker: value_or_unknown(record, "nama_satker"),
            nama_klpd: value_or_unknown(record, "nama_klpd"),
            kd_klpd: value_or_unknown(record, "kd_klpd"),
        });
    }

    let mut list: Vec<(String, SatkerSummary)> = seen.into_iter().collect();
    list.sort_by(|(a, _), (b, _)| a.cmp(b));
    list.into_iter().map(|(_, summary)| summary).collect()
}

pub fn compute_stats(records: &[RupRecord]) -> Stats {
    let mut satker = HashSet::new();
    let mut provinsi = HashSet::new();
    let mut total_pagu = 0.0;
    let mut breakdown_jenis: IndexMap<String, usize> = IndexMap::new();
    let mut breakdown_metode: IndexMap<String, usize> = IndexMap::new();

    for record in records {
        if let Some(key) = satker_key(record) {
            satker.insert(key);
        }
        if let Some(name) = field_text(record, "provinsi") {
            provinsi.insert(name.into_owned());
        }
        total_pagu += record.get("pagu").map(parse_pagu).unwrap_or(0.0);
        *breakdown_jenis.entry(label(record, "jenis_pengadaan")).or_default() += 1;
        *breakdown_metode.entry(label(record, "metode_pengadaan")).or_default() += 1;
    }

    Stats {
        total_records: records.len(),
        total_satker: satker.len(),
        total_provinsi: provinsi.len(),
        total_pagu,
        breakdown_jenis,
        breakdown_metode,
    }
}

/// Budget amount of a record; anything that is not a finite number is 0.
fn parse_pagu(value: &Value) -> f64 {
    let amount = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    amount.filter(|a| a.is_finite()).unwrap_or(0.0)
}

/// Satkers whose code contains `partial`, with the number of records each,
/// in first-seen order.
pub fn search_satker_by_partial(
    records: &[RupRecord],
    partial: &str,
    limit: usize,
) -> Vec<SatkerMatch> {
    let mut matches: IndexMap<String, SatkerMatch> = IndexMap::new();

    for record in records {
        let Some(code) = field_text(record, "kd_satker") else {
            continue;
        };
        if !code.contains(partial) {
            continue;
        }
        let Some(key) = satker_key(record) else {
            continue;
        };
        matches
            .entry(key)
            .or_insert_with(|| SatkerMatch {
                kd_satker: record.get("kd_satker").cloned().unwrap_or(Value::Null),
                nama_satker: record.get("nama_satker").cloned().unwrap_or(Value::Null),
                nama_klpd: record.get("nama_klpd").cloned().unwrap_or(Value::Null),
                count: 0,
            })
            .count += 1;
    }

    matches.into_values().take(limit).collect()
}

/// 1-based page of `records`. Without either parameter the input is
/// returned whole.
pub fn paginate(records: Vec<RupRecord>, page: Option<usize>, limit: Option<usize>) -> Vec<RupRecord> {
    if page.is_none() && limit.is_none() {
        return records;
    }

    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = page.unwrap_or(1).max(1).saturating_sub(1).saturating_mul(limit);
    records.into_iter().skip(offset).take(limit).collect()
}

/// Field names and types of the first record.
pub fn columns(records: &[RupRecord]) -> Vec<Column> {
    records
        .first()
        .map(|first| {
            first
                .iter()
                .map(|(name, value)| Column {
                    column_name: name.clone(),
                    column_type: json_type_name(value),
                })
                .collect()
        })
        .unwrap_or_default()
}
