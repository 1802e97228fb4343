//! Metrics definitions for the RUP service.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of dataset lookups served from a fresh cache entry",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of dataset lookups with no fresh cache entry",
};

pub const CACHE_ENTRIES: MetricDef = MetricDef {
    name: "cache.entries",
    metric_type: MetricType::Gauge,
    description: "Number of datasets held in the cache, including expired ones",
};

pub const NEGATIVE_CACHE_HIT: MetricDef = MetricDef {
    name: "negative_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of fetches skipped because the dataset was recently not found",
};

pub const NEGATIVE_CACHE_MISS: MetricDef = MetricDef {
    name: "negative_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of fetches that missed the negative cache",
};

pub const UPSTREAM_FETCH_DURATION: MetricDef = MetricDef {
    name: "upstream.fetch.duration",
    metric_type: MetricType::Histogram,
    description: "Time to download and normalize an upstream dataset in seconds",
};

pub const UPSTREAM_FETCH_ROWS: MetricDef = MetricDef {
    name: "upstream.fetch.rows",
    metric_type: MetricType::Histogram,
    description: "Number of records returned by an upstream fetch",
};

pub const UPSTREAM_FETCH_FAILED: MetricDef = MetricDef {
    name: "upstream.fetch.failed",
    metric_type: MetricType::Counter,
    description: "Number of upstream fetches that failed",
};

pub const STALE_FALLBACK: MetricDef = MetricDef {
    name: "upstream.fetch.stale_fallback",
    metric_type: MetricType::Counter,
    description: "Number of failed fetches answered with previously cached data",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CACHE_HIT,
    CACHE_MISS,
    CACHE_ENTRIES,
    NEGATIVE_CACHE_HIT,
    NEGATIVE_CACHE_MISS,
    UPSTREAM_FETCH_DURATION,
    UPSTREAM_FETCH_ROWS,
    UPSTREAM_FETCH_FAILED,
    STALE_FALLBACK,
];
