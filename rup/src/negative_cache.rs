// Remembers datasets the upstream recently reported as not published, so
// repeated requests for a missing KLPD/year do not hit the upstream each time.
use crate::metrics_defs::{NEGATIVE_CACHE_HIT, NEGATIVE_CACHE_MISS};
use crate::types::DatasetKey;
use moka::sync::Cache;
use shared::counter;
use std::time::Duration;

const SIZE: u64 = 1000;

pub struct NegativeCache {
    cache: Cache<DatasetKey, ()>,
}

impl NegativeCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(SIZE)
            .time_to_live(ttl)
            .build();

        NegativeCache { cache }
    }

    pub fn insert(&self, key: &DatasetKey) {
        self.cache.insert(key.clone(), ());
    }

    pub fn remove(&self, key: &DatasetKey) {
        self.cache.invalidate(key);
    }

    pub fn contains(&self, key: &DatasetKey) -> bool {
        let cache_hit = self.cache.contains_key(key);
        let metric_def = if cache_hit {
            NEGATIVE_CACHE_HIT
        } else {
            NEGATIVE_CACHE_MISS
        };
        counter!(metric_def).increment(1);
        cache_hit
    }
}
