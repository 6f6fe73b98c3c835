// =============================================================================
// Baseline Cache — read-through view over the BaselineStore
// =============================================================================
//
// Owns its own invalidation: entries expire after `ttl` and every stream is
// busted explicitly when its baselines are recalculated. The cache is handed
// to the cycle runner; nothing reaches it as ambient state.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::baseline::store::{BaselineSet, BaselineStore};
use crate::types::{StreamKey, Timeframe};

const MAX_ENTRIES: usize = 4_096;

struct CacheEntry {
    set: Arc<BaselineSet>,
    inserted: Instant,
}

pub struct BaselineCache {
    store: Arc<BaselineStore>,
    ttl: Duration,
    entries: RwLock<HashMap<(StreamKey, DateTime<Utc>), CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BaselineCache {
    pub fn new(store: Arc<BaselineStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<BaselineStore> {
        &self.store
    }

    /// Baselines in effect for (asset, timeframe) at `at`.
    pub fn get(&self, asset: &str, timeframe: Timeframe, at: DateTime<Utc>) -> Arc<BaselineSet> {
        let key = (
            StreamKey {
                asset: asset.to_string(),
                timeframe,
            },
            at,
        );

        if let Some(entry) = self.entries.read().get(&key) {
            if entry.inserted.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(&entry.set);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let set = Arc::new(self.store.snapshot_at(asset, timeframe, at));

        let mut entries = self.entries.write();
        if entries.len() >= MAX_ENTRIES {
            let ttl = self.ttl;
            entries.retain(|_, e| e.inserted.elapsed() < ttl);
            if entries.len() >= MAX_ENTRIES {
                entries.clear();
            }
        }
        entries.insert(
            key,
            CacheEntry {
                set: Arc::clone(&set),
                inserted: Instant::now(),
            },
        );
        set
    }

    /// Drop every cached entry for one stream.
    pub fn bust(&self, asset: &str, timeframe: Timeframe) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(stream, _), _| !(stream.asset == asset && stream.timeframe == timeframe));
        debug!(asset, timeframe = %timeframe, dropped = before - entries.len(), "baseline cache busted");
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::store::Baseline;
    use crate::runtime_config::BaselineSettings;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn store_with(value: f64) -> Arc<BaselineStore> {
        let store = Arc::new(BaselineStore::default());
        store.insert(Baseline::compute(
            "s",
            "m",
            "BTC",
            Timeframe::H1,
            t0(),
            &[value; 40],
            90,
            &BaselineSettings::default(),
        ));
        store
    }

    #[test]
    fn second_read_is_a_hit() {
        let cache = BaselineCache::new(store_with(1.0), Duration::from_secs(60));
        let a = cache.get("BTC", Timeframe::H1, t0());
        let b = cache.get("BTC", Timeframe::H1, t0());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn bust_forces_reload_from_store() {
        let store = store_with(1.0);
        let cache = BaselineCache::new(Arc::clone(&store), Duration::from_secs(60));
        assert_eq!(cache.get("BTC", Timeframe::H1, t0()).get("s", "m").unwrap().median, 1.0);

        store.insert(Baseline::compute(
            "s",
            "m",
            "BTC",
            Timeframe::H1,
            t0(),
            &[2.0; 40],
            90,
            &BaselineSettings::default(),
        ));
        // still cached
        assert_eq!(cache.get("BTC", Timeframe::H1, t0()).get("s", "m").unwrap().median, 1.0);

        cache.bust("BTC", Timeframe::H1);
        assert_eq!(cache.get("BTC", Timeframe::H1, t0()).get("s", "m").unwrap().median, 2.0);
    }

    #[test]
    fn zero_ttl_never_hits() {
        let cache = BaselineCache::new(store_with(1.0), Duration::ZERO);
        cache.get("BTC", Timeframe::H1, t0());
        cache.get("BTC", Timeframe::H1, t0());
        assert_eq!(cache.stats(), (0, 2));
    }

    #[test]
    fn bust_leaves_other_streams() {
        let cache = BaselineCache::new(store_with(1.0), Duration::from_secs(60));
        cache.get("BTC", Timeframe::H1, t0());
        cache.get("BTC", Timeframe::D1, t0());
        cache.bust("BTC", Timeframe::H1);
        assert_eq!(cache.len(), 1);
    }
}
