//! Hot cache of resolved categories keyed by `(source, queried name)`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::sync::Cache;

use crate::store::DomainCategory;

/// Cost of keeping one entry, in capacity units.
pub type CostFn = dyn Fn(&str, Option<&DomainCategory>) -> u32 + Send + Sync;

fn uniform_cost(_key: &str, _value: Option<&DomainCategory>) -> u32 {
    1
}

#[derive(Clone)]
struct CacheEntry {
    /// `None` records a definitive "no category".
    value: Option<DomainCategory>,
    ttl: Duration,
}

/// Each entry expires after its own TTL; replacing an entry restarts it.
struct PerEntryTtl;

impl Expiry<String, CacheEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Bounded, variable-TTL cache in front of the bulk cache and the store.
///
/// Safe to share between any number of request contexts. When full, the
/// least valuable entries under the cost function are evicted.
pub struct HotCache {
    entries: Cache<String, CacheEntry>,
    default_ttl: Duration,
}

impl HotCache {
    /// Cache holding up to `capacity` entries at uniform cost.
    pub fn new(capacity: u64, default_ttl: Duration) -> Self {
        Self::with_cost(capacity, default_ttl, Arc::new(uniform_cost))
    }

    /// Cache whose `capacity` is measured in units of `cost`.
    pub fn with_cost(capacity: u64, default_ttl: Duration, cost: Arc<CostFn>) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .weigher(move |key: &String, entry: &CacheEntry| cost(key.as_str(), entry.value.as_ref()))
            .expire_after(PerEntryTtl)
            .build();

        Self {
            entries,
            default_ttl,
        }
    }

    /// Composite key for a query from `source` for `name`.
    pub fn key(source: &str, name: &str) -> String {
        format!("{}_{}", source, name)
    }

    /// Cached result for `key`. The outer `None` is a miss; `Some(None)` is a
    /// cached negative result.
    pub fn get(&self, key: &str) -> Option<Option<DomainCategory>> {
        self.entries.get(key).map(|entry| entry.value)
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn set(&self, key: String, value: Option<DomainCategory>, ttl: Duration) {
        self.entries.insert(key, CacheEntry { value, ttl });
    }

    /// Store with the cache's default TTL.
    pub fn set_default(&self, key: String, value: Option<DomainCategory>) {
        self.set(key, value, self.default_ttl);
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// Apply pending evictions and expirations now.
    pub fn sync(&self) {
        self.entries.run_pending_tasks();
    }
}
