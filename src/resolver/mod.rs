//! Suffix resolver.
//!
//! Maps a queried name to the category of its most specific listed suffix.
//! Lookups go through the hot cache, then the bulk preload cache, then the
//! category store. Absence is a normal outcome, and a slow or failing store
//! degrades to "no category" rather than an error.

pub mod name;

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tracing::{debug, warn};

use crate::bulk::BulkCache;
use crate::cache::HotCache;
use crate::config::MatchingConfig;
use crate::stats::Stats;
use crate::store::{CategoryStore, DomainCategory};

/// Where a resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    HotCache,
    BulkCache,
    Store,
    /// The store timed out or failed; the result is a fail-open "not found".
    Degraded,
}

/// Result of resolving one queried name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Normalised queried name.
    pub name: String,
    /// Registered domain, empty when the name is a public suffix.
    pub registered_domain: String,
    pub row: Option<DomainCategory>,
    pub origin: Origin,
}

impl Resolution {
    pub fn category(&self) -> Option<u32> {
        self.row.as_ref().map(|row| row.category_id)
    }
}

enum Lookup {
    Found(DomainCategory, Origin),
    Missing(Origin),
    Failed,
}

pub struct SuffixResolver {
    store: Arc<dyn CategoryStore>,
    hot: HotCache,
    bulk: ArcSwapOption<BulkCache>,
    bulk_authoritative: bool,
    matching: MatchingConfig,
    store_timeout: Duration,
    stats: Arc<Stats>,
}

impl SuffixResolver {
    pub fn new(
        store: Arc<dyn CategoryStore>,
        hot: HotCache,
        matching: MatchingConfig,
        store_timeout: Duration,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            store,
            hot,
            bulk: ArcSwapOption::empty(),
            bulk_authoritative: true,
            matching,
            store_timeout,
            stats,
        }
    }

    /// Whether a miss in a loaded bulk cache is final.
    pub fn with_bulk_authoritative(mut self, authoritative: bool) -> Self {
        self.bulk_authoritative = authoritative;
        self
    }

    /// Publish a fully loaded bulk cache, or remove it.
    pub fn set_bulk(&self, bulk: Option<Arc<BulkCache>>) {
        self.bulk.store(bulk);
    }

    pub fn bulk_len(&self) -> usize {
        self.bulk.load().as_ref().map_or(0, |bulk| bulk.len())
    }

    pub fn hot_cache(&self) -> &HotCache {
        &self.hot
    }

    /// Resolve `name` as queried by `source`.
    ///
    /// `deadline` bounds any store round trip in addition to the configured
    /// store timeout.
    pub async fn resolve(&self, source: &str, name: &str, deadline: Option<Instant>) -> Resolution {
        let name = name::normalize(name);
        let registered_domain = name::registered_domain(&name)
            .unwrap_or_default()
            .to_string();

        let key = HotCache::key(source, &name);
        if let Some(row) = self.hot.get(&key) {
            self.stats.record_hot_hit();
            return Resolution {
                name,
                registered_domain,
                row,
                origin: Origin::HotCache,
            };
        }

        let mut candidates = name::candidates(&name);
        if let Some(depth) = self.matching.max_candidate_depth {
            candidates.truncate(depth);
        }

        let mut lookup = self.lookup(&candidates, deadline).await;
        if matches!(lookup, Lookup::Missing(_))
            && self.matching.registered_domain_fallback
            && !registered_domain.is_empty()
            && !candidates.contains(&registered_domain.as_str())
        {
            debug!(%name, %registered_domain, "trying registered domain fallback");
            lookup = self.lookup(&[registered_domain.as_str()], deadline).await;
        }

        let (row, origin) = match lookup {
            Lookup::Found(row, origin) => (Some(row), origin),
            Lookup::Missing(origin) => (None, origin),
            Lookup::Failed => {
                return Resolution {
                    name,
                    registered_domain,
                    row: None,
                    origin: Origin::Degraded,
                };
            }
        };

        self.hot.set_default(key, row.clone());
        Resolution {
            name,
            registered_domain,
            row,
            origin,
        }
    }

    async fn lookup(&self, candidates: &[&str], deadline: Option<Instant>) -> Lookup {
        if candidates.is_empty() {
            return Lookup::Missing(Origin::Store);
        }

        if let Some(bulk) = self.bulk.load_full() {
            if let Some(row) = bulk.first_match(candidates) {
                self.stats.record_bulk_hit();
                return Lookup::Found(row, Origin::BulkCache);
            }
            if self.bulk_authoritative {
                return Lookup::Missing(Origin::BulkCache);
            }
        }

        self.query_store(candidates, deadline).await
    }

    async fn query_store(&self, candidates: &[&str], deadline: Option<Instant>) -> Lookup {
        let budget = match deadline {
            Some(deadline) => self
                .store_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.store_timeout,
        };

        self.stats.record_store_lookup();
        let store = Arc::clone(&self.store);
        let owned: Vec<String> = candidates.iter().map(|c| c.to_string()).collect();
        let task = tokio::task::spawn_blocking(move || {
            let candidates: Vec<&str> = owned.iter().map(String::as_str).collect();
            store.longest_match(&candidates)
        });

        match tokio::time::timeout(budget, task).await {
            Ok(Ok(Ok(Some(row)))) => Lookup::Found(row, Origin::Store),
            Ok(Ok(Ok(None))) => Lookup::Missing(Origin::Store),
            Ok(Ok(Err(e))) => {
                self.stats.record_store_failure();
                warn!(candidate = candidates[0], error = %e, "category store lookup failed");
                Lookup::Failed
            }
            Ok(Err(e)) => {
                self.stats.record_store_failure();
                warn!(candidate = candidates[0], error = %e, "category store task failed");
                Lookup::Failed
            }
            Err(_) => {
                self.stats.record_store_failure();
                warn!(
                    candidate = candidates[0],
                    budget_ms = budget.as_millis() as u64,
                    "category store lookup timed out"
                );
                Lookup::Failed
            }
        }
    }
}
