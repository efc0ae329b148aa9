//! Bulk preload cache.
//!
//! Snapshot of the whole domain table, built once by a pool of worker
//! threads draining a bounded queue fed by a single store scan. A cache is
//! only ever handed out fully populated: a failed scan returns an error and
//! the partial map is dropped.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use crate::config::BulkConfig;
use crate::error::{Error, Result};
use crate::store::{CategoryStore, DomainCategory};

/// Domain -> ascending category ids, sharded for concurrent access.
pub struct BulkCache {
    domains: DashMap<String, Arc<[u32]>>,
}

impl BulkCache {
    /// Scan `store` and build the cache.
    ///
    /// Blocks until every worker has drained the queue.
    pub fn load(store: &dyn CategoryStore, config: &BulkConfig) -> Result<Self> {
        let started = Instant::now();
        let domains: DashMap<String, Arc<[u32]>> =
            DashMap::with_capacity_and_shard_amount(0, config.shards);
        let (tx, rx) = crossbeam_channel::bounded::<(String, Vec<u32>)>(config.queue);

        let scanned = std::thread::scope(|scope| {
            for worker in 0..config.workers.max(1) {
                let rx = rx.clone();
                let domains = &domains;
                scope.spawn(move || {
                    let mut inserted = 0usize;
                    for (domain, ids) in rx {
                        insert_folded(domains, domain, ids);
                        inserted += 1;
                    }
                    debug!(worker, inserted, "bulk preload worker finished");
                });
            }
            drop(rx);

            let scanned = store.for_each_domain(&mut |domain, ids| {
                // Only fails if every worker is gone, which ends the scope anyway.
                let _ = tx.send((domain, ids));
            });
            drop(tx);
            scanned
        });

        match scanned {
            Ok(rows) => {
                info!(
                    domains = domains.len(),
                    rows,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "bulk preload complete"
                );
                Ok(Self { domains })
            }
            Err(source) => Err(Error::BulkLoad {
                loaded: domains.len(),
                source,
            }),
        }
    }

    /// Category ids of exactly `domain`.
    pub fn lookup(&self, domain: &str) -> Option<Arc<[u32]>> {
        self.domains.get(domain).map(|ids| Arc::clone(ids.value()))
    }

    /// Row for the first candidate present, in the order given.
    pub fn first_match(&self, candidates: &[&str]) -> Option<DomainCategory> {
        candidates.iter().find_map(|&candidate| {
            let ids = self.lookup(candidate)?;
            ids.first().map(|&category_id| DomainCategory {
                domain: candidate.to_string(),
                category_id,
            })
        })
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Insert under the lowercased name, merging ids of rows that differ only
/// in case.
fn insert_folded(domains: &DashMap<String, Arc<[u32]>>, mut domain: String, mut ids: Vec<u32>) {
    domain.make_ascii_lowercase();
    match domains.entry(domain) {
        Entry::Occupied(mut entry) => {
            ids.extend_from_slice(entry.get());
            ids.sort_unstable();
            ids.dedup();
            entry.insert(ids.into());
        }
        Entry::Vacant(entry) => {
            ids.sort_unstable();
            ids.dedup();
            entry.insert(ids.into());
        }
    }
}
