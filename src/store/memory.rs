//! In-memory category store.
//!
//! Useful for tests and benchmarks: counts lookups and can simulate slow or
//! failing backends.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::{Category, CategoryStore, DomainCategory};
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryStore {
    categories: RwLock<Vec<Category>>,
    domains: RwLock<BTreeMap<String, Vec<u32>>>,
    lookups: AtomicUsize,
    unavailable: AtomicBool,
    delay_ms: AtomicU64,
    /// Abort the aggregate scan after this many rows (0 = never).
    fail_scan_after: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(self, id: u32, name: &str) -> Self {
        self.add_category(id, name);
        self
    }

    pub fn with_domain(self, domain: &str, category_id: u32) -> Self {
        self.add_domain(domain, category_id);
        self
    }

    pub fn add_category(&self, id: u32, name: &str) {
        if let Ok(mut categories) = self.categories.write() {
            categories.retain(|c| c.id != id);
            categories.push(Category {
                id,
                name: name.to_string(),
            });
        }
    }

    /// Names are stored lowercased, so matching ignores case on both sides.
    pub fn add_domain(&self, domain: &str, category_id: u32) {
        if let Ok(mut domains) = self.domains.write() {
            let ids = domains.entry(domain.to_ascii_lowercase()).or_default();
            if let Err(pos) = ids.binary_search(&category_id) {
                ids.insert(pos, category_id);
            }
        }
    }

    /// Number of `longest_match` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Make every call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Sleep this long inside every `longest_match` call.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn fail_scan_after(&self, rows: usize) {
        self.fail_scan_after.store(rows, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store disabled".into()));
        }
        Ok(())
    }
}

impl CategoryStore for MemoryStore {
    fn categories(&self) -> Result<Vec<Category>, StoreError> {
        self.check_available()?;
        let categories = self
            .categories
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".into()))?;
        Ok(categories.clone())
    }

    fn longest_match(&self, candidates: &[&str]) -> Result<Option<DomainCategory>, StoreError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.check_available()?;

        let domains = self
            .domains
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".into()))?;
        let found = candidates
            .iter()
            .filter_map(|c| domains.get_key_value(*c))
            .max_by_key(|(domain, _)| domain.len())
            .and_then(|(domain, ids)| {
                ids.first().map(|&category_id| DomainCategory {
                    domain: domain.clone(),
                    category_id,
                })
            });
        Ok(found)
    }

    fn for_each_domain(&self, visit: &mut dyn FnMut(String, Vec<u32>)) -> Result<usize, StoreError> {
        self.check_available()?;
        let fail_after = self.fail_scan_after.load(Ordering::Relaxed);
        let domains = self
            .domains
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".into()))?;

        let mut count = 0;
        for (domain, ids) in domains.iter() {
            if fail_after > 0 && count == fail_after {
                return Err(StoreError::Unavailable(format!("scan aborted at row {}", count)));
            }
            visit(domain.clone(), ids.clone());
            count += 1;
        }
        Ok(count)
    }
}
