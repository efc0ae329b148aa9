//! Read-only access to the domain category tables.
//!
//! Two query shapes are needed: the whole category list at startup and
//! domain lookups, either per query (longest matching suffix) or as one
//! aggregate scan for the bulk preload.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;

/// A named classification bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: u32,
    pub name: String,
}

/// A matched domain and the category it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainCategory {
    pub domain: String,
    pub category_id: u32,
}

/// Source of domain classifications.
///
/// Implementations are shared by every request context and must tolerate
/// concurrent calls. All methods may block on I/O.
pub trait CategoryStore: Send + Sync {
    /// Every known category.
    fn categories(&self) -> Result<Vec<Category>, StoreError>;

    /// Look up all `candidates` at once and return the row for the longest
    /// one present. When that domain has several categories the lowest id
    /// is returned.
    fn longest_match(&self, candidates: &[&str]) -> Result<Option<DomainCategory>, StoreError>;

    /// Stream every domain with its category ids in ascending order.
    ///
    /// Returns the number of domains visited. An error aborts the scan.
    fn for_each_domain(&self, visit: &mut dyn FnMut(String, Vec<u32>)) -> Result<usize, StoreError>;
}
