//! Per-source access policy.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::SourceConfig;

/// Outcome of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block,
}

impl Decision {
    /// Value of the telemetry `access_type` field.
    pub fn access_type(self) -> &'static str {
        match self {
            Decision::Allow => "PASS",
            Decision::Block => "BLOCK",
        }
    }
}

/// Blocked and whitelisted categories for one source.
#[derive(Debug, Clone, Default)]
pub struct SourcePolicy {
    pub block: FxHashSet<u32>,
    pub whitelist: FxHashSet<u32>,
}

impl SourcePolicy {
    pub fn decide(&self, category: u32) -> Decision {
        if self.whitelist.contains(&category) {
            return Decision::Allow;
        }
        if self.block.contains(&category) {
            Decision::Block
        } else {
            Decision::Allow
        }
    }
}

/// Read-only table of source policies, keyed by source identifier.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    sources: FxHashMap<String, SourcePolicy>,
}

impl PolicyTable {
    pub fn from_sources(sources: &[SourceConfig]) -> Self {
        let mut table = Self::default();
        for source in sources {
            let policy = table.sources.entry(source.ip.trim().to_string()).or_default();
            policy.block.extend(source.block.iter().copied());
            policy.whitelist.extend(source.whitelist.iter().copied());
        }
        table
    }

    pub fn insert(&mut self, source: impl Into<String>, policy: SourcePolicy) {
        self.sources.insert(source.into(), policy);
    }

    /// Decide whether `source` may resolve a name in `category`.
    ///
    /// Unknown sources and unresolved names are always allowed.
    pub fn decide(&self, source: &str, category: Option<u32>) -> Decision {
        match (self.sources.get(source), category) {
            (Some(policy), Some(category)) => policy.decide(category),
            _ => Decision::Allow,
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
