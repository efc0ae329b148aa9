//! DNS query processing decisions.
//!
//! Handles the per-query pipeline:
//! 1. Resolve the queried name to a category (caches, then store)
//! 2. Check the source's policy
//! 3. Either answer with the sinkhole response or let the query through
//! 4. Emit a telemetry event
//!
//! Transports handle the actual I/O, the engine handles decisions.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::bulk::BulkCache;
use crate::cache::HotCache;
use crate::config::EngineConfig;
use crate::dns::{DnsQuery, DnsResponse, rtype_name};
use crate::error::{Error, Result};
use crate::filter::{self, Decision, PolicyTable};
use crate::resolver::{Resolution, SuffixResolver};
use crate::stats::{Stats, StatsSnapshot};
use crate::store::{Category, CategoryStore, SqliteStore};
use crate::telemetry::{QueryEvent, Telemetry};

/// Action to take for a DNS query.
#[derive(Debug)]
pub enum QueryAction {
    /// Query is blocked, return this response immediately. Its event has
    /// already been emitted.
    Blocked {
        response: DnsResponse,
        domain: String,
    },
    /// Query should be forwarded to upstream. Hand `event` back through
    /// [`Engine::complete`] once the upstream answer has been relayed.
    Forward {
        domain: String,
        event: Option<QueryEvent>,
    },
}

/// Process-wide filtering engine.
///
/// Owns the store handle, both caches, the policy table and the telemetry
/// handle. Shared by reference (usually `Arc<Engine>`) between all request
/// contexts.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn CategoryStore>,
    categories: ArcSwap<FxHashMap<u32, Category>>,
    resolver: SuffixResolver,
    policies: PolicyTable,
    telemetry: Telemetry,
    stats: Arc<Stats>,
}

impl Engine {
    /// Open the SQLite store named in `config` and build the engine.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.store.path, config.store.connections)?;
        Self::build(config, Arc::new(store))
    }

    /// Build an engine over `store`.
    ///
    /// Loads the category table and, when enabled, the bulk preload cache.
    /// Any failure here is fatal. Must be called from within a tokio runtime
    /// when telemetry is configured.
    pub fn build(config: EngineConfig, store: Arc<dyn CategoryStore>) -> Result<Self> {
        let categories = load_categories(&*store)?;
        info!(categories = categories.len(), "loaded category table");

        let bulk = if config.bulk.enabled {
            Some(Arc::new(BulkCache::load(&*store, &config.bulk)?))
        } else {
            None
        };

        let telemetry = match &config.telemetry {
            Some(telemetry) => {
                Telemetry::spawn(telemetry).map_err(|source| Error::Telemetry {
                    addr: telemetry.socket,
                    source,
                })?
            }
            None => Telemetry::disabled(),
        };

        let stats = Arc::new(Stats::new());
        let hot = HotCache::new(config.cache.capacity, config.cache.ttl);
        let resolver = SuffixResolver::new(
            Arc::clone(&store),
            hot,
            config.matching.clone(),
            config.store.timeout,
            Arc::clone(&stats),
        )
        .with_bulk_authoritative(config.bulk.authoritative);
        resolver.set_bulk(bulk);

        let policies = PolicyTable::from_sources(&config.sources);
        info!(
            sources = policies.len(),
            bulk_domains = resolver.bulk_len(),
            telemetry = telemetry.is_enabled(),
            "filtering engine ready"
        );

        Ok(Self {
            config,
            store,
            categories: ArcSwap::from_pointee(categories),
            resolver,
            policies,
            telemetry,
            stats,
        })
    }

    /// Process a raw DNS query from `source` and decide what action to take.
    ///
    /// Packets that cannot be parsed are forwarded untouched without an
    /// event.
    pub async fn process_query(
        &self,
        source: &str,
        packet: &[u8],
        deadline: Option<Instant>,
    ) -> QueryAction {
        match DnsQuery::parse(packet) {
            Some(query) => self.process(source, &query, deadline).await,
            None => unknown(),
        }
    }

    /// Process a parsed query from `source`.
    ///
    /// A query without questions is forwarded untouched without an event.
    pub async fn process(
        &self,
        source: &str,
        query: &DnsQuery,
        deadline: Option<Instant>,
    ) -> QueryAction {
        let Some(question) = query.first() else {
            return unknown();
        };
        let resolution = self.resolver.resolve(source, &question.domain, deadline).await;
        self.log_resolution(source, &resolution);

        let category = resolution.category();
        let decision = self.policies.decide(source, category);
        let event = QueryEvent::now(
            fqdn(&resolution.name),
            resolution.registered_domain,
            category,
            source.to_string(),
            rtype_name(question.qtype).into_owned(),
            decision.access_type(),
        );

        match decision {
            Decision::Block => {
                let response = filter::blocked_response(
                    query,
                    self.config.filter.sinkhole,
                    self.config.filter.block_ttl,
                );
                self.telemetry.emit(event);
                QueryAction::Blocked {
                    response,
                    domain: resolution.name,
                }
            }
            Decision::Allow => QueryAction::Forward {
                domain: resolution.name,
                event: Some(event),
            },
        }
    }

    /// Called once a forwarded query has been answered.
    pub fn complete(&self, event: Option<QueryEvent>) {
        if let Some(event) = event {
            self.telemetry.emit(event);
        }
    }

    /// Reload the category table and bulk cache from the store.
    ///
    /// On failure the previous snapshot stays in service. Blocks while the
    /// bulk cache loads.
    pub fn reload(&self) -> Result<()> {
        let categories = load_categories(&*self.store)?;
        let bulk = if self.config.bulk.enabled {
            Some(Arc::new(BulkCache::load(&*self.store, &self.config.bulk)?))
        } else {
            None
        };

        let count = categories.len();
        self.categories.store(Arc::new(categories));
        self.resolver.set_bulk(bulk);
        self.resolver.hot_cache().clear();
        info!(
            categories = count,
            bulk_domains = self.resolver.bulk_len(),
            "reloaded category data"
        );
        Ok(())
    }

    pub fn category_name(&self, id: u32) -> Option<String> {
        self.categories.load().get(&id).map(|c| c.name.clone())
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_snapshot_and_reset(&self) -> StatsSnapshot {
        self.stats.snapshot_and_reset()
    }

    /// Returns the number of entries in the hot cache.
    pub fn cache_len(&self) -> u64 {
        self.resolver.hot_cache().len()
    }

    pub fn bulk_len(&self) -> usize {
        self.resolver.bulk_len()
    }

    pub fn telemetry_dropped(&self) -> u64 {
        self.telemetry.dropped()
    }

    fn log_resolution(&self, source: &str, resolution: &Resolution) {
        match &resolution.row {
            Some(row) => {
                let category_name = self.category_name(row.category_id).unwrap_or_default();
                debug!(
                    source,
                    domain = %resolution.name,
                    matched = %row.domain,
                    category = row.category_id,
                    %category_name,
                    origin = ?resolution.origin,
                    "resolved category"
                );
            }
            None => debug!(
                source,
                domain = %resolution.name,
                origin = ?resolution.origin,
                "no category"
            ),
        }
    }
}

fn unknown() -> QueryAction {
    QueryAction::Forward {
        domain: "<unknown>".to_string(),
        event: None,
    }
}

/// Fully qualified form of a normalised name, as reported in events.
fn fqdn(name: &str) -> String {
    format!("{}.", name)
}

fn load_categories(store: &dyn CategoryStore) -> Result<FxHashMap<u32, Category>> {
    Ok(store
        .categories()?
        .into_iter()
        .map(|category| (category.id, category))
        .collect())
}
