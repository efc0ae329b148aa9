//! Engine configuration.
//!
//! The on-disk format is TOML. [`FileConfig`] mirrors the file and
//! [`FileConfig::validate`] turns it into the [`EngineConfig`] the engine is
//! built from, failing on anything that would stop the engine from serving.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Validated configuration consumed by [`crate::engine::Engine::build`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// `None` disables telemetry.
    pub telemetry: Option<TelemetryConfig>,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub bulk: BulkConfig,
    pub matching: MatchingConfig,
    pub filter: FilterConfig,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub socket: SocketAddr,
    /// Events buffered before new ones are dropped.
    pub queue: usize,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub connections: usize,
    /// Upper bound on a single per-query store lookup.
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            connections: default_connections(),
            timeout: Duration::from_millis(default_store_timeout_ms()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: u64,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl: Duration::from_secs(default_cache_ttl_secs()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bulk_workers")]
    pub workers: usize,
    #[serde(default = "default_bulk_queue")]
    pub queue: usize,
    /// Shard count of the concurrent map. Must be a power of two.
    #[serde(default = "default_bulk_shards")]
    pub shards: usize,
    /// Treat a bulk miss as final instead of asking the store.
    #[serde(default = "default_true")]
    pub authoritative: bool,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: default_bulk_workers(),
            queue: default_bulk_queue(),
            shards: default_bulk_shards(),
            authoritative: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchingConfig {
    /// Try the registered domain when no candidate suffix matched.
    #[serde(default)]
    pub registered_domain_fallback: bool,
    /// Only the N most specific candidates are looked up.
    #[serde(default)]
    pub max_candidate_depth: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub sinkhole: IpAddr,
    pub block_ttl: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            sinkhole: IpAddr::from([0, 0, 0, 0]),
            block_ttl: default_block_ttl(),
        }
    }
}

/// Per-source block and whitelist category ids.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    pub ip: String,
    #[serde(default)]
    pub block: Vec<u32>,
    #[serde(default)]
    pub whitelist: Vec<u32>,
}

/// Raw file contents.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub telemetry: FileTelemetry,
    #[serde(default)]
    pub store: FileStore,
    #[serde(default)]
    pub cache: FileCache,
    #[serde(default)]
    pub bulk: BulkConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub filter: FileFilter,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize)]
pub struct FileTelemetry {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub socket: Option<String>,
    #[serde(default = "default_telemetry_queue")]
    pub queue: usize,
}

impl Default for FileTelemetry {
    fn default() -> Self {
        Self {
            enabled: true,
            socket: None,
            queue: default_telemetry_queue(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FileStore {
    pub path: Option<PathBuf>,
    #[serde(default = "default_connections")]
    pub connections: usize,
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for FileStore {
    fn default() -> Self {
        Self {
            path: None,
            connections: default_connections(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FileCache {
    #[serde(default = "default_cache_capacity")]
    pub capacity: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for FileCache {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FileFilter {
    #[serde(default = "default_sinkhole")]
    pub sinkhole: String,
    #[serde(default = "default_block_ttl")]
    pub block_ttl: u32,
}

impl Default for FileFilter {
    fn default() -> Self {
        Self {
            sinkhole: default_sinkhole(),
            block_ttl: default_block_ttl(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_telemetry_queue() -> usize {
    4096
}
fn default_connections() -> usize {
    4
}
fn default_store_timeout_ms() -> u64 {
    250
}
fn default_cache_capacity() -> u64 {
    10_000
}
fn default_cache_ttl_secs() -> u64 {
    60
}
fn default_bulk_workers() -> usize {
    16
}
fn default_bulk_queue() -> usize {
    50_000
}
fn default_bulk_shards() -> usize {
    1024
}
fn default_sinkhole() -> String {
    "0.0.0.0".to_string()
}
fn default_block_ttl() -> u32 {
    3600
}

impl FileConfig {
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(self) -> Result<EngineConfig, ConfigError> {
        let telemetry = if self.telemetry.enabled {
            let socket = self
                .telemetry
                .socket
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or(ConfigError::MissingSocket)?;
            Some(TelemetryConfig {
                socket: resolve_socket(socket)?,
                queue: positive("telemetry.queue", self.telemetry.queue)?,
            })
        } else {
            None
        };

        let path = self
            .store
            .path
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::MissingStorePath)?;

        let sinkhole = self
            .filter
            .sinkhole
            .trim()
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::Invalid {
                key: "filter.sinkhole",
                message: format!("{}: {}", self.filter.sinkhole, e),
            })?;

        if !self.bulk.shards.is_power_of_two() || self.bulk.shards < 2 {
            return Err(ConfigError::Invalid {
                key: "bulk.shards",
                message: format!("{} is not a power of two greater than one", self.bulk.shards),
            });
        }
        positive("bulk.workers", self.bulk.workers)?;
        positive("bulk.queue", self.bulk.queue)?;
        if self.matching.max_candidate_depth == Some(0) {
            return Err(ConfigError::Invalid {
                key: "matching.max_candidate_depth",
                message: "must be at least 1".into(),
            });
        }
        for source in &self.sources {
            if source.ip.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key: "sources.ip",
                    message: "source identifier is empty".into(),
                });
            }
        }

        Ok(EngineConfig {
            telemetry,
            store: StoreConfig {
                path,
                connections: positive("store.connections", self.store.connections)?,
                timeout: Duration::from_millis(self.store.timeout_ms),
            },
            cache: CacheConfig {
                capacity: self.cache.capacity,
                ttl: Duration::from_secs(self.cache.ttl_secs),
            },
            bulk: self.bulk,
            matching: self.matching,
            filter: FilterConfig {
                sinkhole,
                block_ttl: self.filter.block_ttl,
            },
            sources: self.sources,
        })
    }
}

impl EngineConfig {
    /// Read, parse and validate the config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        FileConfig::parse(&contents)?.validate()
    }
}

fn resolve_socket(addr: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = |message: String| ConfigError::Invalid {
        key: "telemetry.socket",
        message,
    };
    addr.to_socket_addrs()
        .map_err(|e| invalid(format!("{}: {}", addr, e)))?
        .next()
        .ok_or_else(|| invalid(format!("{} resolved to no addresses", addr)))
}

fn positive(key: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            message: "must be greater than zero".into(),
        });
    }
    Ok(value)
}
