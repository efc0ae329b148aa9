//! Error types.
//!
//! Only construction and reload surface errors. The per-query path degrades
//! to "allow and continue" instead of returning one.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Invalid or incomplete configuration. Always fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("telemetry socket address is required")]
    MissingSocket,

    #[error("store path is required")]
    MissingStorePath,

    #[error("invalid value for '{key}': {message}")]
    Invalid { key: &'static str, message: String },
}

/// Failure talking to the category store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Top level error returned by engine construction and reload.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("category store: {0}")]
    Store(#[from] StoreError),

    #[error("bulk preload aborted after {loaded} domains: {source}")]
    BulkLoad {
        loaded: usize,
        #[source]
        source: StoreError,
    },

    #[error("telemetry socket {addr}: {source}")]
    Telemetry {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
