//! Sieve - category based DNS filtering.
//!
//! Resolves every queried name to a content category, applies per-source
//! block and whitelist policies, answers blocked queries with a sinkhole
//! address and emits a telemetry event for every query.

pub mod bulk;
pub mod cache;
pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod filter;
pub mod proxy;
pub mod resolver;
pub mod stats;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use engine::{Engine, QueryAction};
pub use error::{Error, Result};
