//! Transport layer implementations for the filtering proxy.
//!
//! Provides UDP and TCP transports for receiving DNS queries from clients,
//! running them through the [`Engine`](crate::engine::Engine) and
//! forwarding allowed ones to upstream servers.

pub mod tcp;
pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

use std::net::SocketAddr;

use tracing::debug;

/// Transport protocol identifier for logging.
#[derive(Debug, Clone, Copy)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Logger for DNS query outcomes.
pub struct QueryLogger {
    protocol: Protocol,
}

impl QueryLogger {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    pub fn blocked(&self, domain: &str, elapsed_ms: f64) {
        debug!(
            protocol = self.protocol.as_str(),
            domain,
            total_ms = elapsed_ms,
            "BLOCKED"
        );
    }

    pub fn forwarded(&self, domain: &str, total_ms: f64, upstream_ms: f64, from: SocketAddr) {
        debug!(
            protocol = self.protocol.as_str(),
            domain,
            total_ms,
            upstream_ms,
            %from,
            "FORWARDED"
        );
    }

    pub fn failed(&self, domain: &str, reason: &str) {
        debug!(protocol = self.protocol.as_str(), domain, reason, "upstream exchange failed");
    }
}

/// Source identifier used for policy lookups: the client IP without port.
pub fn source_id(addr: SocketAddr) -> String {
    addr.ip().to_canonical().to_string()
}
