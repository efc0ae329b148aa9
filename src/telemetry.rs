//! Query event telemetry.
//!
//! Every query produces one [`QueryEvent`], sent as a newline terminated
//! JSON datagram to an external collector. Emission is fire and forget: the
//! caller only moves the event into a bounded queue, a background task does
//! the serialising and the socket write, and every failure stops at a log
//! line.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Local, SecondsFormat};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::TelemetryConfig;

/// One record per query, in the collector's wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryEvent {
    /// RFC 3339 timestamp.
    pub datetime: String,
    /// Queried name, lowercased and fully qualified (`ads.example.com.`).
    pub domain: String,
    pub registered_domain: String,
    /// Category id, 0 when unresolved.
    pub category: u32,
    pub source_ip: String,
    /// Record type mnemonic.
    #[serde(rename = "type")]
    pub query_type: String,
    /// `PASS` or `BLOCK`.
    pub access_type: &'static str,
}

impl QueryEvent {
    /// Event stamped with the current local time.
    pub fn now(
        domain: String,
        registered_domain: String,
        category: Option<u32>,
        source_ip: String,
        query_type: String,
        access_type: &'static str,
    ) -> Self {
        Self {
            datetime: Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            domain,
            registered_domain,
            category: category.unwrap_or(0),
            source_ip,
            query_type,
            access_type,
        }
    }

    /// Serialised datagram payload.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Handle used by request contexts to emit events.
///
/// Cheap to clone. A disabled handle accepts and discards events.
#[derive(Clone)]
pub struct Telemetry {
    tx: Option<mpsc::Sender<QueryEvent>>,
    dropped: Arc<AtomicU64>,
}

impl Telemetry {
    /// Handle that discards every event.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open a connected UDP socket to the collector and start the sender.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: &TelemetryConfig) -> io::Result<Self> {
        let local: SocketAddr = match config.socket {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = StdUdpSocket::bind(local)?;
        socket.connect(config.socket)?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;

        let (tx, rx) = mpsc::channel(config.queue);
        tokio::spawn(run_sender(socket, rx, config.socket));

        Ok(Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue `event` for sending. Never waits; a full queue drops the event.
    pub fn emit(&self, event: QueryEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(domain = %event.domain, "telemetry queue full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("telemetry sender stopped, event dropped");
            }
        }
    }

    /// Events dropped since start.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run_sender(socket: UdpSocket, mut rx: mpsc::Receiver<QueryEvent>, dest: SocketAddr) {
    while let Some(event) = rx.recv().await {
        let line = match event.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialise query event");
                continue;
            }
        };
        if let Err(e) = socket.send(&line).await {
            warn!(%dest, error = %e, "error sending query event");
        }
    }
    debug!(%dest, "telemetry sender finished");
}
