//! UDP transport for DNS queries.
//!
//! Each datagram is handled in its own task: the engine decides, blocked
//! queries are answered directly and allowed ones are raced across all
//! upstreams on a fresh socket, first answer wins.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::{Engine, QueryAction};

use super::{MAX_DNS_PACKET_SIZE, Protocol, QueryLogger, source_id};

/// UDP transport for the filtering proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the UDP transport.
    ///
    /// Spawns the receive loop; every query gets its own task bounded by
    /// `query_timeout`.
    pub fn start(
        self,
        upstreams: Vec<SocketAddr>,
        engine: Arc<Engine>,
        query_timeout: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, upstreams.into(), engine, query_timeout))
    }
}

async fn run(
    socket: Arc<UdpSocket>,
    upstreams: Arc<[SocketAddr]>,
    engine: Arc<Engine>,
    query_timeout: Duration,
) {
    let logger = Arc::new(QueryLogger::new(Protocol::Udp));
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "UDP recv error");
                continue;
            }
        };

        if len < 12 {
            continue;
        }

        tokio::spawn(handle_query(
            Arc::clone(&socket),
            src,
            buf[..len].to_vec(),
            Arc::clone(&upstreams),
            Arc::clone(&engine),
            Arc::clone(&logger),
            query_timeout,
        ));
    }
}

async fn handle_query(
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    query: Vec<u8>,
    upstreams: Arc<[SocketAddr]>,
    engine: Arc<Engine>,
    logger: Arc<QueryLogger>,
    query_timeout: Duration,
) {
    let start_time = Instant::now();
    let deadline = start_time + query_timeout;
    let source = source_id(src);

    match engine.process_query(&source, &query, Some(deadline)).await {
        QueryAction::Blocked { response, domain } => {
            if let Err(e) = socket.send_to(&response.to_bytes(), src).await {
                debug!(error = %e, %src, "UDP response error");
            }
            let elapsed = start_time.elapsed().as_secs_f64() * 1000.0;
            engine.stats().record_blocked(elapsed);
            logger.blocked(&domain, elapsed);
        }
        QueryAction::Forward { domain, event } => {
            let upstream_start = Instant::now();
            let remaining = deadline.saturating_duration_since(upstream_start);
            match tokio::time::timeout(remaining, forward_to_upstreams(&query, &upstreams)).await {
                Ok(Ok((response, from))) => {
                    if let Err(e) = socket.send_to(&response, src).await {
                        debug!(error = %e, %src, "UDP response error");
                    }
                    engine.complete(event);
                    let total = start_time.elapsed().as_secs_f64() * 1000.0;
                    let upstream = upstream_start.elapsed().as_secs_f64() * 1000.0;
                    engine.stats().record_forwarded(total);
                    logger.forwarded(&domain, total, upstream, from);
                }
                Ok(Err(e)) => logger.failed(&domain, &e.to_string()),
                Err(_) => logger.failed(&domain, "timed out"),
            }
        }
    }
}

/// Send `query` to every upstream and return the first matching answer.
async fn forward_to_upstreams(
    query: &[u8],
    upstreams: &[SocketAddr],
) -> io::Result<(Vec<u8>, SocketAddr)> {
    let Some(first) = upstreams.first() else {
        return Err(io::Error::new(io::ErrorKind::NotFound, "no upstream configured"));
    };
    let local: SocketAddr = match first {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;

    let mut sent = 0;
    for upstream in upstreams {
        match socket.send_to(query, upstream).await {
            Ok(_) => sent += 1,
            Err(e) => debug!(error = %e, %upstream, "UDP forward error"),
        }
    }
    if sent == 0 {
        return Err(io::Error::new(io::ErrorKind::NotConnected, "no upstream reachable"));
    }

    let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        if len >= 12 && upstreams.contains(&from) && buf[..2] == query[..2] {
            buf.truncate(len);
            return Ok((buf, from));
        }
    }
}
