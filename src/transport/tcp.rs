//! TCP transport for DNS queries.
//!
//! Handles DNS queries over TCP. Each client connection is handled
//! independently - we read the query, let the engine decide, and either
//! answer with the block response or forward upstream and relay the
//! answer. TCP DNS messages are prefixed with a 2-byte length.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::engine::{Engine, QueryAction};

use super::{MAX_DNS_PACKET_SIZE, Protocol, QueryLogger, source_id};

/// TCP transport for the filtering proxy.
///
/// Binds to a local address and accepts connections from clients.
/// Each connection is handled in a separate task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the TCP transport.
    ///
    /// Spawns an accept loop that handles each connection in a separate task.
    pub fn start(
        self,
        upstreams: Vec<SocketAddr>,
        engine: Arc<Engine>,
        query_timeout: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(
            self.listener,
            upstreams.into(),
            engine,
            query_timeout,
        ))
    }
}

/// Accept loop - spawns a handler task for each incoming connection.
async fn run_accept_loop(
    listener: TcpListener,
    upstreams: Arc<[SocketAddr]>,
    engine: Arc<Engine>,
    query_timeout: Duration,
) {
    let logger = Arc::new(QueryLogger::new(Protocol::Tcp));
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                tokio::spawn(handle_connection(
                    client,
                    peer,
                    Arc::clone(&upstreams),
                    Arc::clone(&engine),
                    Arc::clone(&logger),
                    query_timeout,
                ));
            }
            Err(e) => {
                warn!(error = %e, "TCP accept error");
            }
        }
    }
}

/// Handle a single TCP connection: read query, decide, respond.
async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    upstreams: Arc<[SocketAddr]>,
    engine: Arc<Engine>,
    logger: Arc<QueryLogger>,
    query_timeout: Duration,
) {
    let start_time = Instant::now();
    let deadline = start_time + query_timeout;

    let query = match read_dns_message(&mut client).await {
        Some(q) => q,
        None => return,
    };

    let source = source_id(peer);
    match engine.process_query(&source, &query[2..], Some(deadline)).await {
        QueryAction::Blocked { response, domain } => {
            let bytes = response.to_bytes();
            let mut framed = Vec::with_capacity(bytes.len() + 2);
            framed.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            framed.extend_from_slice(&bytes);
            let _ = client.write_all(&framed).await;

            let elapsed = start_time.elapsed().as_secs_f64() * 1000.0;
            engine.stats().record_blocked(elapsed);
            logger.blocked(&domain, elapsed);
        }
        QueryAction::Forward { domain, event } => {
            let upstream_start = Instant::now();
            let remaining = deadline.saturating_duration_since(upstream_start);
            let exchange = tokio::time::timeout(remaining, forward_to_upstreams(&query, &upstreams));
            match exchange.await {
                Ok(Some((response, from))) => {
                    let _ = client.write_all(&response).await;
                    engine.complete(event);
                    let total = start_time.elapsed().as_secs_f64() * 1000.0;
                    let upstream = upstream_start.elapsed().as_secs_f64() * 1000.0;
                    engine.stats().record_forwarded(total);
                    logger.forwarded(&domain, total, upstream, from);
                }
                Ok(None) => logger.failed(&domain, "no upstream answered"),
                Err(_) => logger.failed(&domain, "timed out"),
            }
        }
    }
}

/// Read a length-prefixed DNS message from a TCP stream.
///
/// TCP DNS messages start with a 2-byte big-endian length prefix.
/// Returns the complete message including the length prefix.
async fn read_dns_message(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
    let mut total_read = 0;

    loop {
        if total_read == buf.len() {
            return None;
        }
        match stream.read(&mut buf[total_read..]).await {
            Ok(0) => return None,
            Ok(n) => total_read += n,
            Err(_) => return None,
        }

        if total_read >= 2 {
            let msg_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if total_read >= 2 + msg_len {
                buf.truncate(2 + msg_len);

                return Some(buf);
            }
        }
    }
}

/// Try each upstream in order until one answers.
async fn forward_to_upstreams(
    query: &[u8],
    upstreams: &[SocketAddr],
) -> Option<(Vec<u8>, SocketAddr)> {
    for &upstream in upstreams {
        if let Some(response) = forward_to_upstream(query, upstream).await {
            return Some((response, upstream));
        }
    }
    None
}

/// Forward a DNS query to the upstream server and return the response.
async fn forward_to_upstream(query: &[u8], upstream_addr: SocketAddr) -> Option<Vec<u8>> {
    let mut upstream = TcpStream::connect(upstream_addr).await.ok()?;

    upstream.write_all(query).await.ok()?;

    let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
    let mut total_read = 0;

    loop {
        if total_read == buf.len() {
            break;
        }
        match upstream.read(&mut buf[total_read..]).await {
            Ok(0) => break,
            Ok(n) => total_read += n,
            Err(_) => return None,
        }

        if total_read >= 2 {
            let msg_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if total_read >= 2 + msg_len {
                break;
            }
        }
    }

    buf.truncate(total_read);

    Some(buf)
}
