//! Filtering proxy orchestration.
//!
//! Binds transports, runs the periodic stats line and the reload signal
//! handler, and waits for shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::Engine;
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};

/// Configuration for the filtering proxy.
pub struct ProxyConfig {
    /// Local address to bind (e.g., 127.0.0.1:5353)
    pub bind_addr: SocketAddr,
    /// Upstream DNS server addresses (races all, uses first response)
    pub upstreams: Vec<SocketAddr>,
    /// Deadline for a whole query, store lookup and upstream exchange included
    pub query_timeout: Duration,
    /// How often the stats line is logged
    pub stats_interval: Duration,
}

/// Run the filtering proxy with the given configuration.
///
/// Starts UDP and TCP transports on the bind address and runs until ctrl-c.
pub async fn run(config: ProxyConfig, engine: Arc<Engine>) -> io::Result<()> {
    let udp = UdpTransport::bind(config.bind_addr).await?;
    let tcp = TcpTransport::bind(config.bind_addr).await?;

    let upstream_strs: Vec<_> = config.upstreams.iter().map(|a| a.to_string()).collect();
    info!(
        bind = %config.bind_addr,
        upstreams = %upstream_strs.join(", "),
        bulk_domains = engine.bulk_len(),
        "DNS filter listening"
    );

    udp.start(config.upstreams.clone(), engine.clone(), config.query_timeout);
    tcp.start(config.upstreams, engine.clone(), config.query_timeout);

    spawn_stats_ticker(engine.clone(), config.stats_interval);
    #[cfg(unix)]
    spawn_reload_handler(engine)?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    Ok(())
}

fn spawn_stats_ticker(engine: Arc<Engine>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let stats = engine.stats_snapshot_and_reset();
            info!(
                uptime_secs = stats.uptime_secs,
                cache = engine.cache_len(),
                requests = stats.requests,
                forwarded = stats.forwarded,
                blocked = stats.blocked,
                hot_hits = stats.hot_hits,
                bulk_hits = stats.bulk_hits,
                store_lookups = stats.store_lookups,
                store_failures = stats.store_failures,
                telemetry_dropped = engine.telemetry_dropped(),
                avg_response_ms = stats.avg_response_ms,
                "stats"
            );
        }
    });
}

/// Reload category data on SIGHUP.
#[cfg(unix)]
fn spawn_reload_handler(engine: Arc<Engine>) -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading category data");
            let engine = Arc::clone(&engine);
            match tokio::task::spawn_blocking(move || engine.reload()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "reload failed, keeping previous data"),
                Err(e) => error!(error = %e, "reload task failed"),
            }
        }
    });
    Ok(())
}
