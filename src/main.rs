use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::error;
use tracing_subscriber::EnvFilter;

use sieve::config::EngineConfig;
use sieve::engine::Engine;
use sieve::proxy::{self, ProxyConfig};

#[derive(Parser)]
#[command(name = "sieve")]
#[command(about = "Category based DNS filtering proxy", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "sieve.toml")]
    config: PathBuf,

    /// Local port to listen on
    #[arg(short, long, default_value = "5353")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Upstream DNS server (host:port), repeat to race several
    #[arg(short, long, default_value = "8.8.8.8:53")]
    upstream: Vec<String>,

    /// Deadline for a single query in milliseconds
    #[arg(long, default_value = "2000")]
    query_timeout_ms: u64,

    /// Seconds between stats lines
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .init();
}

fn run(args: Args) -> Result<()> {
    let config = EngineConfig::load(&args.config)
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;

    let bind_addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("invalid bind address")?;
    let upstreams = args
        .upstream
        .iter()
        .map(|u| {
            u.parse::<SocketAddr>()
                .with_context(|| format!("invalid upstream address {}", u))
        })
        .collect::<Result<Vec<_>>>()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let engine = {
        let _guard = rt.enter();
        Arc::new(Engine::open(config).context("failed to start filtering engine")?)
    };

    let proxy_config = ProxyConfig {
        bind_addr,
        upstreams,
        query_timeout: Duration::from_millis(args.query_timeout_ms),
        stats_interval: Duration::from_secs(args.stats_interval.max(1)),
    };
    rt.block_on(proxy::run(proxy_config, engine))?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
