#![warn(clippy::all)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use cache_proxy::blocklist::Blocklist;
use cache_proxy::cache::ResponseCache;
use cache_proxy::console;
use cache_proxy::server::{self, ProxyState, Stats};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8888)]
    port: u16,

    /// Seed the blocklist from a file, one host per line.
    #[arg(long)]
    blocklist: Option<PathBuf>,

    /// Seconds a cached response stays valid.
    #[arg(long, default_value_t = 30)]
    cache_ttl: u64,

    /// Seconds between stats reports, 0 to disable.
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    /// Don't run the interactive management console on stdin.
    #[arg(long)]
    no_console: bool,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let blocklist = Arc::new(Blocklist::new());
    if let Some(ref path) = args.blocklist {
        blocklist.load(path)?;
    }

    let cache = Arc::new(ResponseCache::new(Duration::from_secs(args.cache_ttl)));
    let stats = Arc::new(Stats::new());

    if args.stats_interval > 0 {
        let stats = stats.clone();
        let interval = args.stats_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval));
            timer.tick().await;
            loop {
                timer.tick().await;
                stats.print();
            }
        });
    }

    if !args.no_console {
        tokio::spawn(console::run(blocklist.clone()));
    }

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = server::bind(addr)?;

    info!("🚀 Proxy listening on {addr}");
    info!(
        "   cache ttl {}s, {} blocked hosts at startup",
        args.cache_ttl,
        blocklist.len()
    );

    server::serve(
        listener,
        ProxyState {
            blocklist,
            cache,
            stats,
        },
    )
    .await
}
