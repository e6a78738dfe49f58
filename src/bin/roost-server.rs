//! Roost Server Binary
//!
//! Runs the single-threaded reactor on a blocking thread; Ctrl+C clears
//! the running flag and the server drains before exiting.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use roost::storage::{AofConfig, AofStore, AofSyncMode, KvStore, MemoryStore};
use roost::{Config, Server};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Roost Server - Single-Threaded RESP Server
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Port number
    #[arg(short, long, default_value_t = 6379)]
    port: u16,

    /// Listen backlog
    #[arg(long, default_value_t = 128)]
    backlog: i32,

    /// Events drained per reactor wait
    #[arg(long, default_value_t = 128)]
    max_events: usize,

    /// Upper bound on a single reactor wait, in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Statistics log interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 60)]
    stats_interval_secs: u64,

    /// How long shutdown waits for pending replies, in milliseconds
    #[arg(long, default_value_t = 5000)]
    drain_timeout_ms: u64,

    /// Append-only file; keys live in memory only when omitted
    #[arg(long)]
    aof: Option<PathBuf>,

    /// AOF sync policy
    #[arg(long, value_enum, default_value_t = SyncPolicy::No)]
    aof_sync: SyncPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SyncPolicy {
    No,
    Everysec,
    Always,
}

impl SyncPolicy {
    fn mode(self) -> AofSyncMode {
        match self {
            SyncPolicy::No => AofSyncMode::No,
            SyncPolicy::Everysec => AofSyncMode::EverySecond,
            SyncPolicy::Always => AofSyncMode::Always,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("roost=info".parse()?))
        .init();

    let args = Args::parse();

    let stats_interval = (args.stats_interval_secs > 0)
        .then(|| Duration::from_secs(args.stats_interval_secs));
    let mut config = Config::default()
        .with_bind(&args.bind)
        .with_port(args.port)
        .with_backlog(args.backlog)
        .with_max_events(args.max_events)
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms))
        .with_stats_interval(stats_interval)
        .with_drain_timeout(Duration::from_millis(args.drain_timeout_ms));

    let store: Box<dyn KvStore + Send> = match &args.aof {
        Some(path) => {
            let sync_mode = args.aof_sync.mode();
            if sync_mode == AofSyncMode::EverySecond {
                config = config.with_flush_interval(Some(Duration::from_secs(1)));
            }
            let aof_config = AofConfig::default()
                .with_path(path)
                .with_sync_mode(sync_mode);
            Box::new(AofStore::open(aof_config)?)
        }
        None => Box::new(MemoryStore::new()),
    };

    let server = Server::bind(config, store)?;
    info!(
        "Starting Roost server on {} (aof: {})",
        server.local_addr(),
        args.aof
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "off".to_string())
    );

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            flag.store(false, Ordering::Release);
        }
    });

    tokio::task::spawn_blocking(move || server.run(&running)).await??;
    Ok(())
}
