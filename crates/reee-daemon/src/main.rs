//! reeed — the reee rule-evaluation daemon.
//!
//! Binds the local socket, loads the rule registry, opens the message
//! store, and serves until a terminating signal arrives, then drains
//! connections within a short deadline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use reee_core::addr::{default_net_addr, Network};
use reee_core::log::{Level, Printer};
use reee_core::verbose;
use reee_daemon::cache::CachePolicy;
use reee_daemon::reqlog::TracingPrinter;
use reee_daemon::rule::Registry;
use reee_daemon::rules;
use reee_daemon::store::{MessageStore, NullStore, SqliteStore};
use reee_daemon::{Daemon, DaemonError, Listener};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// How long `stop` waits for in-flight connections.
const STOP_DEADLINE: Duration = Duration::from_millis(200);

/// Default cache caps: entries, aggregate bytes, age.
const CACHE_MAX_COUNT: usize = 32;
const CACHE_MAX_SIZE: u64 = 64 * 1024 * 1024;
const CACHE_MAX_AGE: Duration = Duration::from_secs(15 * 60);

/// reeed - evaluate scripted rules against mail submitted by reee
#[derive(Parser, Debug)]
#[command(name = "reeed", version, about, long_about = None)]
struct Args {
    /// Daemon address
    #[arg(long, env = "REEE_ADDR")]
    addr: Option<String>,

    /// Daemon network ("unix" or "tcp")
    #[arg(long, env = "REEE_NET")]
    net: Option<String>,

    /// Database path
    #[arg(long, env = "REEE_DB")]
    db: Option<PathBuf>,

    /// Disable persistence entirely
    #[arg(long, conflicts_with = "db")]
    no_db: bool,

    /// Rule file directory
    #[arg(long, env = "REEE_RULES")]
    rules: Option<PathBuf>,

    /// Probability, in [0, 1], of retaining a first-seen message's
    /// body and headers
    #[arg(long, default_value_t = 0.1)]
    sample: f64,

    /// Fixed seed for the sampling source
    #[arg(long)]
    seed: Option<i64>,

    /// Log errors only
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn level(&self) -> Level {
        if self.verbose {
            Level::Verbose
        } else if self.quiet {
            Level::Taciturn
        } else {
            Level::Normal
        }
    }

    fn net_addr(&self) -> Result<(Network, String)> {
        let (default_net, default_addr) = default_net_addr();
        let net = match &self.net {
            Some(s) => s.parse::<Network>()?,
            None => default_net,
        };
        let addr = self.addr.clone().unwrap_or(default_addr);
        Ok((net, addr))
    }

    fn db_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.db {
            return Ok(path.clone());
        }
        let cache_dir = dirs::cache_dir().context("no user cache directory")?;
        Ok(cache_dir.join("reee").join("reee.db"))
    }

    fn rules_dir(&self) -> Option<PathBuf> {
        if let Some(path) = &self.rules {
            return Some(path.clone());
        }
        dirs::config_dir().map(|d| d.join("reee").join("rules"))
    }
}

fn init_tracing(lvl: Level) {
    let filter = match lvl {
        Level::Taciturn => "warn",
        Level::Normal => "info",
        Level::Verbose => "debug",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.sample) {
        bail!("--sample must be within [0, 1], got {}", args.sample);
    }

    let level = args.level();
    init_tracing(level);
    let logger = Arc::new(TracingPrinter::new(level));

    let registry = match args.rules_dir() {
        Some(dir) => {
            let registry = rules::load_dir(&dir)?;
            verbose!(
                logger,
                "loaded {} groups and {} rules from {}.",
                registry.group_count(),
                registry.rule_count(),
                dir.display()
            );
            registry
        }
        None => Registry::empty(),
    };

    let store: Arc<dyn MessageStore> = if args.no_db {
        Arc::new(NullStore)
    } else {
        let path = args.db_path()?;
        let store = SqliteStore::open(&path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        verbose!(logger, "opened message store at {}.", path.display());
        Arc::new(store)
    };

    let (net, addr) = args.net_addr()?;
    let listener = Listener::bind(net, &addr)
        .await
        .with_context(|| format!("failed to bind (network {net}, address {addr})"))?;
    verbose!(logger, "listening... (network: {net}, address: {addr})");

    let mut builder = Daemon::builder()
        .logger(logger.clone())
        .registry(registry)
        .store(store)
        .cache_policy(CachePolicy {
            max_count: CACHE_MAX_COUNT,
            max_size: CACHE_MAX_SIZE,
            max_age: Some(CACHE_MAX_AGE),
        })
        .sample_pct(args.sample);
    if let Some(seed) = args.seed {
        builder = builder.seed(seed);
    }
    let daemon = Arc::new(builder.build());

    let mut serve_task = tokio::spawn(daemon.clone().serve(listener));

    tokio::select! {
        res = &mut serve_task => {
            // The accept loop only returns early on a fatal error.
            match res.context("serve task panicked")? {
                Err(DaemonError::Stopped) | Ok(()) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        () = wait_for_signal() => {}
    }

    verbose!(logger, "stopping...");
    match daemon.stop(STOP_DEADLINE).await {
        Ok(()) => verbose!(logger, "stopped."),
        Err(e) => tracing::warn!("drain incomplete: {e}"),
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("failed to install SIGINT handler: {e}");
            return std::future::pending().await;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("failed to install SIGTERM handler: {e}");
            return std::future::pending().await;
        }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("failed to install SIGHUP handler: {e}");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to wait for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
