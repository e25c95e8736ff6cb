//! Per-request dual-sink logging.
//!
//! Each request logs through a [`RequestLogger`] routing to two sinks:
//! the remote client, as `log` frames on the connection at the level
//! the client requested, and the daemon's own local sink at the
//! daemon's configured level. The effective filter is the maximum of
//! the two levels so a verbose operator still sees detail the client
//! did not ask for. Once a remote write fails the remote sink is
//! suppressed for the rest of the request; local logging continues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reee_core::log::{Level, Printer};
use reee_core::protocol::write_log;
use reee_core::{normal, verbose};

use crate::server::ResultSink;

/// A [`Printer`] backed by the daemon's `tracing` subscriber.
///
/// Levels map to tracing's severity: taciturn messages are the ones an
/// operator must see (`warn`), normal maps to `info`, verbose to
/// `debug`. Filtering by the configured level happens here, before the
/// subscriber sees the event.
pub struct TracingPrinter {
    lvl: Level,
}

impl TracingPrinter {
    /// Create a printer at the daemon's configured level.
    #[must_use]
    pub const fn new(lvl: Level) -> Self {
        Self { lvl }
    }
}

impl Printer for TracingPrinter {
    fn print(&self, lvl: Level, msg: &str) {
        if self.lvl < lvl {
            return;
        }
        match lvl {
            Level::Taciturn => tracing::warn!("{msg}"),
            Level::Normal => tracing::info!("{msg}"),
            Level::Verbose => tracing::debug!("{msg}"),
        }
    }

    fn level(&self) -> Level {
        self.lvl
    }
}

struct RemoteSink {
    w: ResultSink,
    lvl: Level,
    ok: AtomicBool,
}

/// Dual-sink logger scoped to one command on one connection.
pub struct RequestLogger {
    prefix: String,
    effective: Level,
    remote: Option<RemoteSink>,
    local: Arc<dyn Printer + Send + Sync>,
}

impl RequestLogger {
    /// Build the logger for a request.
    ///
    /// `remote_lvl` is the level the client asked for; the local sink's
    /// own level raises the effective filter when it is higher.
    pub(crate) fn new(
        conn_id: u64,
        cmd_id: &str,
        remote_lvl: Level,
        remote: ResultSink,
        local: Arc<dyn Printer + Send + Sync>,
    ) -> Self {
        Self {
            prefix: format!("[conn {conn_id}, cmd {cmd_id}]: "),
            effective: remote_lvl.max(local.level()),
            remote: Some(RemoteSink {
                w: remote,
                lvl: remote_lvl,
                ok: AtomicBool::new(true),
            }),
            local,
        }
    }

    /// A logger with no remote sink. Used where no connection exists
    /// (startup, tests).
    #[must_use]
    pub fn local_only(lvl: Level, local: Arc<dyn Printer + Send + Sync>) -> Self {
        Self {
            prefix: String::new(),
            effective: lvl.max(local.level()),
            remote: None,
            local,
        }
    }

    /// The effective level of this request.
    #[must_use]
    pub fn level(&self) -> Level {
        self.effective
    }

    /// Whether a message at `lvl` would be emitted at all. Callers use
    /// this to skip formatting.
    #[must_use]
    pub fn enabled(&self, lvl: Level) -> bool {
        lvl <= self.effective
    }

    /// Route one message to both sinks, each at its own level.
    pub async fn print(&self, lvl: Level, msg: &str) {
        if !self.enabled(lvl) {
            return;
        }
        let msg = format!("{}{}", self.prefix, msg);
        if let Some(remote) = &self.remote {
            if lvl <= remote.lvl && remote.ok.load(Ordering::Acquire) {
                let mut w = remote.w.lock().await;
                if let Err(e) = write_log(&mut *w, lvl, &msg).await {
                    remote.ok.store(false, Ordering::Release);
                    normal!(self.local, "{}failed to log message: {e}", self.prefix);
                    verbose!(self.local, "{}\tlog message: {msg}", self.prefix);
                }
            }
        }
        if lvl <= self.local.level() {
            self.local.print(lvl, &msg);
        }
    }
}

/// Log at verbose level through a [`RequestLogger`], formatting only
/// when the effective level allows it. Usable in async contexts only.
macro_rules! req_verbose {
    ($log:expr, $($arg:tt)*) => {{
        if $log.enabled(::reee_core::log::Level::Verbose) {
            $log.print(::reee_core::log::Level::Verbose, &format!($($arg)*)).await;
        }
    }};
}

pub(crate) use req_verbose;
