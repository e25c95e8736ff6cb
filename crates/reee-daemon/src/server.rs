//! The connection server: accept loop, per-connection tasks, drain.
//!
//! The daemon is one value whose lifecycle is init → serve → stop. The
//! accept loop backs off exponentially on transient errors (5 ms
//! doubling to 1 s) and honors the shutdown token during the wait.
//! Each accepted connection runs in its own task carrying exactly one
//! command; `stop` cancels the root token, stops accepting, and polls
//! the active-connection count every 5 ms until the drain deadline.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use reee_core::addr::Network;
use reee_core::log::{Level, Printer};
use reee_core::protocol::{read_command, write_error, write_success};
use reee_core::{normal, verbose};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::cache::{CachePolicy, MessageCache};
use crate::dispatch::{dispatch, CmdContext};
use crate::error::{DaemonError, HandlerError};
use crate::reqlog::{req_verbose, RequestLogger, TracingPrinter};
use crate::rule::Registry;
use crate::store::{MessageStore, NullStore};

/// Object-safe byte stream, whichever transport accepted it.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) type Stream = Box<dyn AsyncStream>;
pub(crate) type Reader = BufReader<ReadHalf<Stream>>;

/// The buffered, mutex-serialized write half of a connection. Log
/// frames and the terminal result share it, which is what orders the
/// result strictly after every log frame.
pub(crate) type ResultSink = Arc<Mutex<BufWriter<WriteHalf<Stream>>>>;

/// A bound listener for either transport family.
pub enum Listener {
    /// Local filesystem socket.
    #[cfg(unix)]
    Unix(UnixListener),
    /// Loopback TCP.
    Tcp(TcpListener),
}

impl Listener {
    /// Bind `addr` on `net`. A stale socket file at the address is
    /// removed before binding.
    pub async fn bind(net: Network, addr: &str) -> io::Result<Self> {
        match net {
            #[cfg(unix)]
            Network::Unix => {
                if Path::new(addr).exists() {
                    std::fs::remove_file(addr)?;
                }
                Ok(Self::Unix(UnixListener::bind(addr)?))
            }
            #[cfg(not(unix))]
            Network::Unix => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
            Network::Tcp => Ok(Self::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    async fn accept(&self) -> io::Result<Stream> {
        match self {
            #[cfg(unix)]
            Self::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Box::new(stream))
            }
            Self::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

const BACKOFF_START: Duration = Duration::from_millis(5);
const BACKOFF_CAP: Duration = Duration::from_secs(1);
const DRAIN_POLL: Duration = Duration::from_millis(5);

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

pub(crate) struct SharedData {
    pub cache: MessageCache,
    pub rng: StdRng,
}

/// The daemon: shared store, cache, registry, and connection lifecycle.
pub struct Daemon {
    pub(crate) logger: Arc<dyn Printer + Send + Sync>,
    pub(crate) registry: Registry,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) shared: RwLock<SharedData>,
    pub(crate) sample_pct: f64,
    active: AtomicI64,
    next_conn_id: AtomicU64,
    cancel: CancellationToken,
}

impl Daemon {
    /// Start configuring a daemon.
    #[must_use]
    pub fn builder() -> DaemonBuilder {
        DaemonBuilder::default()
    }

    /// The root cancellation token; per-request scopes derive from it.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of connections currently being served.
    #[must_use]
    pub fn active_connections(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept connections until a permanent accept error or shutdown.
    ///
    /// Returns [`DaemonError::Stopped`] once [`stop`](Self::stop) (or
    /// any cancellation of the root token) fires; in-flight
    /// connections are left to finish on their own.
    pub async fn serve(self: Arc<Self>, listener: Listener) -> Result<(), DaemonError> {
        let mut delay: Option<Duration> = None;
        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok(stream) => {
                        delay = None;
                        self.spawn_connection(stream);
                    }
                    Err(e) if is_transient(&e) => {
                        let wait = delay.map_or(BACKOFF_START, |d| (d * 2).min(BACKOFF_CAP));
                        delay = Some(wait);
                        normal!(self.logger, "daemon: accept error: {e}; retrying in {wait:?}");
                        tokio::select! {
                            () = tokio::time::sleep(wait) => {}
                            () = self.cancel.cancelled() => return Err(DaemonError::Stopped),
                        }
                    }
                    Err(e) => return Err(DaemonError::Accept(e)),
                },
                () = self.cancel.cancelled() => return Err(DaemonError::Stopped),
            }
        }
    }

    fn spawn_connection(self: &Arc<Self>, stream: Stream) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::SeqCst);
        let daemon = self.clone();
        tokio::spawn(async move {
            // A panic escaping a rule or handler unwinds only this
            // connection; the daemon itself keeps serving.
            let outcome = std::panic::AssertUnwindSafe(daemon.clone().handle(conn_id, stream))
                .catch_unwind()
                .await;
            if let Err(panic) = outcome {
                let what = panic
                    .downcast_ref::<&str>()
                    .copied()
                    .map(str::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                normal!(
                    daemon.logger,
                    "[conn {conn_id}]: panic in connection task: {what}"
                );
            }
            daemon.active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Serve exactly one command on an accepted connection.
    async fn handle(self: Arc<Self>, conn_id: u64, stream: Stream) {
        let (r, w) = tokio::io::split(stream);
        let mut reader: Reader = BufReader::new(r);
        let writer: ResultSink = Arc::new(Mutex::new(BufWriter::new(w)));

        let cmd = match read_command(&mut reader).await {
            Ok(cmd) => cmd,
            Err(e) => {
                normal!(self.logger, "error: [conn {conn_id}]: {e}");
                return;
            }
        };

        let log = RequestLogger::new(
            conn_id,
            &cmd.id,
            cmd.level,
            writer.clone(),
            self.logger.clone(),
        );
        let mut ctx = CmdContext {
            conn_id,
            cmd_id: cmd.id.clone(),
            args: cmd.args.clone(),
            is_eof: false,
            log,
            cancel: self.cancel.child_token(),
        };
        req_verbose!(ctx.log, "daemon received {} command", cmd.kind);

        let prefix = format!("[conn {}, cmd {}]: ", ctx.conn_id, ctx.cmd_id);
        match dispatch(&self, &mut ctx, cmd.kind, &mut reader).await {
            Err(HandlerError::Conn(e)) => {
                normal!(self.logger, "{prefix}error: {e}");
            }
            Err(HandlerError::Request(e)) => {
                verbose!(self.logger, "{prefix}error: {e}");
                let mut w = writer.lock().await;
                if let Err(we) = write_error(&mut *w, &e.to_string()).await {
                    normal!(self.logger, "{prefix}error: {we}");
                }
            }
            Ok(data) => {
                let data = data.unwrap_or_default();
                let mut w = writer.lock().await;
                match write_success(&mut *w, &data).await {
                    Err(we) => normal!(self.logger, "{prefix}error: {we}"),
                    Ok(()) => verbose!(
                        self.logger,
                        "{prefix}success: {} bytes of result data written",
                        data.len()
                    ),
                }
            }
        }
    }

    /// Stop accepting and wait for in-flight connections to drain.
    ///
    /// Polls the active count every 5 ms. On deadline expiry the
    /// remaining tasks are left to finish in the background and
    /// [`DaemonError::DeadlineExceeded`] is returned; that is non-fatal
    /// but worth logging.
    pub async fn stop(&self, deadline: Duration) -> Result<(), DaemonError> {
        self.cancel.cancel();
        let deadline = Instant::now() + deadline;
        while self.active.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return Err(DaemonError::DeadlineExceeded);
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        Ok(())
    }
}

/// Configures and builds a [`Daemon`].
pub struct DaemonBuilder {
    logger: Arc<dyn Printer + Send + Sync>,
    registry: Registry,
    store: Arc<dyn MessageStore>,
    cache_policy: CachePolicy,
    sample_pct: f64,
    seed: Option<i64>,
}

impl Default for DaemonBuilder {
    fn default() -> Self {
        Self {
            logger: Arc::new(TracingPrinter::new(Level::Normal)),
            registry: Registry::empty(),
            store: Arc::new(NullStore),
            cache_policy: CachePolicy::default(),
            sample_pct: 0.0,
            seed: None,
        }
    }
}

impl DaemonBuilder {
    /// The daemon's local log sink.
    #[must_use]
    pub fn logger(mut self, logger: Arc<dyn Printer + Send + Sync>) -> Self {
        self.logger = logger;
        self
    }

    /// The immutable rule registry.
    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// The message store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = store;
        self
    }

    /// Cache eviction caps.
    #[must_use]
    pub const fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Probability that a first-seen message is sampled, in `[0, 1]`.
    #[must_use]
    pub const fn sample_pct(mut self, pct: f64) -> Self {
        self.sample_pct = pct;
        self
    }

    /// Fixed seed for the sampling source, for reproducible runs.
    #[must_use]
    pub const fn seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Freeze the configuration into a daemon.
    #[must_use]
    pub fn build(self) -> Daemon {
        #[allow(clippy::cast_sign_loss)]
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed as u64),
            None => StdRng::from_entropy(),
        };
        Daemon {
            logger: self.logger,
            registry: self.registry,
            store: self.store,
            shared: RwLock::new(SharedData {
                cache: MessageCache::new(self.cache_policy),
                rng,
            }),
            sample_pct: self.sample_pct,
            active: AtomicI64::new(0),
            next_conn_id: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }
}
