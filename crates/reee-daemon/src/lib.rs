//! reee-daemon — the `reeed` rule-evaluation daemon.
//!
//! The daemon accepts one command per connection on a local socket,
//! assembles submitted MIME messages through a content-addressed cache,
//! evaluates an ordered chain of rules against each message, and
//! records outcomes and tag mutations in a SQLite store.
//!
//! Module map:
//!
//! - [`server`]: accept loop, per-connection tasks, graceful drain.
//! - [`dispatch`]: command parsing and routing (`list` / `eval`).
//! - [`assembly`]: cache → store → sample → parse → publish pipeline.
//! - [`eval`]: the ordered rule chain with tag journaling.
//! - [`message`]: parsed messages, metadata, and store identity.
//! - [`record`]: evaluation journals and the tagger handed to rules.
//! - [`cache`]: the bounded in-memory message cache.
//! - [`store`]: transactional persistence ([`store::SqliteStore`],
//!   [`store::NullStore`]).
//! - [`rule`]: the rule callable trait and the immutable registry.
//! - [`rules`]: the declarative rule-file loader.
//! - [`reqlog`]: per-request dual-sink logging.

pub mod assembly;
pub mod cache;
pub mod dispatch;
pub mod error;
pub mod eval;
pub mod message;
pub mod record;
pub mod reqlog;
pub mod rule;
pub mod rules;
pub mod server;
pub mod store;

pub use error::{DaemonError, RequestError};
pub use server::{Daemon, DaemonBuilder, Listener};
