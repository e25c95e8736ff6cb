//! Error taxonomy for the daemon.
//!
//! [`DaemonError`] covers the server lifecycle; [`RequestError`] covers
//! everything a single request can surface to the client as an `error`
//! frame. Connection-level I/O failures are kept apart (see
//! [`HandlerError`]) because no further frame may be written once the
//! peer is gone.

use std::io;

use thiserror::Error;

use crate::rule::RuleError;
use crate::store::StoreError;

/// Server lifecycle errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// `serve` returned because `stop` was called.
    #[error("daemon: stopped")]
    Stopped,

    /// The drain deadline expired with connections still active.
    #[error("daemon: drain deadline exceeded")]
    DeadlineExceeded,

    /// A non-transient accept failure.
    #[error("daemon: accept: {0}")]
    Accept(#[source] io::Error),
}

/// Errors surfaced to the client as a terminal `error` frame.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The command arguments violate the grammar.
    #[error("{0}")]
    Malformed(String),

    /// The named group is not in the registry.
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// The named rule is not in the named group.
    #[error("rule not found: {rule} [group: {group}]")]
    RuleNotFound { rule: String, group: String },

    /// The client promised more body bytes than it sent.
    #[error("insufficient input: received only {got}/{want} expected bytes")]
    InsufficientInput { got: usize, want: usize },

    /// The body failed MIME parsing.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A rule returned an error; the chain stopped.
    #[error(transparent)]
    Rule(#[from] RuleError),

    /// A rule exceeded its per-call deadline.
    #[error("rule timeout: {rule} did not finish within {secs}s")]
    RuleTimeout { rule: String, secs: u64 },

    /// The store failed.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Outcome of one request handler, separating errors that can still be
/// reported to the client from those that cannot.
#[derive(Debug, Error)]
pub(crate) enum HandlerError {
    /// The connection itself failed; write nothing further.
    #[error("{0}")]
    Conn(#[source] io::Error),

    /// The request failed; reply with an `error` frame.
    #[error(transparent)]
    Request(#[from] RequestError),
}
