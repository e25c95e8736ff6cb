//! Persistent message store.
//!
//! The daemon records three things per message: the message row itself
//! (body and headers only when sampled), its tags, and the journal of
//! every evaluation run against it. [`SqliteStore`] is the durable
//! implementation; [`NullStore`] backs `--no-db`.

mod null;
mod sqlite;

pub use null::NullStore;
pub use sqlite::SqliteStore;

use thiserror::Error;

use crate::message::{Message, Metadata};
use crate::record::EvalRecord;

/// Errors produced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("store: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure creating or opening the database.
    #[error("store: {0}")]
    Io(#[from] std::io::Error),

    /// The message carries a `Date` header the parser rejects.
    #[error("store: invalid Date header: {0}")]
    BadDate(String),

    /// Header serialization failed.
    #[error("store: {0}")]
    HeaderJson(#[from] serde_json::Error),
}

/// Transactional persistence of messages, tags, and evaluation records.
///
/// Implementations are shared across all request tasks; each method is
/// individually safe to call concurrently, and `record_eval` is the
/// only operation requiring cross-table atomicity.
pub trait MessageStore: Send + Sync {
    /// Fetch the stored metadata for `store_id`.
    ///
    /// Returns `Ok(None)` when no such message exists — distinct from a
    /// message that exists with an empty tag map. Deleted tags (NULL
    /// value) are not reported.
    fn get_metadata(&self, store_id: &str) -> Result<Option<Metadata>, StoreError>;

    /// Insert the message row. Idempotent on the primary key; body and
    /// headers are written only when the message is sampled.
    fn put_message(&self, store_id: &str, msg: &Message) -> Result<(), StoreError>;

    /// Atomically record one evaluation: the group row, every rule row,
    /// and every observed tag change, upserted in journal order. Any
    /// failure rolls the whole record back.
    fn record_eval(&self, store_id: &str, rec: &EvalRecord) -> Result<(), StoreError>;
}
