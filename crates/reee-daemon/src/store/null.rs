use super::{MessageStore, StoreError};
use crate::message::{Message, Metadata};
use crate::record::EvalRecord;

/// A store that remembers nothing.
///
/// Every lookup misses, every write succeeds. With this store each
/// submission is treated as first-seen, so the sampling decision is
/// made anew each time and nothing survives the process.
#[derive(Debug, Default)]
pub struct NullStore;

impl MessageStore for NullStore {
    fn get_metadata(&self, _store_id: &str) -> Result<Option<Metadata>, StoreError> {
        Ok(None)
    }

    fn put_message(&self, _store_id: &str, _msg: &Message) -> Result<(), StoreError> {
        Ok(())
    }

    fn record_eval(&self, _store_id: &str, _rec: &EvalRecord) -> Result<(), StoreError> {
        Ok(())
    }
}
