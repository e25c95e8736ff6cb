//! Evaluation journals and the tagger handed to rules.
//!
//! One [`EvalRecord`] is produced per `eval` command; it carries one
//! [`RuleEvalRecord`] per rule actually run, each with the tag changes
//! that rule issued, in issue order. The whole record is persisted
//! atomically by the store.

use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Local};

use crate::message::Message;

/// One tag mutation. An absent value means the tag was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagChange {
    /// When the rule issued the change.
    pub time: DateTime<Local>,
    /// Tag key.
    pub key: String,
    /// New value, or `None` for deletion.
    pub value: Option<String>,
}

/// Journal of one rule's run within an evaluation.
#[derive(Debug, Clone)]
pub struct RuleEvalRecord {
    /// Rule name.
    pub rule: String,
    /// When the rule call started.
    pub start: DateTime<Local>,
    /// When the rule call ended (the deadline, for a timed-out rule).
    pub end: DateTime<Local>,
    /// The advisory match flag. Undefined when `error` is set.
    pub matched: bool,
    /// The rule's error text, when it failed or timed out.
    pub error: Option<String>,
    /// Tag changes in the order the rule issued them.
    pub tag_changes: Vec<TagChange>,
}

/// Journal of one `eval` command.
#[derive(Debug, Clone)]
pub struct EvalRecord {
    /// The group that was evaluated.
    pub group: String,
    /// When the chain started.
    pub start: DateTime<Local>,
    /// When the chain ended.
    pub end: DateTime<Local>,
    /// One record per rule actually run, in chain order.
    pub rules: Vec<RuleEvalRecord>,
}

impl EvalRecord {
    /// The first rule error in the chain, if any. A record with an
    /// error stopped early and its terminal stop flag is undefined.
    #[must_use]
    pub fn first_error(&self) -> Option<&str> {
        self.rules.iter().find_map(|r| r.error.as_deref())
    }
}

/// The tag view a rule receives, scoped to one [`RuleEvalRecord`].
///
/// Reads are consistent snapshots under the message's read lock;
/// set/delete mutate the live metadata under the write lock and append
/// a [`TagChange`] to this rule's journal. The journal sits behind its
/// own mutex so a rule may be driven across await points.
pub struct Tagger {
    msg: Arc<Message>,
    changes: Mutex<Vec<TagChange>>,
}

impl Tagger {
    /// Create a tagger journaling against `msg`.
    #[must_use]
    pub fn new(msg: Arc<Message>) -> Self {
        Self {
            msg,
            changes: Mutex::new(Vec::new()),
        }
    }

    /// All current tag keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let meta = self.msg.metadata().read().expect("message lock poisoned");
        meta.tags().keys().cloned().collect()
    }

    /// The current value of `key`, if set.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let meta = self.msg.metadata().read().expect("message lock poisoned");
        meta.tags().get(key).cloned()
    }

    /// Set `key` to `value` and journal the change.
    pub fn set(&self, key: &str, value: &str) {
        {
            let mut meta = self.msg.metadata().write().expect("message lock poisoned");
            meta.tags_mut().insert(key.to_string(), value.to_string());
        }
        self.push(key, Some(value.to_string()));
    }

    /// Delete `key` and journal the deletion. Deleting an absent key is
    /// journaled all the same; the store treats it as an upsert of an
    /// absent value.
    pub fn delete(&self, key: &str) {
        {
            let mut meta = self.msg.metadata().write().expect("message lock poisoned");
            meta.tags_mut().remove(key);
        }
        self.push(key, None);
    }

    fn push(&self, key: &str, value: Option<String>) {
        self.changes
            .lock()
            .expect("tagger lock poisoned")
            .push(TagChange {
                time: Local::now(),
                key: key.to_string(),
                value,
            });
    }

    /// Drain the journal, leaving the tagger empty.
    #[must_use]
    pub fn take_changes(&self) -> Vec<TagChange> {
        std::mem::take(&mut *self.changes.lock().expect("tagger lock poisoned"))
    }
}
