//! Bounded in-memory cache of parsed messages keyed by content digest.
//!
//! Three independent caps drive eviction — entry count, aggregate byte
//! size, and entry age — and eviction runs while **any** cap is
//! exceeded. Recency is tracked in a stamped queue; an entry touched
//! again leaves a stale ("ghost") queue slot behind, which eviction
//! detects by comparing stamps and skips.
//!
//! The cache itself is not synchronized for mutation: the daemon's
//! shared lock guards the map (reads under the read lock, inserts under
//! the write lock). Only the recency queue carries its own mutex so a
//! lookup can record recency without the write lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::message::Message;

/// Eviction caps. A zero count or size, or an absent age, means that
/// cap is unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct CachePolicy {
    /// Maximum number of entries.
    pub max_count: usize,
    /// Maximum aggregate size in bytes, as reported at insert time.
    pub max_size: u64,
    /// Maximum entry age.
    pub max_age: Option<Duration>,
}

struct CacheEntry {
    msg: Arc<Message>,
    size: u64,
    inserted_at: Instant,
    stamp: AtomicU64,
}

struct RecencyStamp {
    key: String,
    stamp: u64,
}

/// LRU message cache keyed by MD5 hex digest.
pub struct MessageCache {
    policy: CachePolicy,
    entries: HashMap<String, CacheEntry>,
    recency: Mutex<VecDeque<RecencyStamp>>,
    seq: AtomicU64,
    total_size: u64,
}

impl MessageCache {
    /// Create an empty cache with the given policy.
    #[must_use]
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            recency: Mutex::new(VecDeque::new()),
            seq: AtomicU64::new(0),
            total_size: 0,
        }
    }

    /// Look up a message, refreshing its recency. An entry past the age
    /// cap is treated as absent; the next insert removes it.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<Message>> {
        let entry = self.entries.get(key)?;
        if let Some(max_age) = self.policy.max_age {
            if entry.inserted_at.elapsed() > max_age {
                return None;
            }
        }
        let stamp = self.seq.fetch_add(1, Ordering::Relaxed);
        entry.stamp.store(stamp, Ordering::Relaxed);
        self.recency
            .lock()
            .expect("cache recency lock poisoned")
            .push_back(RecencyStamp {
                key: key.to_string(),
                stamp,
            });
        Some(entry.msg.clone())
    }

    /// Insert (or replace) a message, then evict while any cap is
    /// exceeded. `size` is the caller-reported byte size of the entry;
    /// aggregate bookkeeping is updated by delta on replacement.
    pub fn put(&mut self, key: &str, msg: Arc<Message>, size: u64) {
        let stamp = self.seq.fetch_add(1, Ordering::Relaxed);
        let entry = CacheEntry {
            msg,
            size,
            inserted_at: Instant::now(),
            stamp: AtomicU64::new(stamp),
        };
        if let Some(old) = self.entries.insert(key.to_string(), entry) {
            self.total_size -= old.size;
        }
        self.total_size += size;
        self.recency
            .lock()
            .expect("cache recency lock poisoned")
            .push_back(RecencyStamp {
                key: key.to_string(),
                stamp,
            });
        self.evict();
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current aggregate size in bytes.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    fn over_caps(&self) -> bool {
        (self.policy.max_count > 0 && self.entries.len() > self.policy.max_count)
            || (self.policy.max_size > 0 && self.total_size > self.policy.max_size)
    }

    fn evict(&mut self) {
        if let Some(max_age) = self.policy.max_age {
            let now = Instant::now();
            let mut freed = 0u64;
            self.entries.retain(|_, e| {
                let keep = now.duration_since(e.inserted_at) <= max_age;
                if !keep {
                    freed += e.size;
                }
                keep
            });
            self.total_size -= freed;
        }

        while self.over_caps() {
            let popped = {
                let mut recency = self.recency.lock().expect("cache recency lock poisoned");
                recency.pop_front()
            };
            let Some(popped) = popped else {
                break;
            };
            // A stamp mismatch marks a ghost slot left behind by a
            // later touch of the same key.
            let live = self
                .entries
                .get(&popped.key)
                .is_some_and(|e| e.stamp.load(Ordering::Relaxed) == popped.stamp);
            if live {
                if let Some(old) = self.entries.remove(&popped.key) {
                    self.total_size -= old.size;
                }
            }
        }
    }
}
