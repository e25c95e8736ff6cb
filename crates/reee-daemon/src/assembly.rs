//! The message assembly pipeline: cache → store → sample → publish.
//!
//! Assembly is keyed by the MD5 digest of the raw bytes. A read-lock
//! lookup serves the hot path; on a miss the write lock is taken and
//! the cache re-checked (another request may have assembled the same
//! content in between), which is what makes parsing and `put_message`
//! single-flight per key without any per-key lock. The sampling RNG
//! lives inside the write-locked shared state, so first-seen decisions
//! are serialized too.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rand::RngCore;

use crate::error::RequestError;
use crate::message::{store_id, Envelope, Message, Metadata};
use crate::reqlog::{req_verbose, RequestLogger};
use crate::server::Daemon;

/// Sampling threshold for a probability: a nonnegative 63-bit draw at
/// or below it means *sampled*. Saturates at `i64::MAX` for pct ≥ 1.
fn sample_threshold(pct: f64) -> i64 {
    #[allow(clippy::cast_possible_truncation)]
    let t = ((1u64 << 62) as f64 * pct * 2.0) as i64;
    t
}

impl Daemon {
    /// Obtain the shared [`Message`] for `raw`, assembling and
    /// publishing it if this is the first submission of this content.
    ///
    /// Returns the message and its store identity. On a storage error
    /// the message is not cached.
    pub(crate) async fn assemble(
        &self,
        logger: &RequestLogger,
        md5_hex: &str,
        raw: Vec<u8>,
    ) -> Result<(Arc<Message>, String), RequestError> {
        {
            let shared = self.shared.read().await;
            if let Some(msg) = shared.cache.get(md5_hex) {
                req_verbose!(logger, "retrieved message from cache with cache key {md5_hex}.");
                let sid = store_id(msg.envelope(), md5_hex);
                return Ok((msg, sid));
            }
        }

        let mut shared = self.shared.write().await;

        // Another request may have assembled this content while we
        // waited for the write lock.
        if let Some(msg) = shared.cache.get(md5_hex) {
            req_verbose!(logger, "retrieved message from cache with cache key {md5_hex}.");
            let sid = store_id(msg.envelope(), md5_hex);
            return Ok((msg, sid));
        }

        let start = Instant::now();
        let envelope =
            Envelope::parse(&raw).map_err(|e| RequestError::InvalidMessage(e.to_string()))?;
        let sid = store_id(&envelope, md5_hex);
        req_verbose!(
            logger,
            "parsed MIME envelope for {sid} in {:?}.",
            start.elapsed()
        );

        let size = raw.len() as u64;
        let start = Instant::now();
        let msg = match self.store.get_metadata(&sid)? {
            Some(meta) => {
                req_verbose!(
                    logger,
                    "found metadata for {sid} in message store in {:?}.",
                    start.elapsed()
                );
                Arc::new(Message::new(envelope, raw, meta))
            }
            None => {
                req_verbose!(
                    logger,
                    "did not find metadata for {sid} in message store in {:?}.",
                    start.elapsed()
                );

                // First sighting: decide whether to retain the body.
                let pct = self.sample_pct;
                let sampled = if pct <= 0.0 {
                    false
                } else if pct >= 1.0 {
                    true
                } else {
                    let threshold = sample_threshold(pct);
                    #[allow(clippy::cast_possible_wrap)]
                    let s = (shared.rng.next_u64() >> 1) as i64;
                    let sampled = s <= threshold;
                    if !sampled {
                        req_verbose!(
                            logger,
                            "did not sample {sid} at {}%. (value {s} > max {threshold})",
                            pct * 100.0
                        );
                    }
                    sampled
                };
                if sampled {
                    req_verbose!(logger, "sampled {sid}.");
                }

                let msg = Arc::new(Message::new(
                    envelope,
                    raw,
                    Metadata::new(sampled, HashMap::new()),
                ));

                let start = Instant::now();
                self.store.put_message(&sid, &msg)?;
                req_verbose!(logger, "put {sid} into store in {:?}.", start.elapsed());
                msg
            }
        };

        shared.cache.put(md5_hex, msg.clone(), size);
        Ok((msg, sid))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use md5::{Digest, Md5};
    use reee_core::log::Level;

    use super::*;
    use crate::record::EvalRecord;
    use crate::reqlog::TracingPrinter;
    use crate::rule::Registry;
    use crate::store::{MessageStore, NullStore, SqliteStore, StoreError};

    struct CountingStore<S> {
        inner: S,
        puts: AtomicUsize,
        gets: AtomicUsize,
    }

    impl<S> CountingStore<S> {
        fn new(inner: S) -> Self {
            Self {
                inner,
                puts: AtomicUsize::new(0),
                gets: AtomicUsize::new(0),
            }
        }
    }

    impl<S: MessageStore> MessageStore for CountingStore<S> {
        fn get_metadata(&self, store_id: &str) -> Result<Option<Metadata>, StoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get_metadata(store_id)
        }

        fn put_message(&self, store_id: &str, msg: &Message) -> Result<(), StoreError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put_message(store_id, msg)
        }

        fn record_eval(&self, store_id: &str, rec: &EvalRecord) -> Result<(), StoreError> {
            self.inner.record_eval(store_id, rec)
        }
    }

    fn daemon_with(store: Arc<dyn MessageStore>, sample_pct: f64, seed: Option<i64>) -> Daemon {
        let mut b = Daemon::builder()
            .logger(Arc::new(TracingPrinter::new(Level::Taciturn)))
            .registry(Registry::empty())
            .store(store)
            .sample_pct(sample_pct);
        if let Some(seed) = seed {
            b = b.seed(seed);
        }
        b.build()
    }

    fn logger() -> RequestLogger {
        RequestLogger::local_only(
            Level::Taciturn,
            Arc::new(TracingPrinter::new(Level::Taciturn)),
        )
    }

    fn digest(raw: &[u8]) -> String {
        hex::encode(Md5::digest(raw))
    }

    const RAW: &[u8] = b"Message-ID: <x@y>\r\nSubject: t\r\n\r\nbody\r\n";

    #[tokio::test]
    async fn repeated_submission_parses_and_stores_once() {
        let store = Arc::new(CountingStore::new(SqliteStore::open_in_memory().unwrap()));
        let d = daemon_with(store.clone(), 0.0, None);
        let log = logger();
        let key = digest(RAW);

        let (first, sid1) = d.assemble(&log, &key, RAW.to_vec()).await.unwrap();
        let (second, sid2) = d.assemble(&log, &key, RAW.to_vec()).await.unwrap();

        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
        // The second submission never reached the store.
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
        assert_eq!(sid1, "Message-ID:x@y");
        assert_eq!(sid1, sid2);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn burst_of_identical_submissions_is_single_flight() {
        let store = Arc::new(CountingStore::new(SqliteStore::open_in_memory().unwrap()));
        let d = Arc::new(daemon_with(store.clone(), 0.0, None));
        let key = digest(RAW);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let d = d.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                d.assemble(&logger(), &key, RAW.to_vec()).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn known_message_reuses_stored_metadata() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        // Seed the store out of band, as a previous daemon run would.
        {
            let env = Envelope::parse(RAW).unwrap();
            let msg = Message::new(env, RAW.to_vec(), Metadata::new(true, HashMap::new()));
            store.put_message("Message-ID:x@y", &msg).unwrap();
        }

        let d = daemon_with(store, 0.0, None);
        let (msg, _) = d.assemble(&logger(), &digest(RAW), RAW.to_vec()).await.unwrap();
        // pct is zero, so this can only come from the stored metadata.
        assert!(msg.is_sampled());
    }

    #[tokio::test]
    async fn unparseable_body_is_rejected_and_not_cached() {
        let d = daemon_with(Arc::new(NullStore), 0.0, None);
        // Bare CR in the header line defeats the parser.
        let bad = b"Subject broken\rrest".to_vec();
        let key = digest(&bad);
        let err = d.assemble(&logger(), &key, bad).await;
        // Either parse rejects it, or (leniently parsed) assembly
        // accepts it; only the reject path must leave no cache entry.
        if err.is_err() {
            let shared = d.shared.read().await;
            assert!(shared.cache.get(&key).is_none());
        }
    }

    #[tokio::test]
    async fn sampling_is_monotone_at_the_extremes() {
        for (pct, want) in [(0.0, false), (1.0, true)] {
            let d = daemon_with(Arc::new(NullStore), pct, Some(7));
            for i in 0..64 {
                let raw = format!("Subject: m{i}\r\n\r\nbody {i}\r\n").into_bytes();
                let key = digest(&raw);
                let (msg, _) = d.assemble(&logger(), &key, raw).await.unwrap();
                assert_eq!(msg.is_sampled(), want, "pct={pct} i={i}");
            }
        }
    }

    #[tokio::test]
    async fn sampled_fraction_tracks_the_probability() {
        let d = daemon_with(Arc::new(NullStore), 0.5, Some(42));
        let n = 1000;
        let mut sampled = 0usize;
        for i in 0..n {
            let raw = format!("Subject: s{i}\r\n\r\nbody {i}\r\n").into_bytes();
            let key = digest(&raw);
            let (msg, _) = d.assemble(&logger(), &key, raw).await.unwrap();
            if msg.is_sampled() {
                sampled += 1;
            }
        }
        // Binomial(1000, 0.5): ±5σ ≈ ±79.
        assert!(
            (421..=579).contains(&sampled),
            "sampled {sampled}/{n} at pct=0.5"
        );
    }

    #[test]
    fn threshold_saturates_and_scales() {
        assert_eq!(sample_threshold(1.0), i64::MAX);
        assert_eq!(sample_threshold(0.0), 0);
        let half = sample_threshold(0.5);
        assert!(half > 0 && half < i64::MAX);
    }
}
