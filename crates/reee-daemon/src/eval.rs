//! The ordered rule chain.
//!
//! Rules run in registry order. A rule's match flag is advisory and
//! recorded; only an error (or a timeout) stops the chain. Every rule
//! actually run leaves a [`RuleEvalRecord`] carrying its tag journal,
//! and the whole [`EvalRecord`] is persisted atomically afterwards.
//! When both a rule error and a persistence error occur, the rule
//! error wins.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Local};
use tokio_util::sync::CancellationToken;

use crate::error::RequestError;
use crate::message::Message;
use crate::record::{EvalRecord, RuleEvalRecord, Tagger};
use crate::reqlog::{req_verbose, RequestLogger};
use crate::rule::Rule;
use crate::store::MessageStore;

/// Deadline for a single rule call. Scripted rules may be CPU-bound;
/// a rule that has not returned by then is recorded as timed out.
pub const RULE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `rules` against `msg` and persist the outcome under `store_id`.
pub async fn run_chain(
    store: &dyn MessageStore,
    cancel: &CancellationToken,
    logger: &RequestLogger,
    store_id: &str,
    msg: &Arc<Message>,
    group: &str,
    rules: &[Arc<dyn Rule>],
) -> Result<(), RequestError> {
    run_chain_with_timeout(store, cancel, logger, store_id, msg, group, rules, RULE_TIMEOUT).await
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_chain_with_timeout(
    store: &dyn MessageStore,
    cancel: &CancellationToken,
    logger: &RequestLogger,
    store_id: &str,
    msg: &Arc<Message>,
    group: &str,
    rules: &[Arc<dyn Rule>],
    rule_timeout: Duration,
) -> Result<(), RequestError> {
    let mut record = EvalRecord {
        group: group.to_string(),
        start: Local::now(),
        end: Local::now(),
        rules: Vec::with_capacity(rules.len()),
    };

    let mut rule_err: Option<RequestError> = None;
    let chain_start = std::time::Instant::now();

    for rule in rules {
        let start = Local::now();
        let tagger = Tagger::new(msg.clone());

        let outcome =
            tokio::time::timeout(rule_timeout, rule.eval(cancel, logger, msg, &tagger)).await;

        let (end, matched, error) = match outcome {
            Ok(Ok(matched)) => (Local::now(), matched, None),
            Ok(Err(e)) => (Local::now(), false, Some(e)),
            Err(_elapsed) => {
                // The record reflects the deadline as the end time.
                let end = deadline_of(start, rule_timeout);
                let err = RequestError::RuleTimeout {
                    rule: rule.name().to_string(),
                    secs: rule_timeout.as_secs(),
                };
                record.rules.push(RuleEvalRecord {
                    rule: rule.name().to_string(),
                    start,
                    end,
                    matched: false,
                    error: Some(err.to_string()),
                    tag_changes: tagger.take_changes(),
                });
                req_verbose!(logger, "rule {} ended early with error: {err}", rule.name());
                rule_err = Some(err);
                break;
            }
        };

        let error_text = error.as_ref().map(ToString::to_string);
        record.rules.push(RuleEvalRecord {
            rule: rule.name().to_string(),
            start,
            end,
            matched,
            error: error_text,
            tag_changes: tagger.take_changes(),
        });

        if let Some(e) = error {
            req_verbose!(logger, "rule {} ended early with error: {e}", rule.name());
            rule_err = Some(RequestError::Rule(e));
            break;
        }
    }

    record.end = Local::now();
    req_verbose!(
        logger,
        "evaluated {} rules in {:?}.",
        record.rules.len(),
        chain_start.elapsed()
    );

    let persist_start = std::time::Instant::now();
    let persisted = store.record_eval(store_id, &record);
    if let Some(e) = rule_err {
        return Err(e);
    }
    persisted?;
    req_verbose!(
        logger,
        "recorded evaluation record in {:?}.",
        persist_start.elapsed()
    );
    Ok(())
}

fn deadline_of(start: DateTime<Local>, timeout: Duration) -> DateTime<Local> {
    start + ChronoDuration::milliseconds(i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use reee_core::log::Level;

    use super::*;
    use crate::message::{Envelope, Metadata};
    use crate::record::Tagger;
    use crate::rule::RuleError;
    use crate::store::{NullStore, StoreError};

    fn message() -> Arc<Message> {
        let raw = b"Subject: t\r\n\r\nbody\r\n";
        Arc::new(Message::new(
            Envelope::parse(raw).unwrap(),
            raw.to_vec(),
            Metadata::default(),
        ))
    }

    fn logger() -> RequestLogger {
        RequestLogger::local_only(
            Level::Taciturn,
            Arc::new(crate::reqlog::TracingPrinter::new(Level::Taciturn)),
        )
    }

    enum Behavior {
        Match(bool),
        Fail(&'static str),
        SetTagAndMatch(&'static str, &'static str),
        Hang,
    }

    struct TestRule {
        name: &'static str,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl TestRule {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Rule for TestRule {
        fn name(&self) -> &str {
            self.name
        }

        async fn eval(
            &self,
            _cancel: &CancellationToken,
            _logger: &RequestLogger,
            _msg: &Message,
            tagger: &Tagger,
        ) -> Result<bool, RuleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Match(m) => Ok(*m),
                Behavior::Fail(msg) => Err(RuleError::Failed {
                    rule: self.name.to_string(),
                    message: (*msg).to_string(),
                }),
                Behavior::SetTagAndMatch(k, v) => {
                    tagger.set(k, v);
                    Ok(true)
                }
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    /// A store that captures the record it was asked to persist.
    #[derive(Default)]
    struct CapturingStore(Mutex<Option<EvalRecord>>);

    impl MessageStore for CapturingStore {
        fn get_metadata(&self, _: &str) -> Result<Option<Metadata>, StoreError> {
            Ok(None)
        }

        fn put_message(&self, _: &str, _: &Message) -> Result<(), StoreError> {
            Ok(())
        }

        fn record_eval(&self, _: &str, rec: &EvalRecord) -> Result<(), StoreError> {
            *self.0.lock().unwrap() = Some(rec.clone());
            Ok(())
        }
    }

    struct FailingStore;

    impl MessageStore for FailingStore {
        fn get_metadata(&self, _: &str) -> Result<Option<Metadata>, StoreError> {
            Ok(None)
        }

        fn put_message(&self, _: &str, _: &Message) -> Result<(), StoreError> {
            Ok(())
        }

        fn record_eval(&self, _: &str, _: &EvalRecord) -> Result<(), StoreError> {
            Err(StoreError::BadDate("simulated".to_string()))
        }
    }

    #[tokio::test]
    async fn match_is_advisory_and_the_whole_chain_runs() {
        let rules: Vec<Arc<dyn Rule>> = vec![
            TestRule::new("a", Behavior::Match(false)),
            TestRule::new("b", Behavior::Match(true)),
            TestRule::new("c", Behavior::Match(false)),
        ];
        let store = CapturingStore::default();
        run_chain(
            &store,
            &CancellationToken::new(),
            &logger(),
            "id",
            &message(),
            "g",
            &rules,
        )
        .await
        .unwrap();

        let rec = store.0.lock().unwrap().take().unwrap();
        assert_eq!(rec.rules.len(), 3);
        assert!(!rec.rules[0].matched);
        assert!(rec.rules[1].matched);
        assert!(!rec.rules[2].matched);
        assert!(rec.first_error().is_none());
        assert!(rec.rules.iter().all(|r| r.start <= r.end));
    }

    #[tokio::test]
    async fn chain_stops_at_the_first_error() {
        let third = TestRule::new("c", Behavior::Match(false));
        let rules: Vec<Arc<dyn Rule>> = vec![
            TestRule::new("a", Behavior::Match(false)),
            TestRule::new("b", Behavior::Fail("boom")),
            third.clone(),
        ];
        let store = CapturingStore::default();
        let err = run_chain(
            &store,
            &CancellationToken::new(),
            &logger(),
            "id",
            &message(),
            "g",
            &rules,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RequestError::Rule(_)));
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
        let rec = store.0.lock().unwrap().take().unwrap();
        assert_eq!(rec.rules.len(), 2);
        assert!(rec.rules[1].error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn tag_changes_land_on_the_issuing_rule_record() {
        let rules: Vec<Arc<dyn Rule>> = vec![
            TestRule::new("a", Behavior::Match(false)),
            TestRule::new("b", Behavior::SetTagAndMatch("k", "v")),
        ];
        let store = CapturingStore::default();
        let msg = message();
        run_chain(
            &store,
            &CancellationToken::new(),
            &logger(),
            "id",
            &msg,
            "g",
            &rules,
        )
        .await
        .unwrap();

        let rec = store.0.lock().unwrap().take().unwrap();
        assert!(rec.rules[0].tag_changes.is_empty());
        assert_eq!(rec.rules[1].tag_changes.len(), 1);
        assert_eq!(rec.rules[1].tag_changes[0].value.as_deref(), Some("v"));
        // The live message saw the write too.
        assert_eq!(msg.tags().get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn timeout_stops_the_chain_and_stamps_the_deadline() {
        let rules: Vec<Arc<dyn Rule>> = vec![
            TestRule::new("slow", Behavior::Hang),
            TestRule::new("after", Behavior::Match(false)),
        ];
        let store = CapturingStore::default();
        let timeout = Duration::from_millis(50);
        let err = run_chain_with_timeout(
            &store,
            &CancellationToken::new(),
            &logger(),
            "id",
            &message(),
            "g",
            &rules,
            timeout,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RequestError::RuleTimeout { .. }));
        let rec = store.0.lock().unwrap().take().unwrap();
        assert_eq!(rec.rules.len(), 1);
        let slow = &rec.rules[0];
        assert!(slow.error.as_deref().unwrap().contains("timeout"));
        assert_eq!(slow.end, deadline_of(slow.start, timeout));
    }

    #[tokio::test]
    async fn pending_rule_error_outranks_persistence_error() {
        let rules: Vec<Arc<dyn Rule>> = vec![TestRule::new("a", Behavior::Fail("boom"))];
        let err = run_chain(
            &FailingStore,
            &CancellationToken::new(),
            &logger(),
            "id",
            &message(),
            "g",
            &rules,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RequestError::Rule(_)));
    }

    #[tokio::test]
    async fn persistence_error_surfaces_when_rules_succeeded() {
        let rules: Vec<Arc<dyn Rule>> = vec![TestRule::new("a", Behavior::Match(true))];
        let err = run_chain(
            &FailingStore,
            &CancellationToken::new(),
            &logger(),
            "id",
            &message(),
            "g",
            &rules,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RequestError::Storage(_)));
    }

    #[tokio::test]
    async fn empty_chain_still_records() {
        let store = CapturingStore::default();
        run_chain(
            &store,
            &CancellationToken::new(),
            &logger(),
            "id",
            &message(),
            "g",
            &[],
        )
        .await
        .unwrap();
        let rec = store.0.lock().unwrap().take().unwrap();
        assert!(rec.rules.is_empty());
        assert!(rec.start <= rec.end);
    }

    #[tokio::test]
    async fn null_store_accepts_any_record() {
        let rules: Vec<Arc<dyn Rule>> = vec![TestRule::new("a", Behavior::Match(true))];
        run_chain(
            &NullStore,
            &CancellationToken::new(),
            &logger(),
            "id",
            &message(),
            "g",
            &rules,
        )
        .await
        .unwrap();
    }
}
