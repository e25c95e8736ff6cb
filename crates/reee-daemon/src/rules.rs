//! Declarative rule files.
//!
//! The rules directory holds `*.json` files, each declaring groups of
//! rules. A rule names the header and body patterns that must all
//! match, plus the tag effects applied on a match:
//!
//! ```json
//! {
//!     "inbox": [
//!         {
//!             "name": "newsletter",
//!             "desc": "catch mailing list traffic",
//!             "match": {
//!                 "headers": { "From": "@lists\\.", "Subject": ["weekly"] },
//!                 "body": "unsubscribe"
//!             },
//!             "set": { "category": "newsletter" },
//!             "delete": ["inbox-flag"]
//!         }
//!     ]
//! }
//! ```
//!
//! Regexes are compiled at load time; any load error aborts daemon
//! startup. Files are loaded in name order and groups merge across
//! files, preserving per-file rule order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::record::Tagger;
use crate::reqlog::{req_verbose, RequestLogger};
use crate::rule::{Registry, RegistryBuilder, RegistryError, Rule, RuleError};

/// Errors detected while loading rule files.
#[derive(Debug, Error)]
pub enum RuleLoadError {
    /// Reading the directory or a file failed.
    #[error("rules: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file is not valid rule JSON.
    #[error("rules: {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A pattern failed to compile.
    #[error("rules: {path}: rule {rule}: {source}")]
    Regex {
        path: PathBuf,
        rule: String,
        #[source]
        source: regex::Error,
    },

    /// A name violates the registry's constraints.
    #[error("rules: {0}")]
    Registry(#[from] RegistryError),
}

/// One regex, or several that must all match.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Patterns {
    Single(String),
    Multiple(Vec<String>),
}

impl Patterns {
    fn compile(&self) -> Result<Vec<Regex>, regex::Error> {
        match self {
            Self::Single(re) => Ok(vec![Regex::new(re)?]),
            Self::Multiple(res) => res.iter().map(|re| Regex::new(re)).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct MatchSpec {
    headers: BTreeMap<String, Patterns>,
    body: Option<Patterns>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSpec {
    name: String,
    /// Free-form description; not used for anything beyond the file.
    #[serde(default)]
    #[allow(dead_code)]
    desc: Option<String>,
    #[serde(rename = "match", default)]
    matcher: MatchSpec,
    #[serde(default)]
    set: BTreeMap<String, String>,
    #[serde(default)]
    delete: Vec<String>,
}

type FileSpec = BTreeMap<String, Vec<RuleSpec>>;

/// A compiled declarative rule: all patterns must match, then the tag
/// effects apply.
pub struct FilterRule {
    name: String,
    headers: Vec<(String, Vec<Regex>)>,
    body: Vec<Regex>,
    set: Vec<(String, String)>,
    delete: Vec<String>,
}

impl FilterRule {
    fn compile(path: &Path, spec: RuleSpec) -> Result<Self, RuleLoadError> {
        let regex_err = |source| RuleLoadError::Regex {
            path: path.to_path_buf(),
            rule: spec.name.clone(),
            source,
        };
        let mut headers = Vec::with_capacity(spec.matcher.headers.len());
        for (header, patterns) in &spec.matcher.headers {
            headers.push((header.clone(), patterns.compile().map_err(regex_err)?));
        }
        let body = match &spec.matcher.body {
            Some(patterns) => patterns.compile().map_err(regex_err)?,
            None => Vec::new(),
        };
        Ok(Self {
            name: spec.name,
            headers,
            body,
            set: spec.set.into_iter().collect(),
            delete: spec.delete,
        })
    }

    fn matches(&self, msg: &Message) -> bool {
        let envelope = msg.envelope();
        for (header, regexes) in &self.headers {
            let Some(value) = envelope.header(header) else {
                return false;
            };
            if !regexes.iter().all(|re| re.is_match(value)) {
                return false;
            }
        }
        self.body.iter().all(|re| re.is_match(envelope.body_text()))
    }
}

#[async_trait]
impl Rule for FilterRule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn eval(
        &self,
        cancel: &CancellationToken,
        logger: &RequestLogger,
        msg: &Message,
        tagger: &Tagger,
    ) -> Result<bool, RuleError> {
        if cancel.is_cancelled() {
            return Err(RuleError::Cancelled);
        }
        if !self.matches(msg) {
            return Ok(false);
        }
        for (key, value) in &self.set {
            tagger.set(key, value);
        }
        for key in &self.delete {
            tagger.delete(key);
        }
        req_verbose!(
            logger,
            "rule {} matched: {} tags set, {} deleted",
            self.name,
            self.set.len(),
            self.delete.len()
        );
        Ok(true)
    }
}

/// Load every `*.json` file under `dir` into a registry. Files load in
/// name order; a missing directory yields an empty registry.
pub fn load_dir(dir: &Path) -> Result<Registry, RuleLoadError> {
    let mut builder = Registry::builder();
    if !dir.exists() {
        return Ok(builder.build());
    }

    let io_err = |source| RuleLoadError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        load_file(&mut builder, &path)?;
    }
    Ok(builder.build())
}

/// Load one rule file into `builder`.
pub fn load_file(builder: &mut RegistryBuilder, path: &Path) -> Result<(), RuleLoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| RuleLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let spec: FileSpec = serde_json::from_str(&text).map_err(|source| RuleLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    for (group, rules) in spec {
        for rule in rules {
            let compiled = FilterRule::compile(path, rule)?;
            builder.add_rule(&group, Arc::new(compiled))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use reee_core::log::Level;

    use super::*;
    use crate::message::{Envelope, Metadata};
    use crate::reqlog::TracingPrinter;

    fn write_rules(dir: &Path, name: &str, json: &str) {
        std::fs::write(dir.join(name), json).unwrap();
    }

    fn message(raw: &[u8]) -> Arc<Message> {
        Arc::new(Message::new(
            Envelope::parse(raw).unwrap(),
            raw.to_vec(),
            Metadata::default(),
        ))
    }

    fn logger() -> RequestLogger {
        RequestLogger::local_only(
            Level::Taciturn,
            Arc::new(TracingPrinter::new(Level::Taciturn)),
        )
    }

    const NEWSLETTER: &str = r#"{
        "inbox": [
            {
                "name": "newsletter",
                "match": {
                    "headers": { "From": "@lists\\." },
                    "body": "unsubscribe"
                },
                "set": { "category": "newsletter" }
            },
            {
                "name": "cleanup",
                "match": { "headers": { "Subject": "spam" } },
                "delete": ["category"]
            }
        ]
    }"#;

    #[test]
    fn loads_groups_and_preserves_rule_order() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(dir.path(), "mail.json", NEWSLETTER);
        write_rules(
            dir.path(),
            "zz-extra.json",
            r#"{ "inbox": [ { "name": "later" } ], "other": [ { "name": "solo" } ] }"#,
        );

        let registry = load_dir(dir.path()).unwrap();
        let names: Vec<_> = registry
            .group("inbox")
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, ["newsletter", "cleanup", "later"]);
        assert!(registry.group("other").is_some());
    }

    #[test]
    fn missing_directory_yields_an_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = load_dir(&dir.path().join("nope")).unwrap();
        assert_eq!(registry.group_count(), 0);
    }

    #[test]
    fn bad_regex_and_bad_json_abort_loading() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(
            dir.path(),
            "bad-re.json",
            r#"{ "g": [ { "name": "r", "match": { "headers": { "From": "(" } } } ] }"#,
        );
        assert!(matches!(
            load_dir(dir.path()),
            Err(RuleLoadError::Regex { .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        write_rules(dir.path(), "bad.json", "not json");
        assert!(matches!(
            load_dir(dir.path()),
            Err(RuleLoadError::Parse { .. })
        ));
    }

    #[test]
    fn duplicate_rule_names_abort_loading() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(
            dir.path(),
            "dup.json",
            r#"{ "g": [ { "name": "r" }, { "name": "r" } ] }"#,
        );
        assert!(matches!(
            load_dir(dir.path()),
            Err(RuleLoadError::Registry(RegistryError::DuplicateRule { .. }))
        ));
    }

    #[tokio::test]
    async fn matching_rule_applies_tag_effects() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(dir.path(), "mail.json", NEWSLETTER);
        let registry = load_dir(dir.path()).unwrap();
        let rule = &registry.group("inbox").unwrap()[0];

        let msg = message(
            b"From: news@lists.example.com\r\n\
Subject: weekly\r\n\
\r\n\
click to unsubscribe\r\n",
        );
        let tagger = Tagger::new(msg.clone());
        let matched = rule
            .eval(&CancellationToken::new(), &logger(), &msg, &tagger)
            .await
            .unwrap();
        assert!(matched);
        assert_eq!(
            msg.tags().get("category").map(String::as_str),
            Some("newsletter")
        );
        assert_eq!(tagger.take_changes().len(), 1);
    }

    #[tokio::test]
    async fn missing_header_or_body_pattern_means_no_match() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(dir.path(), "mail.json", NEWSLETTER);
        let registry = load_dir(dir.path()).unwrap();
        let rule = &registry.group("inbox").unwrap()[0];

        // Right header, wrong body.
        let msg = message(b"From: news@lists.example.com\r\n\r\nplain body\r\n");
        let tagger = Tagger::new(msg.clone());
        assert!(!rule
            .eval(&CancellationToken::new(), &logger(), &msg, &tagger)
            .await
            .unwrap());

        // No From header at all.
        let msg = message(b"Subject: x\r\n\r\nclick to unsubscribe\r\n");
        let tagger = Tagger::new(msg.clone());
        assert!(!rule
            .eval(&CancellationToken::new(), &logger(), &msg, &tagger)
            .await
            .unwrap());
        assert!(msg.tags().is_empty());
    }

    #[tokio::test]
    async fn cancelled_rule_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(dir.path(), "mail.json", NEWSLETTER);
        let registry = load_dir(dir.path()).unwrap();
        let rule = &registry.group("inbox").unwrap()[0];

        let cancel = CancellationToken::new();
        cancel.cancel();
        let msg = message(b"Subject: x\r\n\r\nbody\r\n");
        let tagger = Tagger::new(msg.clone());
        assert!(matches!(
            rule.eval(&cancel, &logger(), &msg, &tagger).await,
            Err(RuleError::Cancelled)
        ));
    }
}
