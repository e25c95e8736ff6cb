//! The rule callable and the immutable group registry.
//!
//! A rule is opaque to the engine: a name plus an async callable that
//! reads the message, reads and writes tags through the
//! [`Tagger`](crate::record::Tagger), and reports an advisory match
//! flag or an error. Groups and rules are constructed at daemon start
//! and never change afterwards; child records store names rather than
//! back-pointers and resolve against the registry on lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::record::Tagger;
use crate::reqlog::RequestLogger;

/// Error returned by a rule evaluation.
#[derive(Debug, Error)]
pub enum RuleError {
    /// The rule itself failed.
    #[error("rule {rule}: {message}")]
    Failed {
        /// Name of the failing rule.
        rule: String,
        /// The rule's own error text.
        message: String,
    },

    /// The rule observed shutdown cancellation and returned early.
    #[error("rule cancelled by shutdown")]
    Cancelled,
}

/// A single evaluatable rule.
#[async_trait]
pub trait Rule: Send + Sync {
    /// The rule's name, unique within its group.
    fn name(&self) -> &str;

    /// Evaluate the rule against `msg`.
    ///
    /// `cancel` is the request's cancellation scope; a rule that can
    /// block should return [`RuleError::Cancelled`] promptly once it
    /// fires. The returned bool is the advisory match flag; it does not
    /// stop the chain.
    async fn eval(
        &self,
        cancel: &CancellationToken,
        logger: &RequestLogger,
        msg: &Message,
        tagger: &Tagger,
    ) -> Result<bool, RuleError>;
}

/// Errors detected while assembling a registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A group name violates the identifier grammar.
    #[error("invalid group name {0:?}")]
    InvalidGroupName(String),

    /// A rule name violates the identifier grammar.
    #[error("invalid rule name {rule:?} in group {group}")]
    InvalidRuleName { group: String, rule: String },

    /// Two rules in one group share a name.
    #[error("duplicate rule name {rule} in group {group}")]
    DuplicateRule { group: String, rule: String },
}

/// Read-only map from group name to its ordered rule chain.
#[derive(Default)]
pub struct Registry {
    groups: BTreeMap<String, Vec<Arc<dyn Rule>>>,
}

impl Registry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// An empty registry; `list` returns nothing and every `eval`
    /// reports *group not found*.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The ordered rules of `name`, if the group exists.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&[Arc<dyn Rule>]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    /// All groups with their ordered rules. Iteration order is
    /// deterministic but not part of the protocol contract.
    pub fn groups(&self) -> impl Iterator<Item = (&str, &[Arc<dyn Rule>])> {
        self.groups.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of rules across all groups.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

/// Accumulates rules before the registry is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    groups: BTreeMap<String, Vec<Arc<dyn Rule>>>,
}

impl RegistryBuilder {
    /// Append `rule` to `group`, preserving insertion order.
    pub fn add_rule(&mut self, group: &str, rule: Arc<dyn Rule>) -> Result<(), RegistryError> {
        if !reee_core::ident::is_valid(group) {
            return Err(RegistryError::InvalidGroupName(group.to_string()));
        }
        if !reee_core::ident::is_valid(rule.name()) {
            return Err(RegistryError::InvalidRuleName {
                group: group.to_string(),
                rule: rule.name().to_string(),
            });
        }
        let rules = self.groups.entry(group.to_string()).or_default();
        if rules.iter().any(|r| r.name() == rule.name()) {
            return Err(RegistryError::DuplicateRule {
                group: group.to_string(),
                rule: rule.name().to_string(),
            });
        }
        rules.push(rule);
        Ok(())
    }

    /// Freeze the accumulated groups.
    #[must_use]
    pub fn build(self) -> Registry {
        Registry {
            groups: self.groups,
        }
    }
}
