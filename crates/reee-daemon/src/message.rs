//! Messages, their parsed envelopes, and per-message metadata.
//!
//! A [`Message`] owns the raw bytes received from the client, an owned
//! [`Envelope`] extracted from them once at parse time, and a
//! [`Metadata`] record behind the message's own read/write lock. It is
//! shared as `Arc<Message>` between the cache and any evaluation in
//! flight; the evaluation's strong handle keeps it alive past cache
//! eviction.

use std::collections::HashMap;
use std::sync::RwLock;

use mailparse::{addrparse, parse_mail, MailAddr, ParsedMail};
use thiserror::Error;

/// Error produced when the submitted bytes are not a MIME message.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ParseError(String);

/// An owned view of a parsed MIME envelope.
///
/// `mailparse` hands back borrowed structures; the envelope copies the
/// headers (in input order) and the decoded text body out so a message
/// can outlive the parser and move between tasks.
#[derive(Debug)]
pub struct Envelope {
    headers: Vec<(String, String)>,
    body_text: String,
}

impl Envelope {
    /// Parse `raw` into an owned envelope.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let mail = parse_mail(raw).map_err(|e| ParseError(e.to_string()))?;
        let headers = mail
            .headers
            .iter()
            .map(|h| (h.get_key(), h.get_value()))
            .collect();
        let body_text = text_body(&mail).unwrap_or_default();
        Ok(Self { headers, body_text })
    }

    /// First value of the named header, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All headers in input order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The decoded text body (first `text/plain` part, or the root body
    /// of a non-multipart message). Empty when no text part exists.
    #[must_use]
    pub fn body_text(&self) -> &str {
        &self.body_text
    }
}

/// Decoded body of the first `text/plain` part, depth-first.
fn text_body(mail: &ParsedMail<'_>) -> Option<String> {
    if mail.subparts.is_empty() {
        if mail.ctype.mimetype.starts_with("text") {
            return mail.get_body().ok();
        }
        return None;
    }
    mail.subparts.iter().find_map(text_body)
}

/// Per-message state mutated by rule evaluation.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    sampled: bool,
    tags: HashMap<String, String>,
}

impl Metadata {
    /// Build metadata from a sampling decision and an existing tag map.
    #[must_use]
    pub fn new(sampled: bool, tags: HashMap<String, String>) -> Self {
        Self { sampled, tags }
    }

    /// Whether the store retains this message's body and headers.
    #[must_use]
    pub const fn sampled(&self) -> bool {
        self.sampled
    }

    /// The live tag map.
    #[must_use]
    pub const fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    pub(crate) fn tags_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.tags
    }
}

/// One submitted email: raw bytes, parsed envelope, and metadata.
#[derive(Debug)]
pub struct Message {
    envelope: Envelope,
    full_text: Vec<u8>,
    metadata: RwLock<Metadata>,
}

impl Message {
    /// Assemble a message from its parts.
    #[must_use]
    pub fn new(envelope: Envelope, full_text: Vec<u8>, metadata: Metadata) -> Self {
        Self {
            envelope,
            full_text,
            metadata: RwLock::new(metadata),
        }
    }

    /// The parsed envelope.
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The full raw bytes as received.
    #[must_use]
    pub fn full_text(&self) -> &[u8] {
        &self.full_text
    }

    /// Whether this message was sampled for full retention.
    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.metadata.read().expect("message lock poisoned").sampled
    }

    /// Snapshot of the current tag map, taken under the read lock.
    #[must_use]
    pub fn tags(&self) -> HashMap<String, String> {
        self.metadata
            .read()
            .expect("message lock poisoned")
            .tags
            .clone()
    }

    pub(crate) const fn metadata(&self) -> &RwLock<Metadata> {
        &self.metadata
    }
}

/// The key a message persists under.
///
/// A parseable `Message-ID` header wins; otherwise the MD5 digest of
/// the full byte buffer stands in.
#[must_use]
pub fn store_id(envelope: &Envelope, md5_hex: &str) -> String {
    if let Some(raw) = envelope.header("Message-ID") {
        if let Ok(addrs) = addrparse(raw) {
            if let [MailAddr::Single(single)] = &addrs[..] {
                return format!("Message-ID:{}", single.addr);
            }
        }
    }
    format!("MD5-Sum:{md5_hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &[u8] = b"Message-ID: <x@y>\r\n\
From: Ada <ada@example.com>\r\n\
Subject: hello\r\n\
\r\n\
body line\r\n";

    #[test]
    fn parses_headers_and_body() {
        let env = Envelope::parse(PLAIN).unwrap();
        assert_eq!(env.header("subject"), Some("hello"));
        assert_eq!(env.header("SUBJECT"), Some("hello"));
        assert_eq!(env.header("missing"), None);
        assert_eq!(env.body_text().trim_end(), "body line");
    }

    #[test]
    fn store_id_prefers_message_id() {
        let env = Envelope::parse(PLAIN).unwrap();
        assert_eq!(store_id(&env, "ffff"), "Message-ID:x@y");
    }

    #[test]
    fn store_id_falls_back_to_digest() {
        let env = Envelope::parse(b"Subject: no id\r\n\r\nhi\r\n").unwrap();
        assert_eq!(store_id(&env, "d41d8cd9"), "MD5-Sum:d41d8cd9");
    }

    #[test]
    fn multipart_picks_first_text_part() {
        let raw = b"Content-Type: multipart/alternative; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: text/plain\r\n\
\r\n\
plain part\r\n\
--b\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>html part</p>\r\n\
--b--\r\n";
        let env = Envelope::parse(raw).unwrap();
        assert!(env.body_text().contains("plain part"));
        assert!(!env.body_text().contains("html"));
    }

    #[test]
    fn tags_snapshot_is_isolated_from_later_writes() {
        let env = Envelope::parse(PLAIN).unwrap();
        let msg = Message::new(env, PLAIN.to_vec(), Metadata::default());
        let before = msg.tags();
        msg.metadata()
            .write()
            .unwrap()
            .tags_mut()
            .insert("k".into(), "v".into());
        assert!(before.is_empty());
        assert_eq!(msg.tags().get("k").map(String::as_str), Some("v"));
    }
}
