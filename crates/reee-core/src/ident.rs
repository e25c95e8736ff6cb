//! Identifier grammar shared by command IDs, group names, and rule
//! names: `[A-Za-z0-9_\-]+`.
//!
//! The grammar is validated on both sides of the socket so a malformed
//! name is rejected before it reaches the wire or the registry.

/// Returns `true` when `s` is a non-empty string of ASCII letters,
/// digits, underscores, and hyphens.
#[must_use]
pub fn is_valid(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::is_valid;

    #[test]
    fn accepts_the_documented_alphabet() {
        assert!(is_valid("inbox"));
        assert!(is_valid("mark-read_2"));
        assert!(is_valid("A-Z_0-9"));
    }

    #[test]
    fn rejects_empty_and_non_ascii() {
        assert!(!is_valid(""));
        assert!(!is_valid("with space"));
        assert!(!is_valid("dot.ted"));
        assert!(!is_valid("émail"));
        assert!(!is_valid("new\nline"));
    }
}
