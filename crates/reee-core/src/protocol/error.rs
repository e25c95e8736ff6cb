use std::io;

use thiserror::Error;

/// Upper bound on a single protocol line, enforced before buffering
/// grows past it.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Errors produced by the wire codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame parsed but violates the protocol grammar.
    #[error("protocol: malformed frame: {0}")]
    Malformed(String),

    /// The stream ended before a frame (or its payload) was complete.
    #[error("protocol: short read: stream ended mid-frame")]
    ShortRead,

    /// A line exceeded [`MAX_LINE_LEN`].
    #[error("protocol: line exceeds {MAX_LINE_LEN} bytes")]
    LineTooLong,

    /// Transport-level failure.
    #[error("protocol: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::Malformed(detail.into())
    }
}
