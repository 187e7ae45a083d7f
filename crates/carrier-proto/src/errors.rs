//! Protocol error types.

use std::io;

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding, decoding, or moving records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Buffer is shorter than the structure being parsed.
    #[error("truncated frame: need {needed} bytes, got {actual}")]
    Truncated {
        /// Minimum number of bytes required
        needed: usize,
        /// Number of bytes available
        actual: usize,
    },

    /// Record length prefix exceeds the configured maximum.
    #[error("record of {size} bytes exceeds limit of {max} bytes")]
    RecordTooLarge {
        /// Announced record size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Stream ended before a complete record was read.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Sealed record failed AEAD verification.
    #[error("record failed authentication")]
    Authentication,

    /// Underlying stream failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether this error means the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::UnexpectedEof => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Maps a stream read failure, folding short reads into [`ProtocolError::UnexpectedEof`].
pub(crate) fn from_read(err: io::Error) -> ProtocolError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::UnexpectedEof
    } else {
        ProtocolError::Io(err)
    }
}
