//! Connection and handler errors.

use std::{sync::Arc, time::Duration};

use carrier_proto::ProtocolError;
use thiserror::Error;

/// Errors returned by [`Conn`](crate::Conn) operations.
///
/// Cloneable: one failure is fanned out to every caller waiting on the
/// affected writes and requests.
#[derive(Debug, Clone, Error)]
pub enum ConnError {
    /// Connection is closing or closed.
    #[error("connection closed")]
    Closed,

    /// Deadline elapsed before the operation completed.
    ///
    /// The connection itself stays open.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The stream failed while writing.
    #[error("transport error: {0}")]
    Transport(Arc<ProtocolError>),

    /// Configuration rejected at construction.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ConnError {
    /// Whether retrying on a fresh connection may succeed.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Closed | Self::Transport(_))
    }
}

impl From<ProtocolError> for ConnError {
    fn from(err: ProtocolError) -> Self {
        Self::Transport(Arc::new(err))
    }
}

/// Error returned by a [`Handler`](crate::Handler).
///
/// Logged by the connection; never fatal to it.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Replying through the context failed.
    #[error("reply failed: {0}")]
    Reply(#[from] ConnError),

    /// Inbound message was not understood.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Any other application failure.
    #[error("{0}")]
    Other(String),
}
