//! Client error types.

use std::{io, time::Duration};

use carrier_core::ConnError;
use carrier_crypto::HandshakeError;
use thiserror::Error;

/// Errors from [`Client`](crate::Client) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not open a stream to the server.
    #[error("failed to dial {addr}: {source}")]
    Dial {
        /// Server address
        addr: String,
        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// Dial did not finish in time.
    #[error("dialing {addr} timed out after {timeout:?}")]
    DialTimeout {
        /// Server address
        addr: String,
        /// Configured limit
        timeout: Duration,
    },

    /// Session handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Server did not complete the handshake in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The operation failed on an established connection.
    #[error(transparent)]
    Conn(#[from] ConnError),

    /// [`Client::shutdown`](crate::Client::shutdown) was called.
    #[error("client is shut down")]
    Shutdown,
}
