//! Server error types.

use std::{io, net::SocketAddr, time::Duration};

use carrier_crypto::HandshakeError;
use thiserror::Error;

/// Errors from running a [`Server`](crate::Server).
///
/// Only [`Accept`](Self::Accept) and [`Config`](Self::Config) end
/// [`Server::serve`](crate::Server::serve); the others concern a single
/// inbound connection and are logged.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener failed with a non-transient error.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Configuration rejected before serving.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Session handshake with a peer failed.
    #[error("handshake with {peer} failed: {source}")]
    Handshake {
        /// Remote address
        peer: SocketAddr,
        /// Underlying failure
        #[source]
        source: HandshakeError,
    },

    /// Peer did not complete the handshake in time.
    #[error("handshake with {peer} timed out after {timeout:?}")]
    HandshakeTimeout {
        /// Remote address
        peer: SocketAddr,
        /// Configured limit
        timeout: Duration,
    },

    /// Connection limit stayed full for the whole admission wait.
    #[error("rejected {peer}: {max_conns} connections already open")]
    AdmissionRejected {
        /// Remote address
        peer: SocketAddr,
        /// Configured limit
        max_conns: usize,
    },
}
