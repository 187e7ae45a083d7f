//! Handshake error types.

use carrier_proto::ProtocolError;
use thiserror::Error;

/// Errors from the session key exchange.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Peer sent something other than a 32-byte public key.
    #[error("peer public key is {len} bytes, expected 32")]
    InvalidPeerKey {
        /// Length of the record the peer sent
        len: usize,
    },

    /// Peer key is a low-order point; the shared secret carries no entropy.
    #[error("peer public key yields a degenerate shared secret")]
    WeakSharedSecret,

    /// Derived key was rejected by the cipher.
    #[error("failed to initialise the session cipher")]
    Cipher,

    /// Reading or writing a key exchange record failed.
    #[error("key exchange transport error: {0}")]
    Transport(#[from] ProtocolError),
}
