//! Encrypted sessions for Carrier connections.
//!
//! Turns a raw byte stream into an authenticated, encrypted record stream.
//!
//! # Handshake
//!
//! Exactly two messages, no negotiation. Each side generates an ephemeral
//! Ed25519 key, converts it to its X25519 form, and sends the 32-byte public
//! key as one record. The initiator writes first and then reads; the
//! acceptor reads first and then writes. Both sides hash the X25519 shared
//! secret with SHA-256 and key AES-256-GCM with the result.
//!
//! # Records
//!
//! Every record is sealed with a nonce built from a per-direction counter
//! (big-endian `u64` in the first eight nonce bytes, the rest zero). The
//! counters start at zero and advance by one per record. The scheme relies
//! on the stream delivering records exactly once and in order; it adds no
//! replay or reordering protection of its own.
#![forbid(unsafe_code)]

pub mod error;
pub mod establish;
pub mod session;
pub mod stream;

pub use error::HandshakeError;
pub use establish::{BoxedRecordReader, BoxedRecordWriter, Security, establish};
pub use session::{PUBLIC_KEY_SIZE, Session, SessionKeys};
pub use stream::{NONCE_SIZE, SessionReader, SessionWriter, TAG_SIZE};
