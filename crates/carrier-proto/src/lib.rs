//! Wire format for the Carrier transport.
//!
//! Everything on the wire is a length-prefixed record:
//!
//! ```text
//! ┌──────────────┬──────────────────────┐
//! │ length (u32) │ record bytes         │
//! └──────────────┴──────────────────────┘
//! ```
//!
//! Once any session decryption has been applied, a record carries one
//! application frame:
//!
//! ```text
//! ┌────────────────┬──────────────────────┐
//! │ sequence (u32) │ payload              │
//! └────────────────┴──────────────────────┘
//! ```
//!
//! All integers are big-endian. Sequence `0` marks an uncorrelated message;
//! any other value is a request or the reply matching it.
//!
//! # Components
//!
//! - [`frame`]: append/parse helpers for the `[sequence][payload]` envelope
//! - [`record`]: record I/O over async streams and the [`RecordRead`] /
//!   [`RecordWrite`] seams used by the connection engine
//! - [`role`]: initiator/acceptor distinction
//! - [`errors`]: protocol error type
#![forbid(unsafe_code)]

pub mod errors;
pub mod frame;
pub mod record;
pub mod role;

pub use errors::{ProtocolError, Result};
pub use frame::{FRAME_HEADER_SIZE, UNCORRELATED, append_frame, parse_frame};
pub use record::{
    LENGTH_PREFIX_SIZE, RecordConfig, RecordRead, RecordReader, RecordWrite, RecordWriter,
    read_record, split_plain, write_record,
};
pub use role::Role;
