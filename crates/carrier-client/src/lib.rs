//! Carrier client shell.
//!
//! A [`Client`] owns at most one connection to a single server address. The
//! connection is dialed on first use and replaced on the next call after it
//! closes, so callers never manage reconnects themselves.
#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;

pub use client::Client;
pub use config::ClientConfig;
pub use error::ClientError;
