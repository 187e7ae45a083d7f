//! Connection engine for the Carrier transport.
//!
//! Carrier multiplexes fire-and-forget messages and correlated
//! request/reply pairs over one persistent stream, in both directions at
//! once. This crate holds the runtime pieces shared by the client and
//! server shells:
//!
//! - [`conn`]: the per-connection engine (reader task, writer task, pending
//!   request table)
//! - [`pool`]: object pools keeping the hot path allocation-free
//! - [`handler`]: application hooks for inbound messages and lifecycle
//!   events
//! - [`config`]: connection settings and sequence numbering
//! - [`transport`]: listener/dialer seams over raw byte streams
//!
//! Record encoding and encryption live in `carrier-proto` and
//! `carrier-crypto`; a [`Conn`] only sees whole records through
//! [`RecordRead`](carrier_proto::RecordRead) and
//! [`RecordWrite`](carrier_proto::RecordWrite).
#![forbid(unsafe_code)]

pub mod config;
pub mod conn;
pub mod context;
pub mod error;
pub mod handler;
pub mod pool;
pub mod slot;
pub mod transport;

pub use carrier_proto::Role;
pub use config::{ConnConfig, SequenceConfig};
pub use conn::{Conn, ConnBuilder, ConnState};
pub use context::Context;
pub use error::{ConnError, HandlerError};
pub use handler::{
    ConnEvent, ConnStateHandler, FnHandler, FnStateHandler, Handler, NoopConnStateHandler,
    NoopHandler, handler_fn, state_fn,
};
pub use pool::{
    Lease, Pool, PoolMetrics, PoolStats, Pools, PoolsSnapshot, Recycle, SamplerHandle, Timer,
};
pub use transport::{Dialer, Listener, TcpDialer, is_temporary_accept_error};
