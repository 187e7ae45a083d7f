//! Deterministic simulation harness for Carrier.
//!
//! Turmoil-backed [`Listener`](carrier_core::Listener) and
//! [`Dialer`](carrier_core::Dialer) implementations, so real servers and
//! clients run unchanged over a simulated network with controlled latency
//! and virtual time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod hosts;
pub mod sim_net;

pub use hosts::{SERVER_PORT, echo_handler, server_addr, serve_echo};
pub use sim_net::{SimDialer, SimListener};
