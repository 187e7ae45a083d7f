//! Carrier server shell.
//!
//! Accepts raw streams from any [`Listener`](carrier_core::Listener), runs
//! the session handshake, and hands each connection to the Conn engine. At
//! most `max_conns` connections are served at once; when the limit is
//! reached the accept loop waits briefly for a slot and then drops the new
//! stream.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use carrier_core::{Context, handler_fn};
//! use carrier_server::{Server, ServerConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:7070").await?;
//! let server = Arc::new(Server::new(ServerConfig::default()).with_handler(handler_fn(
//!     |ctx: &mut Context| {
//!         ctx.reply(ctx.body())?;
//!         Ok(())
//!     },
//! )));
//!
//! let serving = tokio::spawn({
//!     let server = Arc::clone(&server);
//!     async move { server.serve(listener).await }
//! });
//! // ...
//! server.shutdown().await;
//! serving.await??;
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod server;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::Server;
