//! Application hooks.
//!
//! [`Handler`] services inbound messages; [`ConnStateHandler`] observes
//! connections coming and going. Both have no-op defaults and closure
//! adapters for the common case.

use async_trait::async_trait;

use crate::{conn::Conn, context::Context, error::HandlerError};

/// Services inbound messages.
///
/// Called on the connection's reader task, one message at a time. A slow
/// handler stalls further reads on that connection, so long work should be
/// moved to a spawned task.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one message. Errors are logged and the connection carries on.
    async fn handle_message(&self, ctx: &mut Context) -> Result<(), HandlerError>;
}

/// Handler that ignores every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl Handler for NoopHandler {
    async fn handle_message(&self, _ctx: &mut Context) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Handler backed by a synchronous closure. See [`handler_fn`].
#[derive(Debug, Clone, Copy)]
pub struct FnHandler<F>(F);

/// Wrap a closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Context) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Context) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    async fn handle_message(&self, ctx: &mut Context) -> Result<(), HandlerError> {
        (self.0)(ctx)
    }
}

/// Connection lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnEvent {
    /// Handshake done, conn is ready for traffic.
    New,
    /// Conn has shut down.
    Closed,
}

/// Observes connections coming and going.
pub trait ConnStateHandler: Send + Sync + 'static {
    /// Called once with [`ConnEvent::New`] and once with
    /// [`ConnEvent::Closed`] per connection.
    fn handle_conn_state(&self, conn: &Conn, event: ConnEvent);
}

/// State handler that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConnStateHandler;

impl ConnStateHandler for NoopConnStateHandler {
    fn handle_conn_state(&self, _conn: &Conn, _event: ConnEvent) {}
}

/// State handler backed by a closure. See [`state_fn`].
#[derive(Debug, Clone, Copy)]
pub struct FnStateHandler<F>(F);

/// Wrap a closure as a [`ConnStateHandler`].
pub fn state_fn<F>(f: F) -> FnStateHandler<F>
where
    F: Fn(&Conn, ConnEvent) + Send + Sync + 'static,
{
    FnStateHandler(f)
}

impl<F> ConnStateHandler for FnStateHandler<F>
where
    F: Fn(&Conn, ConnEvent) + Send + Sync + 'static,
{
    fn handle_conn_state(&self, conn: &Conn, event: ConnEvent) {
        (self.0)(conn, event)
    }
}
