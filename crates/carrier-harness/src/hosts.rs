//! Ready-made simulated hosts.

use carrier_core::{Context, Handler, HandlerError, handler_fn};
use carrier_server::{Server, ServerConfig};

use crate::sim_net::SimListener;

/// Port every simulated server listens on.
pub const SERVER_PORT: u16 = 7070;

/// Address a client uses to reach the simulated host `host`.
pub fn server_addr(host: &str) -> String {
    format!("{host}:{SERVER_PORT}")
}

/// Handler replying to each request with its own body.
pub fn echo_handler() -> impl Handler {
    handler_fn(|ctx: &mut Context| -> Result<(), HandlerError> {
        if ctx.is_request() {
            ctx.reply(ctx.body())?;
        }
        Ok(())
    })
}

/// Run an echo server on the current host until the simulation ends.
///
/// Use as the body of a `turmoil` host:
///
/// ```no_run
/// let mut sim = turmoil::Builder::new().build();
/// sim.host("server", || carrier_harness::serve_echo(Default::default()));
/// ```
pub async fn serve_echo(config: ServerConfig) -> turmoil::Result {
    let listener = SimListener::bind(&format!("0.0.0.0:{SERVER_PORT}")).await?;
    Server::new(config).with_handler(echo_handler()).serve(listener).await?;
    Ok(())
}
