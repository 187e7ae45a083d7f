//! Carrier echo server.
//!
//! Replies to every request with its own body and logs uncorrelated
//! messages. Runs until Ctrl-C.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use carrier_core::{ConnEvent, Context, HandlerError, Pools, handler_fn, state_fn};
use carrier_crypto::Security;
use carrier_server::{Server, ServerConfig};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Carrier echo server
#[derive(Parser, Debug)]
#[command(name = "carrier-server", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7070")]
    bind: SocketAddr,

    /// Connections served at once
    #[arg(long, default_value_t = 1024)]
    max_conns: usize,

    /// Skip the session handshake and send records unencrypted
    #[arg(long)]
    plaintext: bool,

    /// Log filter used when `RUST_LOG` is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds between pool counter folds
    #[arg(long, default_value_t = 10)]
    sample_interval: u64,
}

fn echo(ctx: &mut Context) -> Result<(), HandlerError> {
    if ctx.is_request() {
        ctx.reply(ctx.body())?;
    } else {
        debug!(len = ctx.body().len(), "message received");
    }
    Ok(())
}

fn log_conn_state(conn: &carrier_core::Conn, event: ConnEvent) {
    match event {
        ConnEvent::New => info!(peer = ?conn.peer_addr(), "connection opened"),
        ConnEvent::Closed => info!(peer = ?conn.peer_addr(), "connection closed"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig {
        max_conns: args.max_conns,
        security: if args.plaintext { Security::Plaintext } else { Security::Encrypted },
        ..ServerConfig::default()
    };
    config.validate()?;

    let pools = Arc::new(Pools::new());
    let mut sampler = pools.start_sampler(Duration::from_secs(args.sample_interval.max(1)));

    let listener = TcpListener::bind(args.bind).await?;
    let server = Arc::new(
        Server::new(config)
            .with_handler(handler_fn(echo))
            .with_conn_state(state_fn(log_conn_state))
            .with_pools(Arc::clone(&pools)),
    );

    let mut serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve(listener).await }
    });

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupt received, shutting down");
            server.shutdown().await;
            serving.await?
        },
        served = &mut serving => served?,
    };

    sampler.stop().await;
    let stats = pools.stats();
    debug!(
        writes = stats.writes.outstanding(),
        requests = stats.requests.outstanding(),
        contexts = stats.contexts.outstanding(),
        timers = stats.timers.outstanding(),
        "objects still checked out"
    );

    result.map_err(Into::into)
}
