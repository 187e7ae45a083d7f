//! Accept loop with admission control.
//!
//! ```text
//! accept ──► admission (semaphore, bounded wait) ──► task per connection
//!                                                     │
//!                              handshake (bounded) ◄──┘
//!                              Conn::spawn, ConnEvent::New
//!                              wait: conn closing | server shutdown
//!                              close, wait for tasks, ConnEvent::Closed
//! ```

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use carrier_core::{
    Conn, ConnEvent, ConnStateHandler, Handler, Listener, NoopConnStateHandler, NoopHandler,
    Pools, Role, is_temporary_accept_error,
};
use carrier_crypto::{BoxedRecordReader, BoxedRecordWriter, establish};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{OwnedSemaphorePermit, Semaphore, watch},
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::{config::ServerConfig, error::ServerError};

/// Everything a connection task needs, shared across tasks.
struct ConnShared {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    conn_state: Arc<dyn ConnStateHandler>,
    pools: Arc<Pools>,
    active: AtomicUsize,
}

/// Carrier server.
///
/// Share it behind an `Arc` to call [`shutdown`](Self::shutdown) while
/// [`serve`](Self::serve) runs on another task.
pub struct Server {
    shared: Arc<ConnShared>,
    shutdown: watch::Sender<bool>,
    running: watch::Sender<bool>,
}

impl Server {
    /// Server with no-op handlers and private pools.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(ConnShared {
                config,
                handler: Arc::new(NoopHandler),
                conn_state: Arc::new(NoopConnStateHandler),
                pools: Arc::new(Pools::new()),
                active: AtomicUsize::new(0),
            }),
            shutdown: watch::channel(false).0,
            running: watch::channel(false).0,
        }
    }

    /// Handler for inbound messages on every connection.
    #[must_use]
    pub fn with_handler(self, handler: impl Handler) -> Self {
        self.map_shared(|s| s.handler = Arc::new(handler))
    }

    /// Observer for connection lifecycle events.
    #[must_use]
    pub fn with_conn_state(self, conn_state: impl ConnStateHandler) -> Self {
        self.map_shared(|s| s.conn_state = Arc::new(conn_state))
    }

    /// Pools shared by every connection.
    #[must_use]
    pub fn with_pools(self, pools: Arc<Pools>) -> Self {
        self.map_shared(|s| s.pools = pools)
    }

    fn map_shared(mut self, f: impl FnOnce(&mut ConnShared)) -> Self {
        // Builder methods run before `serve`, so nothing else holds the Arc.
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            f(shared);
        }
        self
    }

    /// Settings in use.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Pools shared by this server's connections.
    pub fn pools(&self) -> &Arc<Pools> {
        &self.shared.pools
    }

    /// Connections currently past the handshake.
    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Whether [`serve`](Self::serve) is running.
    pub fn is_serving(&self) -> bool {
        *self.running.borrow()
    }

    /// Accept and serve connections until [`shutdown`](Self::shutdown) is
    /// called or the listener fails.
    ///
    /// Every connection is closed and its task joined before this returns.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Config`] if the config is invalid or the server is
    ///   already serving
    /// - [`ServerError::Accept`] on a non-transient listener error
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<(), ServerError> {
        self.shared.config.validate()?;
        if self.running.send_replace(true) {
            return Err(ServerError::Config("server is already serving".into()));
        }
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, max_conns = self.shared.config.max_conns, "serving");
        }

        let result = self.accept_loop(&listener).await;
        self.running.send_replace(false);
        result
    }

    async fn accept_loop<L: Listener>(&self, listener: &L) -> Result<(), ServerError> {
        let config = &self.shared.config;
        let admission = Arc::new(Semaphore::new(config.max_conns));
        let mut shutdown = self.shutdown.subscribe();
        let mut tasks = JoinSet::new();

        let result = loop {
            let accepted = tokio::select! {
                biased;
                () = stopped(&mut shutdown) => break Ok(()),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                    continue;
                },
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_temporary_accept_error(&e) => {
                    warn!(error = %e, backoff = ?config.accept_backoff, "accept failed, retrying");
                    tokio::select! {
                        () = stopped(&mut shutdown) => break Ok(()),
                        () = tokio::time::sleep(config.accept_backoff) => continue,
                    }
                },
                Err(e) => break Err(ServerError::Accept(e)),
            };

            let permit = match self.admit(&admission, &mut shutdown, peer).await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(%peer, error = %e, "connection dropped");
                    continue;
                },
            };

            tasks.spawn(serve_conn(
                Arc::clone(&self.shared),
                stream,
                peer,
                permit,
                self.shutdown.subscribe(),
            ));
        };

        self.shutdown.send_replace(true);
        debug!(connections = tasks.len(), "accept loop stopped, draining connections");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "connection task failed");
            }
        }
        info!("server stopped");
        result
    }

    /// Take a connection slot, waiting up to `max_conn_wait` when full.
    async fn admit(
        &self,
        admission: &Arc<Semaphore>,
        shutdown: &mut watch::Receiver<bool>,
        peer: SocketAddr,
    ) -> Result<OwnedSemaphorePermit, ServerError> {
        if let Ok(permit) = Arc::clone(admission).try_acquire_owned() {
            return Ok(permit);
        }

        let config = &self.shared.config;
        let rejected = ServerError::AdmissionRejected { peer, max_conns: config.max_conns };
        debug!(%peer, "connection limit reached, waiting for a slot");

        let mut timer = self.shared.pools.lease_timer(config.max_conn_wait);
        tokio::select! {
            permit = Arc::clone(admission).acquire_owned() => permit.map_err(|_| rejected),
            () = timer.expired() => Err(rejected),
            () = stopped(shutdown) => Err(rejected),
        }
    }

    /// Stop accepting, close every connection, and wait for `serve` to
    /// return.
    ///
    /// Idempotent. Returns immediately if `serve` is not running.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|r| !*r).await;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.shared.config)
            .field("active", &self.active_connections())
            .field("serving", &self.is_serving())
            .finish_non_exhaustive()
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|s| *s).await;
}

async fn handshake<S>(
    shared: &ConnShared,
    stream: S,
    peer: SocketAddr,
) -> Result<(BoxedRecordReader, BoxedRecordWriter), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = &shared.config;
    let mut timer = shared.pools.lease_timer(config.handshake_timeout);
    tokio::select! {
        halves = establish(stream, Role::Acceptor, config.security, &config.conn.record) => {
            halves.map_err(|source| ServerError::Handshake { peer, source })
        },
        () = timer.expired() => {
            Err(ServerError::HandshakeTimeout { peer, timeout: config.handshake_timeout })
        },
    }
}

async fn serve_conn<S>(
    shared: Arc<ConnShared>,
    stream: S,
    peer: SocketAddr,
    _permit: OwnedSemaphorePermit,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = match handshake(&shared, stream, peer).await {
        Ok(halves) => halves,
        Err(e) => {
            warn!(%peer, error = %e, "handshake failed");
            return;
        },
    };

    let conn = match Conn::builder(Role::Acceptor)
        .config(shared.config.conn.clone())
        .handler(Arc::clone(&shared.handler))
        .pools(Arc::clone(&shared.pools))
        .peer_addr(peer)
        .spawn(reader, writer)
    {
        Ok(conn) => conn,
        Err(e) => {
            warn!(%peer, error = %e, "failed to start connection");
            return;
        },
    };

    shared.active.fetch_add(1, Ordering::AcqRel);
    shared.conn_state.handle_conn_state(&conn, ConnEvent::New);

    tokio::select! {
        () = conn.closing() => {},
        () = stopped(&mut shutdown) => {},
    }
    conn.close();
    conn.closed().await;

    shared.active.fetch_sub(1, Ordering::AcqRel);
    shared.conn_state.handle_conn_state(&conn, ConnEvent::Closed);
    debug!(%peer, "connection finished");
}
