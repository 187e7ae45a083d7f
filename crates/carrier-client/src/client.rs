//! Lazily dialed, self-healing connection to one server.

use std::sync::Arc;

use carrier_core::{
    Conn, ConnEvent, ConnStateHandler, Dialer, Handler, NoopConnStateHandler, NoopHandler, Pools,
    Role, TcpDialer,
};
use carrier_crypto::establish;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{config::ClientConfig, error::ClientError};

#[derive(Default)]
struct Current {
    conn: Option<Conn>,
    shut_down: bool,
}

/// Carrier client.
///
/// Every operation goes through the current connection, dialing a new one
/// first if there is none or the last one closed. Concurrent callers share
/// one dial.
pub struct Client<D: Dialer = TcpDialer> {
    addr: String,
    config: ClientConfig,
    dialer: D,
    handler: Arc<dyn Handler>,
    conn_state: Arc<dyn ConnStateHandler>,
    pools: Arc<Pools>,
    current: Mutex<Current>,
    dialing: tokio::sync::Mutex<()>,
}

impl Client<TcpDialer> {
    /// Client for `addr` (`host:port`) over TCP.
    pub fn new(addr: impl Into<String>, config: ClientConfig) -> Self {
        Self::with_dialer(addr, config, TcpDialer)
    }
}

impl<D: Dialer> Client<D> {
    /// Client for `addr` using a custom dialer.
    pub fn with_dialer(addr: impl Into<String>, config: ClientConfig, dialer: D) -> Self {
        Self {
            addr: addr.into(),
            config,
            dialer,
            handler: Arc::new(NoopHandler),
            conn_state: Arc::new(NoopConnStateHandler),
            pools: Arc::new(Pools::new()),
            current: Mutex::new(Current::default()),
            dialing: tokio::sync::Mutex::new(()),
        }
    }

    /// Handler for messages the server pushes to us.
    #[must_use]
    pub fn with_handler(mut self, handler: impl Handler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Observer for connection lifecycle events.
    #[must_use]
    pub fn with_conn_state(mut self, conn_state: impl ConnStateHandler) -> Self {
        self.conn_state = Arc::new(conn_state);
        self
    }

    /// Pools shared by every connection this client dials.
    #[must_use]
    pub fn with_pools(mut self, pools: Arc<Pools>) -> Self {
        self.pools = pools;
        self
    }

    /// Server address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Settings in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Pools in use.
    pub fn pools(&self) -> &Arc<Pools> {
        &self.pools
    }

    /// The current connection, if one has been dialed. It may already be
    /// closing.
    pub fn current_conn(&self) -> Option<Conn> {
        self.current.lock().conn.clone()
    }

    /// Send a message and wait until it is flushed.
    ///
    /// # Errors
    ///
    /// Dial and handshake failures, [`ClientError::Shutdown`], or the
    /// connection's [`ConnError`](carrier_core::ConnError).
    pub async fn send(&self, payload: &[u8]) -> Result<(), ClientError> {
        self.connection().await?.send(payload).await.map_err(Into::into)
    }

    /// Queue a message without waiting for the write.
    ///
    /// Only dialing is awaited; the write itself is not.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send), minus write failures.
    pub async fn send_no_wait(&self, payload: &[u8]) -> Result<(), ClientError> {
        self.connection().await?.send_no_wait(payload).map_err(Into::into)
    }

    /// Send a request and copy the reply body into `dst`.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send), plus request timeouts.
    pub async fn request(&self, dst: &mut Vec<u8>, payload: &[u8]) -> Result<(), ClientError> {
        self.connection().await?.request(dst, payload).await.map_err(Into::into)
    }

    /// [`request`](Self::request) with an explicit timeout.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn request_with_timeout(
        &self,
        dst: &mut Vec<u8>,
        payload: &[u8],
        timeout: std::time::Duration,
    ) -> Result<(), ClientError> {
        self.connection()
            .await?
            .request_with_timeout(dst, payload, timeout)
            .await
            .map_err(Into::into)
    }

    /// Close the current connection and refuse further calls.
    ///
    /// Idempotent. Waits for the connection's tasks to stop.
    pub async fn shutdown(&self) {
        let conn = {
            let mut current = self.current.lock();
            current.shut_down = true;
            current.conn.take()
        };
        if let Some(conn) = conn {
            conn.close();
            conn.closed().await;
            info!(addr = %self.addr, "client shut down");
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.current.lock().shut_down
    }

    /// Open connection, dialing one if needed.
    ///
    /// # Errors
    ///
    /// Dial and handshake failures, or [`ClientError::Shutdown`].
    pub async fn connection(&self) -> Result<Conn, ClientError> {
        if let Some(conn) = self.open_conn()? {
            return Ok(conn);
        }

        let _dialing = self.dialing.lock().await;
        // Someone else may have dialed while we waited.
        if let Some(conn) = self.open_conn()? {
            return Ok(conn);
        }

        let conn = self.dial().await?;
        let mut current = self.current.lock();
        if current.shut_down {
            conn.close();
            return Err(ClientError::Shutdown);
        }
        current.conn = Some(conn.clone());
        Ok(conn)
    }

    fn open_conn(&self) -> Result<Option<Conn>, ClientError> {
        let current = self.current.lock();
        if current.shut_down {
            return Err(ClientError::Shutdown);
        }
        Ok(current.conn.as_ref().filter(|c| c.is_open()).cloned())
    }

    async fn dial(&self) -> Result<Conn, ClientError> {
        let config = &self.config;

        let mut timer = self.pools.lease_timer(config.dial_timeout);
        let (stream, peer) = tokio::select! {
            dialed = self.dialer.dial(&self.addr) => dialed.map_err(|source| {
                ClientError::Dial { addr: self.addr.clone(), source }
            })?,
            () = timer.expired() => {
                return Err(ClientError::DialTimeout {
                    addr: self.addr.clone(),
                    timeout: config.dial_timeout,
                });
            },
        };

        timer.arm(tokio::time::Instant::now() + config.handshake_timeout);
        let (reader, writer) = tokio::select! {
            halves = establish(stream, Role::Initiator, config.security, &config.conn.record) => halves?,
            () = timer.expired() => return Err(ClientError::HandshakeTimeout(config.handshake_timeout)),
        };
        drop(timer);

        let conn = Conn::builder(Role::Initiator)
            .config(config.conn.clone())
            .handler(Arc::clone(&self.handler))
            .pools(Arc::clone(&self.pools))
            .peer_addr(peer)
            .spawn(reader, writer)?;

        debug!(%peer, "connection established");
        self.conn_state.handle_conn_state(&conn, ConnEvent::New);

        tokio::spawn({
            let conn = conn.clone();
            let conn_state = Arc::clone(&self.conn_state);
            async move {
                conn.closed().await;
                debug!(peer = ?conn.peer_addr(), "connection closed");
                conn_state.handle_conn_state(&conn, ConnEvent::Closed);
            }
        });

        Ok(conn)
    }
}

impl<D: Dialer> std::fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.current.lock();
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("conn", &current.conn)
            .field("shut_down", &current.shut_down)
            .finish_non_exhaustive()
    }
}
