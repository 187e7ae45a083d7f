//! Simulated network seams.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use carrier_core::{Dialer, Listener};
use tracing::trace;

/// Listener on the simulated network.
pub struct SimListener {
    inner: turmoil::net::TcpListener,
}

impl SimListener {
    /// Bind on the current simulated host, e.g. `"0.0.0.0:7070"`.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let inner = turmoil::net::TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }
}

impl std::fmt::Debug for SimListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimListener").field("local_addr", &self.inner.local_addr().ok()).finish()
    }
}

#[async_trait]
impl Listener for SimListener {
    type Stream = turmoil::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        trace!(%peer, "sim accept");
        Ok((stream, peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Dials other simulated hosts by name, e.g. `"server:7070"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimDialer;

#[async_trait]
impl Dialer for SimDialer {
    type Stream = turmoil::net::TcpStream;

    async fn dial(&self, addr: &str) -> io::Result<(Self::Stream, SocketAddr)> {
        let stream = turmoil::net::TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        trace!(%peer, "sim dial");
        Ok((stream, peer))
    }
}
