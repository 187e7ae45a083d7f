//! Stream transport seams.
//!
//! Servers accept raw byte streams from a [`Listener`]; clients open them
//! with a [`Dialer`]. Production uses Tokio TCP, tests plug in a simulated
//! network, and nothing above this module can tell the difference.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};
use tracing::debug;

/// Source of inbound streams.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Stream type handed out per connection.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next inbound connection.
    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Address this listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Opens outbound streams.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Stream type produced by a successful dial.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connect to `addr` (`host:port`).
    async fn dial(&self, addr: &str) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        set_nodelay(&stream, peer);
        Ok((stream, peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Dials plain TCP with `TCP_NODELAY` set.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, addr: &str) -> io::Result<(TcpStream, SocketAddr)> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        set_nodelay(&stream, peer);
        Ok((stream, peer))
    }
}

/// Failures are logged; the stream reports a dead peer on first use.
fn set_nodelay(stream: &TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
    }
}

/// Whether an accept error is transient and the loop should back off and
/// retry rather than stop.
pub fn is_temporary_accept_error(err: &io::Error) -> bool {
    use io::ErrorKind::{
        ConnectionAborted, ConnectionRefused, ConnectionReset, Interrupted, TimedOut, WouldBlock,
    };

    // EMFILE / ENFILE: out of file descriptors, may clear as conns close.
    const EMFILE: i32 = 24;
    const ENFILE: i32 = 23;

    matches!(
        err.kind(),
        ConnectionAborted | ConnectionRefused | ConnectionReset | Interrupted | TimedOut | WouldBlock
    ) || matches!(err.raw_os_error(), Some(EMFILE | ENFILE))
}
