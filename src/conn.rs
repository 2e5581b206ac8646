//! The connection abstraction every transform consumes and produces.
//!
//! A [`Connection`] is a bidirectional byte stream that knows its addresses.
//! Half-close is the [`AsyncWrite::poll_shutdown`] of the stream: it closes
//! the write direction only, and the peer observes end-of-stream while its own
//! write direction stays usable. Closing the read direction is implicit in
//! dropping the reader.
use std::{io, net::SocketAddr};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

/// A byte stream with addressing, wrapped and re-wrapped by transforms.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Returns the local address of the underlying socket.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Returns the remote address of the underlying socket.
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// A type-erased [`Connection`], the currency of a [`Chain`].
///
/// [`Chain`]: crate::Chain
pub type BoxConn = Box<dyn Connection>;

impl Connection for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        (**self).peer_addr()
    }
}

/// Addresses captured when a transform takes the raw socket away from the
/// stream it hands back.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Addrs {
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

impl Addrs {
    pub(crate) fn of(conn: &dyn Connection) -> Self {
        Self {
            local: conn.local_addr().ok(),
            peer: conn.peer_addr().ok(),
        }
    }

    pub(crate) fn local(&self) -> io::Result<SocketAddr> {
        self.local.ok_or_else(|| io::ErrorKind::NotConnected.into())
    }

    pub(crate) fn peer(&self) -> io::Result<SocketAddr> {
        self.peer.ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

/// Formats an optional address for log lines.
pub(crate) fn display_addr(addr: io::Result<SocketAddr>) -> String {
    match addr {
        Ok(addr) => addr.to_string(),
        Err(_) => "?".to_string(),
    }
}
