//! Tunnelmw is a set of composable connection middlewares for a
//! traffic-obfuscating TCP tunnel.
//!
//! Each middleware, a [`Transform`], takes a connection and returns a new one
//! that wraps it, adding or removing one protocol layer. A [`Chain`] applies
//! several transforms in a fixed order. Both tunnel endpoints must build the
//! same chain in the same order: transform `i` on one endpoint only ever
//! exchanges bytes with transform `i` on the other.
//!
//! ## Transforms
//!
//! * [`TunnelTransform`]
//!
//!   Carries the byte stream inside a key-value request/response protocol, so
//!   that the wire looks like a client talking to a cache server. Uploads are
//!   `SET` commands, downloads are answers to `GET` polls.
//!
//! * [`XorTransform`]
//!
//!   A repeating-XOR keystream. The initiator generates a random password and
//!   sends it in the clear, so it hides byte statistics from casual
//!   inspection and nothing more.
//!
//! * `TlsTransform` (feature `tls`)
//!
//!   Mutual TLS against a private CA, built on `tokio-rustls`.
//!
//! * `CompressTransform` (feature `compression`)
//!
//!   zlib compression with a flush after every write.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tokio::{io::AsyncWriteExt, net::TcpStream};
//! use tunnelmw::{Chain, TunnelTransform, XorTransform};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let chain = Chain::builder()
//!     .with(TunnelTransform::default())
//!     .with(XorTransform)
//!     .build();
//!
//! let stream = TcpStream::connect("127.0.0.1:6379").await?;
//! let mut conn = chain.wrap_client(Box::new(stream)).await?;
//! conn.write_all(b"hello").await?;
//! # Ok(())
//! # }
//! ```
//!
//! On the server side, [`WrappedListener`] accepts connections without
//! waiting for their chain and hands out [`LazyConn`]s, whose first I/O waits
//! for the chain for at most [`SETUP_TIMEOUT`]. [`relay_bidirectional`]
//! copies between two connections and propagates half-close.
//!
//! ## Half-close
//!
//! [`AsyncWrite::poll_shutdown`] on any wrapped connection closes only its
//! write direction. The peer reads end-of-stream while its own writes keep
//! flowing. Every transform passes this through its layer.
//!
//! [`AsyncWrite::poll_shutdown`]: tokio::io::AsyncWrite::poll_shutdown
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;

mod chain;
mod cipher;
mod codec;
mod conn;
mod lazy;
mod pool;
mod protocol;
mod relay;
mod tunnel;

#[cfg(feature = "compression")]
#[cfg_attr(docsrs, doc(cfg(feature = "compression")))]
mod compress;

#[cfg(feature = "tls")]
#[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
pub mod tls;

pub use chain::{Chain, ChainBuilder, Transform, WrapFuture};
pub use cipher::{Password, XorStream, XorTransform};
pub use config::{TransformKind, TunnelConfig};
pub use conn::{BoxConn, Connection};
pub use error::Error;
pub use lazy::{LazyConn, WrappedListener, SETUP_TIMEOUT};
pub use relay::{relay_bidirectional, RelayStats};
pub use tunnel::{TunnelClientStream, TunnelServerStream, TunnelTransform};

#[cfg(feature = "compression")]
pub use compress::{CompressStream, CompressTransform};
#[cfg(feature = "tls")]
pub use tls::TlsTransform;

use std::sync::LazyLock;

use pool::{BufferPool, BUFFER_LEN};

/// Copy buffers shared by every relay in the process.
///
/// Buffers go back to the pool when a relay ends. Up to 64 idle buffers are
/// kept.
static BUFFER_POOL: LazyLock<BufferPool> = LazyLock::new(|| BufferPool::new(BUFFER_LEN, 64));

#[cfg(test)]
mod test {
    use tokio::net::{TcpListener, TcpStream};

    /// A connected loopback pair: `(client, server)`.
    pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }
}
