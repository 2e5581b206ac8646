//! zlib compression as a chain transform.
//!
//! Every write is compressed and sync-flushed before it returns, so the peer
//! can decode it without waiting for more input. Shutting down finishes the
//! zlib stream, which the peer reads as end-of-stream.
use core::{
    pin::Pin,
    task::{ready, Context, Poll},
};
use std::{io, net::SocketAddr};

use async_compression::tokio::{bufread::ZlibDecoder, write::ZlibEncoder};
use pin_project_lite::pin_project;
use tokio::io::{split, AsyncRead, AsyncWrite, BufReader, ReadBuf, ReadHalf, WriteHalf};

use crate::{
    chain::{Transform, WrapFuture},
    conn::{Addrs, BoxConn, Connection},
};

/// The compression transform. Both roles wrap the same way.
#[derive(Copy, Clone, Debug, Default)]
pub struct CompressTransform;

impl Transform for CompressTransform {
    fn name(&self) -> &'static str {
        "compress"
    }

    fn wrap_client(&self, conn: BoxConn) -> WrapFuture<'_> {
        Box::pin(async move { Ok(Box::new(CompressStream::new(conn)) as BoxConn) })
    }

    fn wrap_server(&self, conn: BoxConn) -> WrapFuture<'_> {
        self.wrap_client(conn)
    }
}

pin_project! {
    /// A connection whose both directions are zlib streams.
    pub struct CompressStream {
        #[pin]
        reader: ZlibDecoder<BufReader<ReadHalf<BoxConn>>>,
        #[pin]
        writer: ZlibEncoder<WriteHalf<BoxConn>>,
        write_state: WriteState,
        addrs: Addrs,
    }
}

/// State Transition Diagram
/// ```text
///
///    |
///    V
///  WaitData <---+
///    |          |
///    V          |
///   Flush ------+
/// ```
#[derive(Copy, Clone, Debug)]
enum WriteState {
    WaitData,
    Flush { written: usize },
}

impl core::fmt::Debug for CompressStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompressStream")
            .field("write_state", &self.write_state)
            .field("addrs", &self.addrs)
            .finish_non_exhaustive()
    }
}

impl CompressStream {
    /// Wraps `conn`.
    pub fn new(conn: BoxConn) -> Self {
        let addrs = Addrs::of(&*conn);
        let (read_half, write_half) = split(conn);
        Self {
            reader: ZlibDecoder::new(BufReader::new(read_half)),
            writer: ZlibEncoder::new(write_half),
            write_state: WriteState::WaitData,
            addrs,
        }
    }
}

impl AsyncRead for CompressStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().reader.poll_read(cx, buf)
    }
}

impl AsyncWrite for CompressStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut me = self.project();
        loop {
            match *me.write_state {
                WriteState::WaitData => {
                    let n = ready!(me.writer.as_mut().poll_write(cx, buf))?;
                    if n == 0 {
                        return Poll::Ready(Ok(0));
                    }
                    *me.write_state = WriteState::Flush { written: n };
                }
                WriteState::Flush { written } => {
                    let result = ready!(me.writer.as_mut().poll_flush(cx));
                    *me.write_state = WriteState::WaitData;
                    return Poll::Ready(result.map(|()| written));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.project();
        let result = ready!(me.writer.poll_flush(cx));
        *me.write_state = WriteState::WaitData;
        Poll::Ready(result)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().writer.poll_shutdown(cx)
    }
}

impl Connection for CompressStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.addrs.local()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.addrs.peer()
    }
}
