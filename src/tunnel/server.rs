//! The responding side of the disguise tunnel.
use core::{
    pin::Pin,
    task::{Context, Poll, Waker},
};
use std::{
    collections::VecDeque,
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf},
    spawn,
};
use tracing::{debug, trace, warn};

use super::{decode, encode};
use crate::{
    codec::{read_command, Reply},
    config::TunnelConfig,
    conn::{display_addr, Addrs, BoxConn, Connection},
    error::{downcast, Error, Tunnel},
    protocol::MAX_CHUNK_LEN,
};

/// Payload uploaded by the initiator, waiting for `poll_read`.
#[derive(Debug, Default)]
struct Inbound {
    buf: VecDeque<u8>,
    /// The initiator finished its upload.
    eof: bool,
    /// The session ended or the stream was dropped.
    closed: bool,
    error: Option<io::Error>,
    reader: Option<Waker>,
}

/// Payload written locally, waiting for a `GET`.
#[derive(Debug, Default)]
struct Outbound {
    queue: VecDeque<Vec<u8>>,
    bytes: usize,
    /// No more writes; `GET` answers nil once the queue drains.
    finished: bool,
    /// The session ended.
    closed: bool,
    writer: Option<Waker>,
}

#[derive(Debug)]
struct Session {
    inbound: Mutex<Inbound>,
    outbound: Mutex<Outbound>,
    max_outbound_bytes: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // The guarded state is consistent after every statement, so a panic
    // elsewhere cannot leave it half-updated.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn wake(waker: &mut Option<Waker>) {
    if let Some(waker) = waker.take() {
        waker.wake();
    }
}

impl Session {
    fn set(&self, value: &[u8]) -> Reply {
        let mut inbound = lock(&self.inbound);
        if inbound.closed {
            return Reply::error("connection closed");
        }
        if inbound.eof {
            return Reply::error("upload already finished");
        }
        if value.is_empty() {
            trace!("upload finished");
            inbound.eof = true;
        } else {
            match decode(value) {
                Ok(data) => {
                    trace!(len = data.len(), "SET");
                    inbound.buf.extend(data);
                }
                Err(e) => {
                    warn!("SET with invalid base64: {}", e);
                    return Reply::error("invalid base64 value");
                }
            }
        }
        wake(&mut inbound.reader);
        Reply::ok()
    }

    fn get(&self) -> Reply {
        let mut outbound = lock(&self.outbound);
        match outbound.queue.pop_front() {
            Some(chunk) => {
                trace!(len = chunk.len(), "GET");
                outbound.bytes -= chunk.len();
                wake(&mut outbound.writer);
                Reply::Bulk(Some(encode(&chunk)))
            }
            None if outbound.finished => Reply::Bulk(None),
            None => Reply::Bulk(Some(Vec::new())),
        }
    }

    /// Returns the reply and whether the session ends after it.
    fn handle(&self, args: &[Vec<u8>]) -> (Reply, bool) {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        let reply = match (name.as_str(), args.len()) {
            ("PING", 1) => Reply::Simple("PONG".to_string()),
            ("PING", 2) => Reply::Bulk(Some(args[1].clone())),
            ("SET", 3) => self.set(&args[2]),
            ("GET", 2) => self.get(),
            ("QUIT", _) => return (Reply::ok(), true),
            ("PING" | "SET" | "GET", _) => {
                warn!(command = %name, "wrong number of arguments");
                Reply::error(format!(
                    "wrong number of arguments for '{}' command",
                    name.to_ascii_lowercase()
                ))
            }
            _ => {
                warn!(command = %name, "unknown command");
                Reply::error(format!("unknown command '{}'", name))
            }
        };
        (reply, false)
    }

    /// Ends the session for both the reader and the writer.
    fn close(&self, error: Option<io::Error>) {
        {
            let mut outbound = lock(&self.outbound);
            outbound.closed = true;
            wake(&mut outbound.writer);
        }
        let mut inbound = lock(&self.inbound);
        inbound.closed = true;
        inbound.error = error;
        wake(&mut inbound.reader);
    }

    /// The local stream is gone; let the initiator drain what was written.
    fn detach(&self) {
        {
            let mut inbound = lock(&self.inbound);
            inbound.closed = true;
            inbound.buf.clear();
        }
        lock(&self.outbound).finished = true;
    }
}

/// Runs the command loop until `QUIT`, disconnect or a fatal error.
async fn serve(session: Arc<Session>, conn: BoxConn, addrs: Addrs) {
    let mut conn = BufReader::new(conn);
    let mut out = Vec::new();
    let result: io::Result<()> = async {
        loop {
            let (reply, quit) = match read_command(&mut conn).await {
                Ok(Some(args)) => session.handle(&args),
                Ok(None) => return Ok(()),
                Err(e) => {
                    // Framing is lost: answer once, then hang up.
                    if let Some(Error::Tunnel(Tunnel::MalformedReply(what))) = downcast(&e) {
                        warn!("malformed command: {}", what);
                        out.clear();
                        Reply::error("Protocol error").encode_into(&mut out);
                        conn.write_all(&out).await?;
                        conn.flush().await?;
                    }
                    return Err(e);
                }
            };
            out.clear();
            reply.encode_into(&mut out);
            conn.write_all(&out).await?;
            conn.flush().await?;
            if quit {
                return Ok(());
            }
        }
    }
    .await;

    match result {
        Ok(()) => {
            debug!(peer = %display_addr(addrs.peer()), "tunnel session ended");
            session.close(None);
        }
        Err(e) => {
            warn!(peer = %display_addr(addrs.peer()), "tunnel session failed: {}", e);
            session.close(Some(e));
        }
    }
    let _ = conn.shutdown().await;
}

/// Server end of the disguise tunnel, returned by
/// [`TunnelTransform::wrap_server`].
///
/// Dropping it lets the initiator drain data already written before the
/// session winds down.
///
/// [`TunnelTransform::wrap_server`]: crate::Transform::wrap_server
#[derive(Debug)]
pub struct TunnelServerStream {
    session: Arc<Session>,
    addrs: Addrs,
}

impl TunnelServerStream {
    /// Starts the command loop on `conn`.
    pub(crate) fn spawn(conn: BoxConn, config: TunnelConfig) -> Self {
        let addrs = Addrs::of(&*conn);
        let session = Arc::new(Session {
            inbound: Mutex::new(Inbound::default()),
            outbound: Mutex::new(Outbound::default()),
            max_outbound_bytes: config.max_outbound_bytes,
        });
        spawn(serve(session.clone(), conn, addrs));
        Self { session, addrs }
    }
}

impl AsyncRead for TunnelServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inbound = lock(&self.session.inbound);
        if !inbound.buf.is_empty() {
            let n = buf.remaining().min(inbound.buf.len());
            let (front, back) = inbound.buf.as_slices();
            let from_front = n.min(front.len());
            buf.put_slice(&front[..from_front]);
            buf.put_slice(&back[..n - from_front]);
            inbound.buf.drain(..n);
            return Poll::Ready(Ok(()));
        }
        if let Some(e) = inbound.error.take() {
            return Poll::Ready(Err(e));
        }
        if inbound.eof || inbound.closed {
            return Poll::Ready(Ok(()));
        }
        inbound.reader = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for TunnelServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut outbound = lock(&self.session.outbound);
        if outbound.closed || outbound.finished {
            return Poll::Ready(Err(ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if outbound.bytes >= self.session.max_outbound_bytes {
            outbound.writer = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = buf.len().min(MAX_CHUNK_LEN);
        outbound.queue.push_back(buf[..n].to_vec());
        outbound.bytes += n;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        lock(&self.session.outbound).finished = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelServerStream {
    fn drop(&mut self) {
        self.session.detach();
    }
}

impl Connection for TunnelServerStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.addrs.local()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.addrs.peer()
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};

    use super::*;
    use crate::test::tcp_pair;

    /// Talks raw protocol to a responder and returns its reply lines.
    async fn exchange(requests: &[u8], replies: usize) -> (Vec<String>, TunnelServerStream) {
        let (client, server) = tcp_pair().await;
        let server = TunnelServerStream::spawn(Box::new(server), TunnelConfig::default());
        let mut client = BufReader::new(client);
        client.write_all(requests).await.unwrap();
        let mut lines = Vec::new();
        for _ in 0..replies {
            let mut line = String::new();
            client.read_line(&mut line).await.unwrap();
            lines.push(line.trim_end().to_string());
        }
        (lines, server)
    }

    #[tokio::test]
    async fn test_malformed_commands_keep_session() {
        let (lines, mut server) = exchange(
            b"SET k\r\nSET k !!!notbase64\r\nFLUSHALL\r\nSET k aGk=\r\nPING\r\n",
            5,
        )
        .await;
        assert_eq!(
            lines,
            [
                "-ERR wrong number of arguments for 'set' command",
                "-ERR invalid base64 value",
                "-ERR unknown command 'FLUSHALL'",
                "+OK",
                "+PONG",
            ]
        );
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_broken_multibulk_framing_ends_session() {
        let (client, server) = tcp_pair().await;
        let mut server = TunnelServerStream::spawn(Box::new(server), TunnelConfig::default());
        let mut client = BufReader::new(client);

        client.write_all(b"*2\r\n$3\r\nGET\r\n$x\r\n").await.unwrap();
        let mut rest = String::new();
        client.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "-ERR Protocol error\r\n");

        let mut buf = [0u8; 1];
        let err = server.read(&mut buf).await.unwrap_err();
        assert!(matches!(
            downcast(&err),
            Some(Error::Tunnel(Tunnel::MalformedReply(_)))
        ));
    }

    #[tokio::test]
    async fn test_long_inline_command_is_answered() {
        let (lines, _server) = exchange(b"SET a b c d e f g h i j k l m n o p q r\r\nPING\r\n", 2).await;
        assert_eq!(
            lines,
            ["-ERR wrong number of arguments for 'set' command", "+PONG"]
        );
    }

    #[tokio::test]
    async fn test_get_reports_empty_data_and_end() {
        let (client, server) = tcp_pair().await;
        let mut server = TunnelServerStream::spawn(Box::new(server), TunnelConfig::default());
        let mut client = BufReader::new(client);

        let mut line = String::new();
        client.write_all(b"GET abcde\r\n").await.unwrap();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "$0\r\n");
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "\r\n");

        server.write_all(b"foo").await.unwrap();
        server.shutdown().await.unwrap();
        let mut reply = vec![0u8; 15];
        client.write_all(b"GET abcde\r\nGET abcde\r\n").await.unwrap();
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b"$4\r\nZm9v\r\n$-1\r\n");
    }

    #[tokio::test]
    async fn test_quit_closes_session() {
        let (lines, mut server) = exchange(b"SET k YWI=\r\nQUIT\r\n", 2).await;
        assert_eq!(lines, ["+OK", "+OK"]);

        let mut data = Vec::new();
        server.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"ab");
        let err = server.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_outbound_cap_holds_writer() {
        let (client, server) = tcp_pair().await;
        let config = TunnelConfig::default().with_max_outbound_bytes(8);
        let mut server = TunnelServerStream::spawn(Box::new(server), config);
        let mut client = BufReader::new(client);

        assert_eq!(server.write(b"0123456789").await.unwrap(), 10);
        let held = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            server.write(b"more"),
        )
        .await;
        assert!(held.is_err());

        let writer = spawn(async move {
            server.write_all(b"more").await.unwrap();
            server
        });
        client.write_all(b"GET k\r\n").await.unwrap();
        let mut reply = vec![0u8; 23];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b"$16\r\nMDEyMzQ1Njc4OQ==\r\n");
        writer.await.unwrap();
    }
}
