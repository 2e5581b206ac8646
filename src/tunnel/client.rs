//! The initiating side of the disguise tunnel.
//!
//! A single driver task owns the connection and issues one command at a time,
//! so replies always match the request they answer. The stream talks to the
//! driver through channels: writes go out as requests carrying an
//! acknowledgement, a waiting read asks for data, and the answer to that ask
//! (a chunk, end-of-stream or an error) comes back on a channel with room for
//! one item. The driver only polls with `GET` while a read is waiting, and
//! every ask starts with a fresh retry budget.
use core::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};
use std::io::{self, ErrorKind};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf},
    select, spawn,
    sync::{mpsc, oneshot},
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, trace, warn};

use super::{decode, encode, random_key};
use crate::{
    codec::{encode_inline, read_reply, Reply},
    config::TunnelConfig,
    conn::{display_addr, Addrs, BoxConn, Connection},
    error::{downcast, Error, Handshake, Tunnel},
    protocol::MAX_CHUNK_LEN,
};

const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

type Ack = oneshot::Sender<io::Result<()>>;
type Chunk = io::Result<Vec<u8>>;

enum Request {
    Set { payload: Vec<u8>, ack: Ack },
    Finish { ack: Ack },
}

/// Client end of the disguise tunnel, returned by
/// [`TunnelTransform::wrap_client`].
///
/// [`TunnelTransform::wrap_client`]: crate::Transform::wrap_client
#[derive(Debug)]
pub struct TunnelClientStream {
    requests: mpsc::UnboundedSender<Request>,
    wants: mpsc::UnboundedSender<()>,
    chunks: mpsc::Receiver<Chunk>,
    pending: Vec<u8>,
    pos: usize,
    want_sent: bool,
    read_state: ReadState,
    write_state: WriteState,
    addrs: Addrs,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ReadState {
    Open,
    /// The peer finished writing.
    Eof,
    /// The session failed; the error was returned once already.
    Failed,
}

/// State Transition Diagram
/// ```text
///
///    |
///    V
///   Idle <-------> Awaiting
///    |
///    V
///  Finishing ---> Done
/// ```
#[derive(Debug)]
enum WriteState {
    Idle,
    Awaiting {
        ack: oneshot::Receiver<io::Result<()>>,
        written: usize,
    },
    Finishing {
        ack: oneshot::Receiver<io::Result<()>>,
    },
    Done,
}

impl TunnelClientStream {
    /// Performs the `PING`/`PONG` exchange and starts the driver task.
    pub(crate) async fn connect(conn: BoxConn, config: TunnelConfig) -> io::Result<Self> {
        let addrs = Addrs::of(&*conn);
        let mut driver = Driver {
            conn: BufReader::new(conn),
            out: Vec::new(),
        };
        match driver.command(&[b"PING"]).await? {
            Reply::Simple(s) if s.eq_ignore_ascii_case("PONG") => {}
            other => {
                return Err(Handshake::UnexpectedReply {
                    expected: "PONG",
                    received: other.describe(),
                }
                .into())
            }
        }
        debug!(peer = %display_addr(addrs.peer()), "tunnel established");

        let (requests, request_rx) = mpsc::unbounded_channel();
        let (wants, want_rx) = mpsc::unbounded_channel();
        let (chunk_tx, chunks) = mpsc::channel(1);
        spawn(driver.run(request_rx, want_rx, chunk_tx, config));
        Ok(Self {
            requests,
            wants,
            chunks,
            pending: Vec::new(),
            pos: 0,
            want_sent: false,
            read_state: ReadState::Open,
            write_state: WriteState::Idle,
            addrs,
        })
    }

    fn send(&self, request: Request) -> io::Result<()> {
        self.requests
            .send(request)
            .map_err(|_| io::Error::from(ErrorKind::BrokenPipe))
    }
}

fn poll_ack(
    ack: &mut oneshot::Receiver<io::Result<()>>,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    match ready!(Pin::new(ack).poll(cx)) {
        Ok(result) => Poll::Ready(result),
        // the driver is gone
        Err(_) => Poll::Ready(Err(ErrorKind::BrokenPipe.into())),
    }
}

impl AsyncRead for TunnelClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if me.pos < me.pending.len() {
                let n = buf.remaining().min(me.pending.len() - me.pos);
                buf.put_slice(&me.pending[me.pos..me.pos + n]);
                me.pos += n;
                return Poll::Ready(Ok(()));
            }
            match me.read_state {
                ReadState::Open => {}
                ReadState::Eof => return Poll::Ready(Ok(())),
                ReadState::Failed => return Poll::Ready(Err(ErrorKind::BrokenPipe.into())),
            }
            if !me.want_sent {
                // A gone driver has already queued its last word in `chunks`.
                let _ = me.wants.send(());
                me.want_sent = true;
            }
            let chunk = ready!(me.chunks.poll_recv(cx));
            me.want_sent = false;
            match chunk {
                Some(Ok(chunk)) => {
                    me.pending = chunk;
                    me.pos = 0;
                }
                Some(Err(e)) => {
                    if !matches!(
                        downcast(&e),
                        Some(Error::Tunnel(Tunnel::NoDataAvailable { .. }))
                    ) {
                        me.read_state = ReadState::Failed;
                    }
                    return Poll::Ready(Err(e));
                }
                None => me.read_state = ReadState::Eof,
            }
        }
    }
}

impl AsyncWrite for TunnelClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;
        loop {
            match &mut me.write_state {
                WriteState::Idle => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let written = buf.len().min(MAX_CHUNK_LEN);
                    let (tx, ack) = oneshot::channel();
                    me.send(Request::Set {
                        payload: buf[..written].to_vec(),
                        ack: tx,
                    })?;
                    me.write_state = WriteState::Awaiting { ack, written };
                }
                WriteState::Awaiting { ack, written } => {
                    let written = *written;
                    let result = ready!(poll_ack(ack, cx));
                    me.write_state = WriteState::Idle;
                    return Poll::Ready(result.map(|()| written));
                }
                WriteState::Finishing { .. } | WriteState::Done => {
                    return Poll::Ready(Err(ErrorKind::BrokenPipe.into()))
                }
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Every write is acknowledged before it returns, so flushing only
        // settles a write the caller stopped polling.
        let me = &mut *self;
        if let WriteState::Awaiting { ack, .. } = &mut me.write_state {
            let result = ready!(poll_ack(ack, cx));
            me.write_state = WriteState::Idle;
            return Poll::Ready(result);
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = &mut *self;
        loop {
            match &mut me.write_state {
                WriteState::Idle => {
                    let (tx, ack) = oneshot::channel();
                    me.send(Request::Finish { ack: tx })?;
                    me.write_state = WriteState::Finishing { ack };
                }
                WriteState::Awaiting { ack, .. } => {
                    let result = ready!(poll_ack(ack, cx));
                    me.write_state = WriteState::Idle;
                    result?;
                }
                WriteState::Finishing { ack } => {
                    let result = ready!(poll_ack(ack, cx));
                    me.write_state = WriteState::Done;
                    return Poll::Ready(result);
                }
                WriteState::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl Connection for TunnelClientStream {
    fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.addrs.local()
    }

    fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.addrs.peer()
    }
}

/// Owns the connection; one command in flight at a time.
struct Driver {
    conn: BufReader<BoxConn>,
    out: Vec<u8>,
}

/// Progress of the download direction.
struct Download {
    /// `None` once the peer finished writing or the stream is gone.
    chunks: Option<mpsc::Sender<Chunk>>,
    /// A read is waiting for the answer to its ask.
    waiting: bool,
    delay: Duration,
    empty_polls: u32,
    next_poll: Instant,
}

/// A copy of `err` for a second recipient.
fn duplicate(err: &io::Error) -> io::Error {
    io::Error::new(err.kind(), err.to_string())
}

impl Driver {
    async fn command(&mut self, args: &[&[u8]]) -> io::Result<Reply> {
        self.out.clear();
        encode_inline(args, &mut self.out);
        self.conn.write_all(&self.out).await?;
        self.conn.flush().await?;
        read_reply(&mut self.conn).await
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut wants: mpsc::UnboundedReceiver<()>,
        chunks: mpsc::Sender<Chunk>,
        config: TunnelConfig,
    ) {
        let mut download = Download {
            chunks: Some(chunks),
            waiting: false,
            delay: config.poll_delay_min,
            empty_polls: 0,
            next_poll: Instant::now(),
        };
        let mut upload_open = true;

        let result = loop {
            if !upload_open && download.chunks.is_none() {
                break Ok(());
            }
            if download.chunks.as_ref().is_some_and(|tx| tx.is_closed()) {
                trace!("tunnel stream dropped");
                download.chunks = None;
                continue;
            }
            let asking = download.chunks.is_some() && !download.waiting;
            let polling = download.chunks.is_some() && download.waiting;
            let next_poll = download.next_poll;
            select! {
                biased;
                request = requests.recv(), if upload_open => match request {
                    Some(request) => {
                        let step = self.upload(request).await;
                        match step {
                            Ok(finished) => {
                                if finished {
                                    upload_open = false;
                                } else {
                                    // the peer likely has something to say now
                                    download.reset(&config);
                                }
                            }
                            Err(e) => break Err(e),
                        }
                    }
                    None => {
                        trace!("tunnel stream dropped");
                        upload_open = false;
                        download.chunks = None;
                    }
                },
                want = wants.recv(), if asking => match want {
                    Some(()) => {
                        download.reset(&config);
                        download.waiting = true;
                    }
                    None => {
                        trace!("tunnel stream dropped");
                        download.chunks = None;
                    }
                },
                () = sleep_until(next_poll), if polling => {
                    if let Err(e) = self.poll_download(&mut download, &config).await {
                        break Err(e);
                    }
                }
                else => break Ok(()),
            }
        };
        drop(requests);

        match result {
            Ok(()) => {
                match timeout(QUIT_TIMEOUT, self.command(&[b"QUIT"])).await {
                    Ok(Ok(Reply::Simple(_))) => {}
                    Ok(Ok(reply)) => debug!(reply = %reply.describe(), "unexpected reply to QUIT"),
                    Ok(Err(e)) => debug!("QUIT failed: {}", e),
                    Err(_) => debug!("QUIT timed out"),
                }
                let _ = self.conn.shutdown().await;
                debug!("tunnel closed");
            }
            Err(e) => {
                warn!("tunnel failed: {}", e);
                if let Some(tx) = download.chunks.take() {
                    let _ = tx.send(Err(e)).await;
                }
            }
        }
    }

    /// Returns `Ok(true)` once the upload direction is finished.
    async fn upload(&mut self, request: Request) -> io::Result<bool> {
        let key = random_key();
        let (value, ack, finish) = match request {
            Request::Set { payload, ack } => (encode(&payload), ack, false),
            Request::Finish { ack } => (Vec::new(), ack, true),
        };
        match self.command(&[b"SET", &key, &value]).await {
            Ok(Reply::Simple(s)) if s == "OK" => {
                let _ = ack.send(Ok(()));
                Ok(finish)
            }
            Ok(Reply::Error(msg)) => {
                let _ = ack.send(Err(Tunnel::ServerError(msg).into()));
                Ok(false)
            }
            Ok(other) => {
                let _ = ack.send(Err(Tunnel::MalformedReply(other.describe()).into()));
                Ok(false)
            }
            Err(e) => {
                let _ = ack.send(Err(duplicate(&e)));
                Err(e)
            }
        }
    }

    async fn poll_download(
        &mut self,
        download: &mut Download,
        config: &TunnelConfig,
    ) -> io::Result<()> {
        let key = random_key();
        let chunk = match self.command(&[b"GET", &key]).await? {
            Reply::Bulk(None) => {
                debug!("peer finished writing");
                download.waiting = false;
                download.chunks = None;
                return Ok(());
            }
            Reply::Bulk(Some(data)) if data.is_empty() => {
                download.empty_polls += 1;
                if download.empty_polls >= config.max_empty_polls {
                    debug!(polls = download.empty_polls, "no data from peer");
                    let err = Tunnel::NoDataAvailable {
                        polls: download.empty_polls,
                    };
                    download.answer(Err(err.into()));
                    download.reset(config);
                } else {
                    download.next_poll = Instant::now() + download.delay;
                    download.delay = config.next_delay(download.delay);
                }
                return Ok(());
            }
            Reply::Bulk(Some(data)) => decode(&data).map_err(|e| {
                io::Error::from(Tunnel::MalformedReply(format!("bad base64: {}", e)))
            })?,
            Reply::Error(msg) => return Err(Tunnel::ServerError(msg).into()),
            other => return Err(Tunnel::MalformedReply(other.describe()).into()),
        };

        trace!(len = chunk.len(), "chunk received");
        download.answer(Ok(chunk));
        download.reset(config);
        Ok(())
    }
}

impl Download {
    fn reset(&mut self, config: &TunnelConfig) {
        self.empty_polls = 0;
        self.delay = config.poll_delay_min;
        self.next_poll = Instant::now();
    }

    /// Hands `chunk` to the waiting read. The read consumed the previous
    /// answer before asking, so there is room.
    fn answer(&mut self, chunk: Chunk) {
        self.waiting = false;
        if let Some(tx) = &self.chunks {
            if tx.try_send(chunk).is_err() {
                self.chunks = None;
            }
        }
    }
}
