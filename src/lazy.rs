//! Server connections whose chain runs in the background.
//!
//! A multi-step chain (say a disguise handshake followed by TLS) can take a
//! few round trips. [`WrappedListener::accept`] therefore hands out a
//! [`LazyConn`] at once and applies the chain on a spawned task. I/O on the
//! [`LazyConn`] waits until the chain finished, failed, or
//! [`SETUP_TIMEOUT`] elapsed, whichever comes first. The outcome is observed
//! once; afterwards I/O goes straight to the wrapped connection.
use core::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};
use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, ToSocketAddrs},
    select, spawn,
    sync::oneshot,
    time::{sleep, timeout, Sleep},
};
use tracing::{debug, warn};

use crate::{
    chain::Chain,
    conn::{display_addr, Addrs, BoxConn, Connection},
    error::{Error, Setup},
};

/// How long a [`LazyConn`] waits for its chain.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(5);

type SetupResult = Result<BoxConn, Error>;

enum State {
    Pending(oneshot::Receiver<SetupResult>),
    Ready(BoxConn),
    Failed(Setup),
}

/// A server connection that becomes usable once its chain has been applied.
pub struct LazyConn {
    state: State,
    deadline: Pin<Box<Sleep>>,
    addrs: Addrs,
}

impl core::fmt::Debug for LazyConn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match &self.state {
            State::Pending(_) => "pending",
            State::Ready(_) => "ready",
            State::Failed(_) => "failed",
        };
        f.debug_struct("LazyConn")
            .field("state", &state)
            .field("addrs", &self.addrs)
            .finish()
    }
}

async fn setup(chain: Arc<Chain>, conn: BoxConn, mut tx: oneshot::Sender<SetupResult>) {
    let result = select! {
        result = timeout(SETUP_TIMEOUT, chain.wrap_server(conn)) => match result {
            Ok(result) => result,
            Err(_) => Err(Setup::Timeout.into()),
        },
        _ = tx.closed() => {
            debug!("conn closed before mw setup finished");
            return;
        }
    };
    match &result {
        Ok(_) => debug!("mw setup finished"),
        Err(e) => warn!("mw setup failed: {}", e),
    }
    // the receiver may have timed out in between
    let _ = tx.send(result);
}

impl LazyConn {
    /// Starts applying `chain` to `conn` as the responder.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(conn: BoxConn, chain: Arc<Chain>) -> Self {
        let addrs = Addrs::of(&*conn);
        let (tx, rx) = oneshot::channel();
        spawn(setup(chain, conn, tx));
        Self {
            state: State::Pending(rx),
            deadline: Box::pin(sleep(SETUP_TIMEOUT)),
            addrs,
        }
    }

    /// Returns `true` once the chain has been applied.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    /// Waits for the chain and returns the wrapped connection.
    pub async fn into_inner(mut self) -> io::Result<BoxConn> {
        core::future::poll_fn(|cx| self.poll_setup(cx)).await?;
        match self.state {
            State::Ready(conn) => Ok(conn),
            _ => Err(Setup::Closed.into()),
        }
    }

    fn poll_setup(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let rx = match &mut self.state {
            State::Ready(_) => return Poll::Ready(Ok(())),
            State::Failed(reason) => return Poll::Ready(Err(reason.clone().into())),
            State::Pending(rx) => rx,
        };
        let outcome = match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(result)) => result,
            // setup task ended without an answer
            Poll::Ready(Err(_)) => Err(Setup::Closed.into()),
            Poll::Pending => {
                ready!(self.deadline.as_mut().poll(cx));
                warn!(peer = %display_addr(self.addrs.peer()), "conn mw setup timeout");
                Err(Setup::Timeout.into())
            }
        };
        match outcome {
            Ok(conn) => {
                self.state = State::Ready(conn);
                Poll::Ready(Ok(()))
            }
            Err(e) => {
                self.state = State::Failed(match &e {
                    Error::Setup(reason) => reason.clone(),
                    _ => Setup::Closed,
                });
                Poll::Ready(Err(e.into()))
            }
        }
    }

    fn ready_conn(&mut self) -> Pin<&mut BoxConn> {
        match &mut self.state {
            State::Ready(conn) => Pin::new(conn),
            _ => unreachable!("polled before setup finished"),
        }
    }
}

impl AsyncRead for LazyConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        ready!(self.poll_setup(cx))?;
        self.ready_conn().poll_read(cx, buf)
    }
}

impl AsyncWrite for LazyConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(self.poll_setup(cx))?;
        self.ready_conn().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_setup(cx))?;
        self.ready_conn().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.state {
            State::Ready(_) => self.ready_conn().poll_shutdown(cx),
            State::Failed(_) => Poll::Ready(Ok(())),
            State::Pending(_) => {
                // Closing while pending abandons the setup.
                debug!(peer = %display_addr(self.addrs.peer()), "conn closed before mw setup finished");
                self.state = State::Failed(Setup::Closed);
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl Connection for LazyConn {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.addrs.local()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.addrs.peer()
    }
}

/// A TCP listener whose accepted connections are wrapped by a [`Chain`].
#[derive(Debug)]
pub struct WrappedListener {
    listener: TcpListener,
    chain: Arc<Chain>,
}

impl WrappedListener {
    /// Binds a new listener.
    pub async fn bind(addr: impl ToSocketAddrs, chain: Chain) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?, Arc::new(chain)))
    }

    /// Wraps an existing listener.
    pub fn new(listener: TcpListener, chain: Arc<Chain>) -> Self {
        Self { listener, chain }
    }

    /// Returns the local address of the listener.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts the next connection without waiting for its chain.
    pub async fn accept(&self) -> io::Result<(LazyConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        debug!(peer = %addr, "accepted conn");
        Ok((LazyConn::new(Box::new(stream), self.chain.clone()), addr))
    }
}

#[cfg(test)]
mod test {
    use core::future::pending;
    use std::io::ErrorKind;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        time::Instant,
    };

    use super::*;
    use crate::{
        chain::{Transform, WrapFuture},
        cipher::XorTransform,
        error::{downcast, Handshake},
        test::tcp_pair,
    };

    /// Holds the connection and never finishes.
    #[derive(Debug)]
    struct Stall;

    impl Transform for Stall {
        fn name(&self) -> &'static str {
            "stall"
        }

        fn wrap_client(&self, conn: BoxConn) -> WrapFuture<'_> {
            Box::pin(async move {
                let _conn = conn;
                pending().await
            })
        }

        fn wrap_server(&self, conn: BoxConn) -> WrapFuture<'_> {
            self.wrap_client(conn)
        }
    }

    #[derive(Debug)]
    struct Refuse;

    impl Transform for Refuse {
        fn name(&self) -> &'static str {
            "refuse"
        }

        fn wrap_client(&self, _conn: BoxConn) -> WrapFuture<'_> {
            Box::pin(async { Err::<BoxConn, _>(io::Error::from(Handshake::InvalidPassword)) })
        }

        fn wrap_server(&self, conn: BoxConn) -> WrapFuture<'_> {
            self.wrap_client(conn)
        }
    }

    fn stalled() -> Arc<Chain> {
        Arc::new(Chain::builder().with(Stall).build())
    }

    #[tokio::test]
    async fn test_listener_echo_after_setup() {
        let chain = Chain::builder().with(XorTransform).build();
        let listener = WrappedListener::bind("127.0.0.1:0", chain.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = spawn(async move {
            let (mut conn, peer) = listener.accept().await.unwrap();
            assert_eq!(conn.peer_addr().unwrap(), peer);
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            assert!(conn.is_ready());
            conn.write_all(&buf).await.unwrap();
            conn.flush().await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = chain.wrap_client(Box::new(stream)).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_failure_is_reported_at_once() {
        let (_client, server) = tcp_pair().await;
        let chain = Arc::new(Chain::builder().with(Refuse).build());
        let mut conn = LazyConn::new(Box::new(server), chain);

        let started = Instant::now();
        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(started.elapsed() < SETUP_TIMEOUT);
        assert!(matches!(
            downcast(&err),
            Some(Error::Transform { name: "refuse", .. })
        ));

        // later calls fail too, without waiting
        let err = conn.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeout() {
        let (_client, server) = tcp_pair().await;
        let mut conn = LazyConn::new(Box::new(server), stalled());

        let started = Instant::now();
        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(matches!(downcast(&err), Some(Error::Setup(Setup::Timeout))));
        assert!(started.elapsed() >= SETUP_TIMEOUT);
        assert!(!conn.is_ready());

        let err = conn.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_close_while_pending() {
        let (mut client, server) = tcp_pair().await;
        let mut conn = LazyConn::new(Box::new(server), stalled());

        conn.shutdown().await.unwrap();
        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(matches!(downcast(&err), Some(Error::Setup(Setup::Closed))));

        // the setup task drops the raw socket
        drop(conn);
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
