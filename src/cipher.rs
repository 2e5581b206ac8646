//! Per-connection keystream XOR.
//!
//! The initiator picks a random [`Password`] and sends it in the clear:
//!
//! ```text
//! | len | password  |
//! |  1B | len bytes |
//! ```
//!
//! From then on every byte in either direction is XORed with
//! `password[offset % len]`, where `offset` counts the bytes already moved in
//! that direction. This only flattens the byte distribution of the carried
//! protocol; anyone who captures the first `len + 1` bytes can undo it.
use core::{
    fmt::{Debug, Formatter},
    pin::Pin,
    task::{ready, Context, Poll},
};
use std::{io, net::SocketAddr};

use pin_project_lite::pin_project;
use rand::{seq::SliceRandom, Rng};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    chain::{Transform, WrapFuture},
    conn::{BoxConn, Connection},
    error::Handshake,
    protocol::{PASSWORD_MAX_LEN, PASSWORD_MIN_LEN},
};

/// A keystream: a derangement of `0..len` with `len` in
/// `PASSWORD_MIN_LEN..=PASSWORD_MAX_LEN`.
#[derive(Clone, Eq, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct Password(Vec<u8>);

impl Password {
    /// Generates a fresh random password.
    ///
    /// The length is uniform over the accepted range. Permutations with a
    /// fixed point are rejected and drawn again.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let len = rng.random_range(PASSWORD_MIN_LEN..=PASSWORD_MAX_LEN);
        let mut perm: Vec<u8> = (0..len).map(|i| i as u8).collect();
        loop {
            perm.shuffle(&mut rng);
            if is_derangement(&perm) {
                return Self(perm);
            }
        }
    }

    /// Validates a password received from the peer.
    pub fn from_wire(bytes: Vec<u8>) -> Result<Self, Handshake> {
        let len = bytes.len();
        if !(PASSWORD_MIN_LEN..=PASSWORD_MAX_LEN).contains(&len) {
            return Err(Handshake::InvalidPasswordLength {
                received: len.min(u8::MAX as usize) as u8,
            });
        }
        let password = Self(bytes);
        let mut seen = [false; 256];
        for (i, &b) in password.0.iter().enumerate() {
            let b = b as usize;
            if b >= len || b == i || seen[b] {
                return Err(Handshake::InvalidPassword);
            }
            seen[b] = true;
        }
        Ok(password)
    }

    /// Number of keystream bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; a password holds at least `PASSWORD_MIN_LEN` bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The keystream byte used at stream position `offset`.
    #[inline]
    pub(crate) fn key_at(&self, offset: u64) -> u8 {
        self.0[(offset % self.0.len() as u64) as usize]
    }

    /// XORs `buf` in place as the bytes at stream positions `offset..`.
    pub fn apply(&self, offset: u64, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b ^= self.key_at(offset + i as u64);
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Password {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Password").field(&self.0.len()).finish()
    }
}

fn is_derangement(perm: &[u8]) -> bool {
    perm.iter().enumerate().all(|(i, &v)| v as usize != i)
}

/// The stream-cipher transform.
///
/// The initiator generates and sends a [`Password`]; the responder receives
/// and validates it. Both sides then wrap the connection in an [`XorStream`].
#[derive(Copy, Clone, Debug, Default)]
pub struct XorTransform;

impl XorTransform {
    /// Runs the initiator side of the exchange on any stream.
    pub async fn handshake_client<IO>(io: &mut IO) -> io::Result<Password>
    where
        IO: AsyncWrite + Unpin,
    {
        let password = Password::generate();
        let mut hello = Vec::with_capacity(password.len() + 1);
        hello.push(password.len() as u8);
        hello.extend_from_slice(password.as_bytes());
        io.write_all(&hello).await?;
        io.flush().await?;
        hello.zeroize();
        Ok(password)
    }

    /// Runs the responder side of the exchange on any stream.
    pub async fn handshake_server<IO>(io: &mut IO) -> io::Result<Password>
    where
        IO: AsyncRead + Unpin,
    {
        let len = io.read_u8().await?;
        if (len as usize) < PASSWORD_MIN_LEN {
            return Err(Handshake::InvalidPasswordLength { received: len }.into());
        }
        let mut bytes = vec![0u8; len as usize];
        io.read_exact(&mut bytes).await?;
        Ok(Password::from_wire(bytes)?)
    }
}

impl Transform for XorTransform {
    fn name(&self) -> &'static str {
        "cipher"
    }

    fn wrap_client(&self, mut conn: BoxConn) -> WrapFuture<'_> {
        Box::pin(async move {
            let password = Self::handshake_client(&mut conn).await?;
            debug!(len = password.len(), "sent keystream");
            Ok(Box::new(XorStream::new(conn, password)) as BoxConn)
        })
    }

    fn wrap_server(&self, mut conn: BoxConn) -> WrapFuture<'_> {
        Box::pin(async move {
            let password = Self::handshake_server(&mut conn).await?;
            debug!(len = password.len(), "received keystream");
            Ok(Box::new(XorStream::new(conn, password)) as BoxConn)
        })
    }
}

pin_project! {
    /// A stream whose bytes are XORed with a repeating keystream.
    ///
    /// The read and write cursors are independent and never reset.
    #[derive(Debug)]
    pub struct XorStream<IO> {
        #[pin]
        stream: IO,
        password: Password,
        read_offset: u64,
        write_offset: u64,
        scratch: Vec<u8>,
    }
}

impl<IO> XorStream<IO> {
    /// Wraps `stream` with an already exchanged `password`.
    pub fn new(stream: IO, password: Password) -> Self {
        Self {
            stream,
            password,
            read_offset: 0,
            write_offset: 0,
            scratch: Vec::new(),
        }
    }

    /// Returns a reference to the inner stream.
    pub fn inner_stream(&self) -> &IO {
        &self.stream
    }

    /// Bytes delivered to readers so far.
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// Bytes accepted by the inner stream so far.
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }
}

impl<IO: AsyncRead> AsyncRead for XorStream<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.project();
        let start = buf.filled().len();
        ready!(me.stream.poll_read(cx, buf))?;
        let fresh = &mut buf.filled_mut()[start..];
        me.password.apply(*me.read_offset, fresh);
        *me.read_offset += fresh.len() as u64;
        Poll::Ready(Ok(()))
    }
}

impl<IO: AsyncWrite> AsyncWrite for XorStream<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.project();
        me.scratch.clear();
        me.scratch.extend_from_slice(buf);
        me.password.apply(*me.write_offset, &mut me.scratch[..]);
        let n = ready!(me.stream.poll_write(cx, &me.scratch[..]))?;
        // Only what the inner stream took is on the wire; the rest will be
        // encoded again, from the same offset, on the next call.
        *me.write_offset += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}

impl<IO: Connection> Connection for XorStream<IO> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

#[cfg(test)]
mod test {
    use rand::{rngs::StdRng, SeedableRng};
    use tokio::spawn;

    use super::*;
    use crate::{error::Error, test::tcp_pair};

    #[test]
    fn test_generated_passwords_are_derangements() {
        for _ in 0..2000 {
            let password = Password::generate();
            let len = password.len();
            assert!((PASSWORD_MIN_LEN..=PASSWORD_MAX_LEN).contains(&len));
            let mut sorted = password.as_bytes().to_vec();
            sorted.sort_unstable();
            assert!(sorted.iter().enumerate().all(|(i, &v)| v as usize == i));
            for i in 0..len {
                assert_ne!(password.as_bytes()[i] as usize, i);
            }
        }
    }

    #[test]
    fn test_apply_round_trip_with_arbitrary_split() {
        let mut rng = StdRng::from_seed([7u8; 32]);
        let password = Password::generate();
        for _ in 0..200 {
            let len = rng.random_range(0..4000);
            let plain: Vec<u8> = (0..len).map(|_| rng.random()).collect();

            let mut wire = plain.clone();
            password.apply(0, &mut wire);

            // decode in two differently sized pieces
            let split = if len == 0 { 0 } else { rng.random_range(0..len) };
            let (head, tail) = wire.split_at_mut(split);
            password.apply(0, head);
            password.apply(split as u64, tail);
            assert_eq!(wire, plain);
        }
    }

    /// The first 64 keystream bytes a fresh client connection puts on the wire.
    async fn keystream_prefix() -> Vec<u8> {
        let (client, mut server) = tcp_pair().await;
        let mut conn = XorTransform.wrap_client(Box::new(client)).await.unwrap();
        conn.write_all(&[0u8; 64]).await.unwrap();
        conn.flush().await.unwrap();

        XorTransform::handshake_server(&mut server).await.unwrap();
        let mut raw = vec![0u8; 64];
        server.read_exact(&mut raw).await.unwrap();
        raw
    }

    #[tokio::test]
    async fn test_connections_do_not_share_keystream() {
        let first = keystream_prefix().await;
        let second = keystream_prefix().await;
        assert_ne!(first, second);
    }

    #[test]
    fn test_from_wire_rejects() {
        assert_eq!(
            Password::from_wire(vec![1, 0]).unwrap_err(),
            Handshake::InvalidPasswordLength { received: 2 }
        );
        let identity: Vec<u8> = (0..128).map(|i| i as u8).collect();
        assert_eq!(
            Password::from_wire(identity).unwrap_err(),
            Handshake::InvalidPassword
        );
        let mut repeated: Vec<u8> = (0..128).map(|i| ((i + 1) % 128) as u8).collect();
        repeated[5] = repeated[6];
        assert_eq!(
            Password::from_wire(repeated).unwrap_err(),
            Handshake::InvalidPassword
        );
        let shifted: Vec<u8> = (0..128).map(|i| ((i + 1) % 128) as u8).collect();
        assert_eq!(Password::from_wire(shifted).unwrap().len(), 128);
    }

    #[tokio::test]
    async fn test_stream_echo() {
        let (client, server) = tcp_pair().await;
        let server_task = spawn(async move {
            let mut conn = XorTransform.wrap_server(Box::new(server)).await.unwrap();
            let mut buf = vec![0u8; 200_000];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        let mut conn = XorTransform.wrap_client(Box::new(client)).await.unwrap();
        conn.write_all(&data).await.unwrap();
        let mut echoed = vec![0u8; data.len()];
        conn.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, data);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wire_is_scrambled() {
        let (mut client, mut server) = tcp_pair().await;
        let password = XorTransform::handshake_client(&mut client).await.unwrap();
        let received = XorTransform::handshake_server(&mut server).await.unwrap();
        assert_eq!(password, received);

        let mut stream = XorStream::new(client, password);
        stream.write_all(&[0u8; 64]).await.unwrap();
        assert_eq!(stream.write_offset(), 64);

        let mut raw = [0u8; 64];
        server.read_exact(&mut raw).await.unwrap();
        // XOR with zeroes exposes the keystream itself.
        for (i, &b) in raw.iter().enumerate() {
            assert_eq!(b, received.key_at(i as u64));
        }
    }

    #[tokio::test]
    async fn test_handshake_rejects_short_length() {
        let (mut client, server) = tcp_pair().await;
        client.write_all(&[3, 1, 2, 0]).await.unwrap();
        let err = XorTransform.wrap_server(Box::new(server)).await.err().unwrap();
        assert!(matches!(
            crate::error::downcast(&err),
            Some(Error::Handshake(Handshake::InvalidPasswordLength { received: 3 }))
        ));
    }

    #[tokio::test]
    async fn test_handshake_short_read_is_fatal() {
        let (mut client, server) = tcp_pair().await;
        client.write_all(&[200, 1, 2, 3]).await.unwrap();
        drop(client);
        let err = XorTransform.wrap_server(Box::new(server)).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
