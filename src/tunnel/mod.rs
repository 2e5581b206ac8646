//! Carrying a byte stream inside a key-value request/response protocol.
//!
//! On the wire the tunnel looks like a client talking to a key-value store:
//! payload goes up as `SET <key> <base64>` and comes down as the bulk reply
//! to `GET <key>`. See the [`protocol`] module for the exact exchange.
//!
//! ```text
//!   initiator                                    responder
//!   =========                                    =========
//!   write() --> driver task --SET--> command loop --> inbound buffer --> read()
//!   read()  <-- driver task --GET--> command loop <-- outbound queue <-- write()
//! ```
//!
//! The responder never blocks its command loop waiting for data: a `GET`
//! with nothing queued is answered with an empty bulk string and the
//! initiator polls again after a back-off.
//!
//! [`protocol`]: crate::protocol
mod client;
mod server;

pub use client::TunnelClientStream;
pub use server::TunnelServerStream;

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::Rng;

use crate::{
    chain::{Transform, WrapFuture},
    config::TunnelConfig,
    conn::BoxConn,
    protocol::KEY_LEN,
};

/// The disguise-tunnel transform.
#[derive(Clone, Debug, Default)]
pub struct TunnelTransform {
    config: TunnelConfig,
}

impl TunnelTransform {
    /// Creates the transform with the given tuning.
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Returns the tuning in use.
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }
}

impl Transform for TunnelTransform {
    fn name(&self) -> &'static str {
        "tunnel"
    }

    fn wrap_client(&self, conn: BoxConn) -> WrapFuture<'_> {
        Box::pin(async move {
            let stream = TunnelClientStream::connect(conn, self.config.clone()).await?;
            Ok(Box::new(stream) as BoxConn)
        })
    }

    fn wrap_server(&self, conn: BoxConn) -> WrapFuture<'_> {
        Box::pin(async move {
            Ok(Box::new(TunnelServerStream::spawn(conn, self.config.clone())) as BoxConn)
        })
    }
}

/// A throwaway key; neither side looks at it.
fn random_key() -> [u8; KEY_LEN] {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::rng();
    core::array::from_fn(|_| LETTERS[rng.random_range(0..LETTERS.len())])
}

fn encode(data: &[u8]) -> Vec<u8> {
    STANDARD.encode(data).into_bytes()
}

fn decode(data: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        spawn,
    };

    use super::*;
    use crate::{
        error::{downcast, Error, Tunnel},
        test::tcp_pair,
    };

    async fn pair(config: TunnelConfig) -> (BoxConn, BoxConn) {
        let (client, server) = tcp_pair().await;
        let transform = TunnelTransform::new(config);
        let server = transform.wrap_server(Box::new(server)).await.unwrap();
        let client = transform.wrap_client(Box::new(client)).await.unwrap();
        (client, server)
    }

    fn impatient() -> TunnelConfig {
        TunnelConfig::default()
            .with_poll_delay(Duration::from_millis(1), Duration::from_millis(2))
            .with_max_empty_polls(5)
    }

    #[test]
    fn test_random_key_is_letters() {
        let key = random_key();
        assert!(key.iter().all(u8::is_ascii_alphabetic));
    }

    #[tokio::test]
    async fn test_chunks_concatenate_upstream() {
        let (mut client, mut server) = pair(TunnelConfig::default()).await;
        for chunk in ["a", "bb", "ccc"] {
            client.write_all(chunk.as_bytes()).await.unwrap();
        }
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abbccc");
    }

    #[tokio::test]
    async fn test_chunks_concatenate_downstream() {
        let (mut client, mut server) = pair(TunnelConfig::default()).await;
        for chunk in ["a", "bb", "ccc"] {
            server.write_all(chunk.as_bytes()).await.unwrap();
        }
        // one byte at a time, so reads never line up with chunk boundaries
        let mut received = Vec::new();
        let mut byte = [0u8; 1];
        while received.len() < 6 {
            client.read_exact(&mut byte).await.unwrap();
            received.push(byte[0]);
        }
        assert_eq!(received, b"abbccc");
    }

    #[tokio::test]
    async fn test_large_duplex_transfer() {
        let (mut client, mut server) = pair(TunnelConfig::default()).await;
        let data: Vec<u8> = (0..300_000u32).map(|i| (i * 31 % 256) as u8).collect();
        let expected = data.clone();

        let server_task = spawn(async move {
            let mut buf = vec![0u8; 300_000];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(&buf).await.unwrap();
            server
        });
        client.write_all(&data).await.unwrap();
        let mut echoed = vec![0u8; expected.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, expected);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_half_close_client_to_server() {
        let (mut client, mut server) = pair(TunnelConfig::default()).await;
        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        server.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        // the server's write half is still open
        server.write_all(b"response").await.unwrap();
        server.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");
    }

    #[tokio::test]
    async fn test_half_close_server_to_client() {
        let (mut client, mut server) = pair(TunnelConfig::default()).await;
        server.write_all(b"banner").await.unwrap();
        server.shutdown().await.unwrap();

        let mut banner = Vec::new();
        client.read_to_end(&mut banner).await.unwrap();
        assert_eq!(banner, b"banner");

        client.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn test_no_data_exhausts_retry_budget() {
        let (mut client, _server) = pair(impatient()).await;

        let mut buf = [0u8; 16];
        let err = client.read(&mut buf).await.unwrap_err();
        assert!(matches!(
            downcast(&err),
            Some(Error::Tunnel(Tunnel::NoDataAvailable { polls: 5 }))
        ));
    }

    #[tokio::test]
    async fn test_idle_client_still_receives_reply() {
        let (mut client, mut server) = pair(impatient()).await;

        // far longer than five empty polls would take, with nobody reading
        tokio::time::sleep(Duration::from_millis(200)).await;
        client.write_all(b"req").await.unwrap();

        let mut request = [0u8; 3];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"req");
        server.write_all(b"resp").await.unwrap();

        let mut response = [0u8; 4];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"resp");
    }

    #[tokio::test]
    async fn test_read_after_no_data_starts_fresh_budget() {
        let (mut client, mut server) = pair(impatient()).await;

        let mut buf = [0u8; 16];
        let err = client.read(&mut buf).await.unwrap_err();
        assert!(matches!(
            downcast(&err),
            Some(Error::Tunnel(Tunnel::NoDataAvailable { polls: 5 }))
        ));

        server.write_all(b"late").await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");
    }

    #[tokio::test]
    async fn test_client_drop_ends_server_session() {
        let (client, mut server) = pair(TunnelConfig::default()).await;
        drop(client);
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
        let err = server.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
