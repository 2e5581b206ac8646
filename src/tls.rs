//! Mutual TLS as a chain transform.
//!
//! Both endpoints authenticate each other against one private CA: the client
//! trusts the CA and presents its own certificate, the server presents its
//! certificate and requires a client certificate signed by the same CA.
use std::{fs, io, net::SocketAddr, path::Path, sync::Arc};

pub use tokio_rustls::rustls;

use tokio_rustls::{
    client,
    rustls::{
        crypto::CryptoProvider,
        pki_types::{CertificateDer, PrivateKeyDer, ServerName},
        server::WebPkiClientVerifier,
        ClientConfig, RootCertStore, ServerConfig,
    },
    server, TlsAcceptor, TlsConnector,
};
use tracing::debug;

use crate::{
    chain::{Transform, WrapFuture},
    conn::{BoxConn, Connection},
    error::Error,
};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn config_error(what: &str, e: impl core::fmt::Display) -> Error {
    Error::Config(format!("{}: {}", what, e))
}

fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|e| config_error(&path.display().to_string(), e))
}

/// Parses every certificate in a PEM bundle.
fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| config_error("bad certificate PEM", e))?;
    if certs.is_empty() {
        return Err(Error::Config("no certificate found".into()));
    }
    Ok(certs)
}

/// Parses the first private key in a PEM file.
fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| config_error("bad private key PEM", e))?
        .ok_or_else(|| Error::Config("no private key found".into()))
}

fn parse_roots(pem: &[u8]) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(pem)? {
        roots
            .add(cert)
            .map_err(|e| config_error("failed to add CA cert", e))?;
    }
    Ok(roots)
}

/// Builds a client config from PEM data: the trusted CA, the client
/// certificate chain and its private key.
pub fn client_config_from_pem(ca: &[u8], cert: &[u8], key: &[u8]) -> Result<ClientConfig, Error> {
    ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| config_error("TLS version error", e))?
        .with_root_certificates(parse_roots(ca)?)
        .with_client_auth_cert(parse_certs(cert)?, parse_key(key)?)
        .map_err(|e| config_error("client certificate rejected", e))
}

/// Builds a server config from PEM data: the CA client certificates must be
/// signed by, the server certificate chain and its private key.
pub fn server_config_from_pem(ca: &[u8], cert: &[u8], key: &[u8]) -> Result<ServerConfig, Error> {
    let provider = provider();
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(parse_roots(ca)?), provider.clone())
            .build()
            .map_err(|e| config_error("client verifier error", e))?;
    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| config_error("TLS version error", e))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(parse_certs(cert)?, parse_key(key)?)
        .map_err(|e| config_error("server certificate rejected", e))
}

/// Loads a client config from PEM files.
pub fn load_client_config(
    ca: impl AsRef<Path>,
    cert: impl AsRef<Path>,
    key: impl AsRef<Path>,
) -> Result<ClientConfig, Error> {
    client_config_from_pem(
        &read_file(ca.as_ref())?,
        &read_file(cert.as_ref())?,
        &read_file(key.as_ref())?,
    )
}

/// Loads a server config from PEM files.
pub fn load_server_config(
    ca: impl AsRef<Path>,
    cert: impl AsRef<Path>,
    key: impl AsRef<Path>,
) -> Result<ServerConfig, Error> {
    server_config_from_pem(
        &read_file(ca.as_ref())?,
        &read_file(cert.as_ref())?,
        &read_file(key.as_ref())?,
    )
}

/// The TLS transform.
///
/// An endpoint only needs the config of the role it plays; wrapping in the
/// other role fails with [`Error::Config`].
#[derive(Clone)]
pub struct TlsTransform {
    connector: Option<TlsConnector>,
    acceptor: Option<TlsAcceptor>,
    server_name: ServerName<'static>,
}

impl core::fmt::Debug for TlsTransform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TlsTransform")
            .field("client", &self.connector.is_some())
            .field("server", &self.acceptor.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsTransform {
    /// Creates the transform. `server_name` is what the client verifies the
    /// server certificate against.
    pub fn new(
        client: Option<ClientConfig>,
        server: Option<ServerConfig>,
        server_name: &str,
    ) -> Result<Self, Error> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| config_error("invalid server name", e))?;
        Ok(Self {
            connector: client.map(|c| TlsConnector::from(Arc::new(c))),
            acceptor: server.map(|c| TlsAcceptor::from(Arc::new(c))),
            server_name,
        })
    }
}

impl Transform for TlsTransform {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn wrap_client(&self, conn: BoxConn) -> WrapFuture<'_> {
        Box::pin(async move {
            let connector = self
                .connector
                .as_ref()
                .ok_or_else(|| Error::Config("tls transform has no client config".into()))?;
            let stream = connector.connect(self.server_name.clone(), conn).await?;
            debug!(
                version = ?stream.get_ref().1.protocol_version(),
                "tls client handshake done"
            );
            Ok(Box::new(stream) as BoxConn)
        })
    }

    fn wrap_server(&self, conn: BoxConn) -> WrapFuture<'_> {
        Box::pin(async move {
            let acceptor = self
                .acceptor
                .as_ref()
                .ok_or_else(|| Error::Config("tls transform has no server config".into()))?;
            let stream = acceptor.accept(conn).await?;
            debug!(
                version = ?stream.get_ref().1.protocol_version(),
                "tls server handshake done"
            );
            Ok(Box::new(stream) as BoxConn)
        })
    }
}

impl<IO> Connection for client::TlsStream<IO>
where
    IO: Connection,
{
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.peer_addr()
    }
}

impl<IO> Connection for server::TlsStream<IO>
where
    IO: Connection,
{
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.peer_addr()
    }
}

#[cfg(test)]
mod test {
    use rcgen::{
        BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        spawn,
    };

    use super::*;
    use crate::{error::downcast, test::tcp_pair};

    struct Pki {
        ca: rcgen::Certificate,
        ca_key: KeyPair,
    }

    /// PEM-encoded `(cert, key)`.
    type Issued = (String, String);

    impl Pki {
        fn new(name: &str) -> Self {
            let ca_key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.distinguished_name.push(DnType::CommonName, name);
            let ca = params.self_signed(&ca_key).unwrap();
            Self { ca, ca_key }
        }

        fn issue(&self, name: &str, purpose: ExtendedKeyUsagePurpose) -> Issued {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
            params.distinguished_name.push(DnType::CommonName, name);
            params.extended_key_usages = vec![purpose];
            let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();
            (cert.pem(), key.serialize_pem())
        }

        fn ca_pem(&self) -> String {
            self.ca.pem()
        }
    }

    fn transform(pki: &Pki, client_pki: &Pki) -> TlsTransform {
        let (server_cert, server_key) = pki.issue("localhost", ExtendedKeyUsagePurpose::ServerAuth);
        let (client_cert, client_key) =
            client_pki.issue("client", ExtendedKeyUsagePurpose::ClientAuth);
        let server = server_config_from_pem(
            pki.ca_pem().as_bytes(),
            server_cert.as_bytes(),
            server_key.as_bytes(),
        )
        .unwrap();
        let client = client_config_from_pem(
            pki.ca_pem().as_bytes(),
            client_cert.as_bytes(),
            client_key.as_bytes(),
        )
        .unwrap();
        TlsTransform::new(Some(client), Some(server), "localhost").unwrap()
    }

    #[tokio::test]
    async fn test_mutual_tls_echo_and_half_close() {
        let pki = Pki::new("tunnelmw test ca");
        let tls = Arc::new(transform(&pki, &pki));
        let (client, server) = tcp_pair().await;

        let server_tls = tls.clone();
        let server_task = spawn(async move {
            let mut conn = server_tls.wrap_server(Box::new(server)).await.unwrap();
            let mut request = Vec::new();
            conn.read_to_end(&mut request).await.unwrap();
            conn.write_all(&request).await.unwrap();
            conn.shutdown().await.unwrap();
        });

        let mut conn = tls.wrap_client(Box::new(client)).await.unwrap();
        conn.write_all(b"over tls").await.unwrap();
        conn.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        conn.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"over tls");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_client_certificate_rejected() {
        let pki = Pki::new("tunnelmw test ca");
        let stranger = Pki::new("someone else");
        let tls = Arc::new(transform(&pki, &stranger));
        let (client, server) = tcp_pair().await;

        let client_tls = tls.clone();
        let client_task = spawn(async move {
            // may or may not notice before the server aborts
            let _ = client_tls.wrap_client(Box::new(client)).await;
        });
        assert!(tls.wrap_server(Box::new(server)).await.is_err());
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_role_config() {
        let tls = TlsTransform::new(None, None, "localhost").unwrap();
        let (client, _server) = tcp_pair().await;
        let err = tls.wrap_client(Box::new(client)).await.err().unwrap();
        assert!(matches!(downcast(&err), Some(Error::Config(_))));
    }

    #[test]
    fn test_bad_pem_is_config_error() {
        assert!(matches!(
            client_config_from_pem(b"not pem", b"", b""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            TlsTransform::new(None, None, "not a name!"),
            Err(Error::Config(_))
        ));
    }
}
