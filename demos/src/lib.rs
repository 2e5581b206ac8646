//! Plumbing shared by the demo binaries: chain flags and logging.
use std::{io, path::PathBuf};

use clap::Args;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tunnelmw::{
    config::{parse_chain, TransformKind},
    tls::{load_client_config, load_server_config},
    Chain, CompressTransform, Error, TlsTransform, TunnelTransform, XorTransform,
};

/// Which end of the tunnel a binary is.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    /// Dials the remote end and wraps as initiator.
    Client,
    /// Accepts and wraps as responder.
    Server,
}

/// Flags describing the chain; both ends must agree on `--chain`.
#[derive(Args, Debug, Clone)]
pub struct ChainArgs {
    /// Comma-separated transforms, innermost first
    /// (tunnel, cipher, tls, compress).
    #[arg(long, default_value = "tunnel,cipher,tls")]
    pub chain: String,

    /// CA certificate both ends are signed by.
    #[arg(long, default_value = "certs/ca.crt")]
    pub ca: PathBuf,

    /// Own certificate [default: certs/client.crt or certs/server.crt].
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Own private key [default: certs/client.key or certs/server.key].
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Name the server certificate is verified against.
    #[arg(long, default_value = "localhost")]
    pub server_name: String,

    /// Log level override (e.g. "info", "debug", "tunnelmw=trace").
    #[arg(long)]
    pub log_level: Option<String>,
}

impl ChainArgs {
    fn tls(&self, role: Role) -> Result<TlsTransform, Error> {
        let stem = match role {
            Role::Client => "client",
            Role::Server => "server",
        };
        let cert = self
            .cert
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("certs/{}.crt", stem)));
        let key = self
            .key
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("certs/{}.key", stem)));
        match role {
            Role::Client => TlsTransform::new(
                Some(load_client_config(&self.ca, cert, key)?),
                None,
                &self.server_name,
            ),
            Role::Server => TlsTransform::new(
                None,
                Some(load_server_config(&self.ca, cert, key)?),
                &self.server_name,
            ),
        }
    }

    /// Builds the chain for `role`. Certificates are only loaded when the
    /// chain contains `tls`.
    pub fn build(&self, role: Role) -> Result<Chain, Error> {
        let mut builder = Chain::builder();
        for kind in parse_chain(&self.chain)? {
            builder = match kind {
                TransformKind::Tunnel => builder.with(TunnelTransform::default()),
                TransformKind::Cipher => builder.with(XorTransform),
                TransformKind::Tls => builder.with(self.tls(role)?),
                TransformKind::Compress => builder.with(CompressTransform),
                other => return Err(Error::Config(format!("unsupported transform `{}`", other))),
            };
        }
        Ok(builder.build())
    }
}

/// Installs a stderr subscriber, `info` unless overridden.
pub fn init_tracing(level: Option<&str>) {
    let level = level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}
