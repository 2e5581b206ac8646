//! Ordered transform chains applied symmetrically on both tunnel endpoints.
//!
//! Both [`Chain::wrap_client`] and [`Chain::wrap_server`] walk the transforms
//! in the configured order and feed every output into the next transform, so
//! transform `i` on one endpoint only ever talks to transform `i` on the
//! other:
//!
//! ```text
//!   client                                           server
//!   ======                                           ======
//!   app bytes                                        app bytes
//!      |                                                ^
//!   [t_n].wrap_client ... [t_1].wrap_client      [t_n].wrap_server ... [t_1].wrap_server
//!      |                                                ^
//!   raw socket  ----------------------------------> raw socket
//! ```
use core::{fmt::Debug, future::Future, pin::Pin};
use std::{io, sync::Arc};

use tracing::{debug, warn};

use crate::{
    conn::{display_addr, BoxConn},
    error::Error,
};

/// The future returned by the wrap operations of a [`Transform`].
pub type WrapFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxConn>> + Send + 'a>>;

/// A unit that wraps a connection to add or remove one protocol layer.
///
/// A transform is invoked once per new connection, on whichever role the
/// endpoint plays. Per-connection state lives in the returned connection,
/// never in the transform itself.
pub trait Transform: Debug + Send + Sync {
    /// A short name used in logs and in [`Error::Transform`].
    fn name(&self) -> &'static str;

    /// Wraps `conn` acting as the initiator of the layer.
    fn wrap_client(&self, conn: BoxConn) -> WrapFuture<'_>;

    /// Wraps `conn` acting as the responder of the layer.
    fn wrap_server(&self, conn: BoxConn) -> WrapFuture<'_>;
}

/// An ordered list of [`Transform`]s, identical on both tunnel endpoints.
#[derive(Clone, Debug, Default)]
pub struct Chain {
    transforms: Vec<Arc<dyn Transform>>,
}

/// Incrementally assembles a [`Chain`].
#[derive(Debug, Default)]
pub struct ChainBuilder {
    transforms: Vec<Arc<dyn Transform>>,
}

impl ChainBuilder {
    /// Appends `transform` as the next (outer) layer.
    pub fn with(mut self, transform: impl Transform + 'static) -> Self {
        self.transforms.push(Arc::new(transform));
        self
    }

    /// Appends an already shared transform as the next (outer) layer.
    pub fn with_shared(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Finishes the chain.
    pub fn build(self) -> Chain {
        Chain {
            transforms: self.transforms,
        }
    }
}

impl Chain {
    /// Creates a chain from transforms listed innermost first.
    pub fn new(transforms: Vec<Arc<dyn Transform>>) -> Self {
        Self { transforms }
    }

    /// Returns a [`ChainBuilder`].
    pub fn builder() -> ChainBuilder {
        ChainBuilder::default()
    }

    /// Number of transforms in the chain.
    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    /// Returns `true` for the empty (pass-through) chain.
    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Names of the transforms, innermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    /// Applies every transform as the initiator.
    ///
    /// On failure the partially wrapped connection has already been dropped,
    /// i.e. closed, and the error names the transform that failed.
    pub async fn wrap_client(&self, conn: BoxConn) -> Result<BoxConn, Error> {
        debug!(
            local = %display_addr(conn.local_addr()),
            peer = %display_addr(conn.peer_addr()),
            "new client conn"
        );
        let mut conn = conn;
        for transform in &self.transforms {
            debug!(transform = transform.name(), "apply mw");
            conn = transform.wrap_client(conn).await.map_err(|source| {
                warn!(transform = transform.name(), error = %source, "wrap client conn failed");
                Error::Transform {
                    name: transform.name(),
                    source,
                }
            })?;
        }
        debug!(
            local = %display_addr(conn.local_addr()),
            peer = %display_addr(conn.peer_addr()),
            "wrapped client conn"
        );
        Ok(conn)
    }

    /// Applies every transform as the responder.
    ///
    /// Failure handling is identical to [`Chain::wrap_client`].
    pub async fn wrap_server(&self, conn: BoxConn) -> Result<BoxConn, Error> {
        debug!(
            peer = %display_addr(conn.peer_addr()),
            local = %display_addr(conn.local_addr()),
            "new server conn"
        );
        let mut conn = conn;
        for transform in &self.transforms {
            debug!(transform = transform.name(), "apply mw");
            conn = transform.wrap_server(conn).await.map_err(|source| {
                warn!(transform = transform.name(), error = %source, "wrap server conn failed");
                Error::Transform {
                    name: transform.name(),
                    source,
                }
            })?;
        }
        debug!(
            peer = %display_addr(conn.peer_addr()),
            local = %display_addr(conn.local_addr()),
            "wrapped server conn"
        );
        Ok(conn)
    }
}
