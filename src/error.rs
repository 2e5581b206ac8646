//! All possible non-I/O middleware errors.
//!
use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Enumeration of all possible non-I/O middleware errors.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A transform could not complete its setup exchange with the peer.
    ///
    /// # Suggested error handling strategy
    ///
    /// This error is fatal for the connection. Close it; there is no retry.
    Handshake(Handshake),

    /// The disguise tunnel could not move data.
    Tunnel(Tunnel),

    /// A lazily wrapped server connection never became ready.
    Setup(Setup),

    /// A transform of a [`Chain`] failed while wrapping a connection.
    ///
    /// `name` identifies the transform, `source` carries the reason.
    ///
    /// [`Chain`]: crate::Chain
    Transform {
        /// The [`name`] of the failed transform.
        ///
        /// [`name`]: crate::Transform::name
        name: &'static str,
        /// The underlying failure.
        source: io::Error,
    },

    /// Invalid or unloadable configuration, e.g. a missing certificate.
    Config(String),
}

/// The peer deviated from a transform's setup exchange.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Handshake {
    /// The announced keystream length is outside the accepted range.
    InvalidPasswordLength {
        /// The length byte we received.
        received: u8,
    },

    /// The received keystream is not a derangement of `0..len`.
    InvalidPassword,

    /// The disguise server answered a handshake command unexpectedly.
    UnexpectedReply {
        /// The reply we wanted.
        expected: &'static str,
        /// The reply we got.
        received: String,
    },
}

/// Failures of the disguise tunnel after the handshake.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Tunnel {
    /// The peer had no data for too many consecutive polls.
    NoDataAvailable {
        /// How many empty polls were made.
        polls: u32,
    },

    /// The peer answered with an error reply.
    ServerError(String),

    /// The peer sent something that is not a valid reply or command.
    MalformedReply(String),

    /// A line or bulk argument exceeded the accepted length.
    LineTooLong,
}

/// Why a lazily wrapped connection did not become ready.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Setup {
    /// The connection was closed before the chain finished.
    Closed,

    /// The chain did not finish within the setup timeout.
    Timeout,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Handshake(err) => write!(f, "Handshake: {}", err),
            Error::Tunnel(err) => write!(f, "Tunnel: {}", err),
            Error::Setup(err) => write!(f, "Setup: {}", err),
            Error::Transform { name, source } => write!(f, "[{}] wrap failed: {}", name, source),
            Error::Config(msg) => write!(f, "Config: {}", msg),
        }
    }
}

impl Display for Handshake {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Handshake::InvalidPasswordLength { received } => {
                write!(f, "InvalidPasswordLength: received {}", received)
            }
            Handshake::InvalidPassword => write!(f, "InvalidPassword"),
            Handshake::UnexpectedReply { expected, received } => write!(
                f,
                "UnexpectedReply: expected `{}`, received `{}`",
                expected, received
            ),
        }
    }
}

impl Display for Tunnel {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Tunnel::NoDataAvailable { polls } => {
                write!(f, "NoDataAvailable: {} empty polls", polls)
            }
            Tunnel::ServerError(msg) => write!(f, "ServerError: {}", msg),
            Tunnel::MalformedReply(reply) => write!(f, "MalformedReply: {}", reply),
            Tunnel::LineTooLong => write!(f, "LineTooLong"),
        }
    }
}

impl Display for Setup {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Setup::Closed => write!(f, "conn closed"),
            Setup::Timeout => write!(f, "conn mw setup timeout"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Handshake(err) => Some(err),
            Error::Tunnel(err) => Some(err),
            Error::Setup(err) => Some(err),
            Error::Transform { source, .. } => Some(source),
            Error::Config(_) => None,
        }
    }
}

impl error::Error for Handshake {}

impl error::Error for Tunnel {}

impl error::Error for Setup {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Setup(Setup::Timeout) => ErrorKind::TimedOut,
            Error::Setup(Setup::Closed) => ErrorKind::BrokenPipe,
            _ => ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

impl From<Handshake> for io::Error {
    fn from(e: Handshake) -> Self {
        Error::Handshake(e).into()
    }
}

impl From<Tunnel> for io::Error {
    fn from(e: Tunnel) -> Self {
        Error::Tunnel(e).into()
    }
}

impl From<Setup> for io::Error {
    fn from(e: Setup) -> Self {
        Error::Setup(e).into()
    }
}

impl From<Handshake> for Error {
    fn from(e: Handshake) -> Self {
        Error::Handshake(e)
    }
}

impl From<Tunnel> for Error {
    fn from(e: Tunnel) -> Self {
        Error::Tunnel(e)
    }
}

impl From<Setup> for Error {
    fn from(e: Setup) -> Self {
        Error::Setup(e)
    }
}

/// Returns the middleware [`Error`] carried by `err`, if any.
pub fn downcast(err: &io::Error) -> Option<&Error> {
    err.get_ref().and_then(|e| e.downcast_ref::<Error>())
}
