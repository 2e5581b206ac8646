//! Configuration structures for the transforms and the chain layout.
//!
//! Most transforms need no configuration at all. The disguise tunnel has a few
//! knobs that trade latency against request volume; [`TunnelConfig`] holds
//! them with defaults suited to interactive TCP traffic.
//!
//! A chain layout can also be written as a comma-separated list of transform
//! names, which is how the forwarder binaries take it on the command line:
//!
//! ```
//! use tunnelmw::config::{parse_chain, TransformKind};
//!
//! let kinds = parse_chain("tunnel, cipher,tls").unwrap();
//! assert_eq!(kinds, [TransformKind::Tunnel, TransformKind::Cipher, TransformKind::Tls]);
//! ```
//!
//! Both endpoints must use the same layout in the same order; the chain is
//! never reversed on the responder side.
use core::{fmt::Display, str::FromStr, time::Duration};

use crate::error::Error;

/// Tuning for the disguise tunnel.
///
/// The initiator polls the responder with `GET` whenever its reader has room
/// for more data. Empty replies back off exponentially from
/// `poll_delay_min` to `poll_delay_max`; after `max_empty_polls` empty
/// replies in a row the read fails. The responder caps its queue of unsent
/// data at `max_outbound_bytes` and holds writers back beyond that.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct TunnelConfig {
    pub(crate) poll_delay_min: Duration,
    pub(crate) poll_delay_max: Duration,
    pub(crate) max_empty_polls: u32,
    pub(crate) max_outbound_bytes: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            poll_delay_min: Duration::from_millis(2),
            poll_delay_max: Duration::from_millis(200),
            max_empty_polls: 3000,
            max_outbound_bytes: 4 * 1024 * 1024,
        }
    }
}

impl TunnelConfig {
    /// Sets the poll back-off range.
    ///
    /// ## Panic
    /// Panics if `min` is zero or greater than `max`.
    pub fn with_poll_delay(mut self, min: Duration, max: Duration) -> Self {
        assert!(!min.is_zero() && min <= max);
        self.poll_delay_min = min;
        self.poll_delay_max = max;
        self
    }

    /// Sets how many consecutive empty polls a read tolerates.
    pub fn with_max_empty_polls(mut self, polls: u32) -> Self {
        self.max_empty_polls = polls;
        self
    }

    /// Sets the responder's outbound queue cap in bytes.
    ///
    /// ## Panic
    /// Panics if `bytes` is zero.
    pub fn with_max_outbound_bytes(mut self, bytes: usize) -> Self {
        assert!(bytes > 0);
        self.max_outbound_bytes = bytes;
        self
    }

    /// Returns the delay that follows `current` after another empty poll.
    pub(crate) fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.poll_delay_max)
    }
}

/// The transforms a chain layout can name.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum TransformKind {
    /// The key-value protocol disguise, see [`TunnelTransform`].
    ///
    /// [`TunnelTransform`]: crate::TunnelTransform
    Tunnel,
    /// The keystream XOR, see [`XorTransform`].
    ///
    /// [`XorTransform`]: crate::XorTransform
    Cipher,
    /// Mutual TLS.
    Tls,
    /// zlib compression.
    Compress,
}

impl TransformKind {
    /// The name as used in chain layouts and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformKind::Tunnel => "tunnel",
            TransformKind::Cipher => "cipher",
            TransformKind::Tls => "tls",
            TransformKind::Compress => "compress",
        }
    }
}

impl Display for TransformKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransformKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tunnel" | "redis" => Ok(TransformKind::Tunnel),
            "cipher" | "rand" | "xor" => Ok(TransformKind::Cipher),
            "tls" => Ok(TransformKind::Tls),
            "compress" | "comp" => Ok(TransformKind::Compress),
            other => Err(Error::Config(format!("unknown transform `{}`", other))),
        }
    }
}

/// Parses a comma-separated chain layout, innermost transform first.
pub fn parse_chain(layout: &str) -> Result<Vec<TransformKind>, Error> {
    layout
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect()
}
