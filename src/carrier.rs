//! Carrier abstraction.
//!
//! A carrier is one live DNS tunnel: the transport encoding, Noise
//! encryption, and reliability layer behind it live outside this crate and
//! are reached through these traits. The client only needs two things from
//! a carrier: open multiplexed streams on it, and close it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::TransportKind;
use crate::dns::DomainName;
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::keys::PublicKey;

/// A reliable, ordered, bidirectional byte channel over one carrier.
pub trait CarrierStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> CarrierStream for T {}

/// One live DNS tunnel providing a multiplexed stream abstraction.
///
/// Carriers are independent: failure of one does not invalidate others.
/// A carrier outlives every stream it produced.
#[async_trait]
pub trait Carrier: Send + Sync {
    /// Open a new logical stream on this carrier.
    async fn open_stream(&self) -> Result<Box<dyn CarrierStream>>;

    /// Shut the carrier down. Idempotent.
    fn close(&self);
}

/// Everything a factory needs to bring up one carrier.
#[derive(Debug, Clone)]
pub struct CarrierOptions {
    /// TLS fingerprint to imitate; `None` means plain TLS
    pub fingerprint: Option<Fingerprint>,
    /// Server's Noise responder public key
    pub pubkey: PublicKey,
    /// Tunnel zone
    pub domain: DomainName,
    /// Effective MTU: payload bytes per DNS query after framing
    pub mtu: usize,
    /// DNS transport to use
    pub transport: TransportKind,
    /// Resolver address or DoH endpoint URL
    pub transport_addr: String,
    /// Enable zstd payload compression
    pub use_zstd: bool,
    /// Parallel DNS query senders, already clamped to 1–16
    pub num_parallel: usize,
}

/// Produces carriers for a session.
///
/// Options are fixed per session before any carrier exists, so factories
/// need no process-wide mutable state.
#[async_trait]
pub trait CarrierFactory: Send + Sync {
    /// Establish one carrier.
    async fn create(&self, options: &CarrierOptions) -> Result<Arc<dyn Carrier>>;
}
