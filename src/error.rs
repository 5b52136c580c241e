//! Error types for the tunnel client.

use thiserror::Error;

/// Result type alias for tunnel client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the tunnel client.
#[derive(Error, Debug)]
pub enum Error {
    /// A start was attempted while a session is already running
    #[error("tunnel already running")]
    AlreadyRunning,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed tunnel domain
    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    /// Malformed server public key
    #[error("invalid pubkey: {0}")]
    InvalidKey(String),

    /// Malformed TLS fingerprint distribution spec
    #[error("invalid fingerprint spec: {0}")]
    InvalidFingerprint(String),

    /// No carrier could be established at startup
    #[error("carrier startup failed: {0}")]
    CarrierStartup(String),

    /// Local SOCKS listener could not be bound
    #[error("listening on {addr}: {source}")]
    Listen {
        /// The address the bind was attempted on
        addr: String,
        /// The underlying bind error
        source: std::io::Error,
    },

    /// Opening a logical stream on a carrier failed
    #[error("stream open failed: {0}")]
    StreamOpen(String),

    /// SOCKS5 handshake failed (local or upstream side)
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Resolver probe failure
    #[error("probe error: {0}")]
    Probe(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Operation timed out
    #[error("timeout after {0}ms")]
    Timeout(u64),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new probe error
    pub fn probe(msg: impl Into<String>) -> Self {
        Error::Probe(msg.into())
    }

    /// Check whether this error aborts a session at startup.
    ///
    /// Per-relay and per-probe errors are local: they close one connection
    /// or discard one candidate without touching the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::InvalidDomain(_)
                | Error::InvalidKey(_)
                | Error::InvalidFingerprint(_)
                | Error::CarrierStartup(_)
                | Error::Listen { .. }
        )
    }
}
