//! Tunnel client configuration.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default local SOCKS5 listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:1080";

/// Default number of parallel carriers.
pub const DEFAULT_TUNNELS: usize = 8;

/// Largest allowed number of parallel DNS senders per carrier.
pub const MAX_PARALLEL_SENDERS: usize = 16;

/// DNS transport the carrier uses to reach the tunnel server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// DNS over HTTPS
    Doh,
    /// DNS over TLS
    Dot,
    /// Plain DNS over UDP
    Udp,
}

impl TransportKind {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Doh => "doh",
            Self::Dot => "dot",
            Self::Udp => "udp",
        }
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "doh" => Ok(Self::Doh),
            "dot" => Ok(Self::Dot),
            "udp" => Ok(Self::Udp),
            other => Err(Error::config(format!("unknown transport {:?}", other))),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunnel client configuration.
///
/// All fields are set before `start`; a running session never re-reads
/// them. The advisory `mtu` is a hint only: the effective MTU is derived
/// from the tunnel domain at startup.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Carrier transport selector
    pub transport: TransportKind,
    /// Resolver address or DoH endpoint URL
    pub transport_addr: String,
    /// Server's Noise responder public key, hex-encoded
    pub pubkey_hex: String,
    /// Tunnel zone
    pub domain: String,
    /// Local SOCKS5 listen address; empty means [`DEFAULT_LISTEN_ADDR`]
    pub listen_addr: String,
    /// Number of parallel carriers
    pub tunnels: usize,
    /// Advisory MTU
    pub mtu: usize,
    /// TLS fingerprint distribution spec; empty or `"none"` disables
    pub utls_fingerprint: String,
    /// Enable zstd payload compression (must match the server)
    pub use_zstd: bool,
    /// Parallel DNS query senders per carrier, clamped to 1–16
    pub num_parallel: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Doh,
            transport_addr: "https://dns.google/dns-query".into(),
            pubkey_hex: String::new(),
            domain: String::new(),
            listen_addr: DEFAULT_LISTEN_ADDR.into(),
            tunnels: DEFAULT_TUNNELS,
            mtu: 1232,
            utls_fingerprint: "none".into(),
            use_zstd: true,
            num_parallel: 8,
        }
    }
}

impl TunnelConfig {
    /// Listen address with the empty-string default applied.
    pub fn effective_listen_addr(&self) -> &str {
        if self.listen_addr.is_empty() {
            DEFAULT_LISTEN_ADDR
        } else {
            &self.listen_addr
        }
    }

    /// Carrier count with the below-one default applied.
    pub fn effective_tunnels(&self) -> usize {
        if self.tunnels < 1 {
            DEFAULT_TUNNELS
        } else {
            self.tunnels
        }
    }

    /// Parallel sender count clamped to the supported range.
    pub fn clamped_parallel(&self) -> usize {
        self.num_parallel.clamp(1, MAX_PARALLEL_SENDERS)
    }

    /// Whether TLS fingerprinting is disabled by the spec string.
    pub fn fingerprint_disabled(&self) -> bool {
        self.utls_fingerprint.is_empty() || self.utls_fingerprint == "none"
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        let file: TunnelConfigFile =
            serde_json::from_str(content).map_err(|e| Error::config(e.to_string()))?;
        file.into_config()
    }
}

/// On-disk configuration file format.
#[derive(Debug, Serialize, Deserialize)]
pub struct TunnelConfigFile {
    /// Carrier transport ("doh", "dot", or "udp")
    pub transport: String,
    /// Resolver address or DoH endpoint URL
    pub transport_addr: String,
    /// Server's public key, hex-encoded
    pub pubkey_hex: String,
    /// Tunnel zone
    pub domain: String,
    /// Local SOCKS5 listen address
    #[serde(default)]
    pub listen_addr: String,
    /// Number of parallel carriers
    #[serde(default = "default_tunnels")]
    pub tunnels: usize,
    /// Advisory MTU
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// TLS fingerprint distribution spec
    #[serde(default)]
    pub utls_fingerprint: String,
    /// Enable zstd payload compression
    #[serde(default = "default_true")]
    pub use_zstd: bool,
    /// Parallel DNS senders per carrier
    #[serde(default = "default_parallel")]
    pub num_parallel: usize,
}

fn default_tunnels() -> usize {
    DEFAULT_TUNNELS
}

fn default_mtu() -> usize {
    1232
}

fn default_true() -> bool {
    true
}

fn default_parallel() -> usize {
    8
}

impl TunnelConfigFile {
    /// Convert to the runtime configuration.
    pub fn into_config(self) -> Result<TunnelConfig> {
        Ok(TunnelConfig {
            transport: self.transport.parse()?,
            transport_addr: self.transport_addr,
            pubkey_hex: self.pubkey_hex,
            domain: self.domain,
            listen_addr: self.listen_addr,
            tunnels: self.tunnels,
            mtu: self.mtu,
            utls_fingerprint: self.utls_fingerprint,
            use_zstd: self.use_zstd,
            num_parallel: self.num_parallel,
        })
    }

    /// Create from a runtime configuration.
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            transport: config.transport.to_string(),
            transport_addr: config.transport_addr.clone(),
            pubkey_hex: config.pubkey_hex.clone(),
            domain: config.domain.clone(),
            listen_addr: config.listen_addr.clone(),
            tunnels: config.tunnels,
            mtu: config.mtu,
            utls_fingerprint: config.utls_fingerprint.clone(),
            use_zstd: config.use_zstd,
            num_parallel: config.num_parallel,
        }
    }
}
