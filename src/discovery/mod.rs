//! Resolver discovery.
//!
//! The tunnel only works through recursive resolvers that faithfully relay
//! queries for the tunnel zone, and candidate lists run to the thousands.
//! This module probes them: a breadth scan over every candidate
//! ([`scan`]), a two-phase engine that verifies actual tunnel connectivity
//! with early termination ([`two_phase`]), and a lightweight sequential
//! walk ([`sequential`]).
//!
//! The raw probe primitives (a DNS query under the zone, a full tunnel
//! handshake) live outside this crate behind [`ResolverProbe`].

pub mod scan;
pub mod sequential;
pub mod two_phase;

use std::time::Duration;

use async_trait::async_trait;

use crate::dns::DomainName;
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::keys::PublicKey;

/// Outcome of a single DNS-level probe.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Whether the resolver answered a query under the tunnel zone
    pub success: bool,
    /// Measured round-trip time
    pub latency: Duration,
    /// Failure description, if any
    pub error: Option<String>,
}

/// Raw probe primitives, implemented by the transport layer.
#[async_trait]
pub trait ResolverProbe: Send + Sync {
    /// Ask `resolver` for a synthetic name under `domain` and measure the
    /// round trip.
    async fn test_dns(
        &self,
        resolver: &str,
        domain: &DomainName,
        timeout: Duration,
    ) -> ProbeOutcome;

    /// Attempt a full tunnel handshake through `resolver` (host:port).
    async fn test_tunnel(
        &self,
        resolver: &str,
        domain: &DomainName,
        pubkey: &PublicKey,
        fingerprint: Option<Fingerprint>,
        timeout: Duration,
    ) -> Result<()>;
}

/// Result of testing one resolver candidate.
#[derive(Debug, Clone)]
pub struct ResolverResult {
    /// The candidate as it appeared in the input
    pub resolver: String,
    /// Whether the probe succeeded
    pub success: bool,
    /// Round-trip latency in milliseconds
    pub latency_ms: u64,
    /// Failure description, if any
    pub error: Option<String>,
}

/// Breadth-scan results, sorted successful-then-fastest first.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// One entry per input candidate
    pub results: Vec<ResolverResult>,
}

impl ScanReport {
    /// Number of results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether the report is empty.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// The fastest successful resolver, if any.
    pub fn best(&self) -> Option<&ResolverResult> {
        self.results.iter().find(|r| r.success)
    }

    /// How many candidates passed.
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

/// Progress observer for breadth and sequential scans.
pub trait ResolverCallback: Send + Sync {
    /// A candidate finished; `tested` of `total` are done.
    fn on_progress(&self, tested: usize, total: usize, resolver: &str);

    /// Full result for one candidate.
    fn on_result(&self, resolver: &str, success: bool, latency_ms: u64, error: Option<&str>);
}

/// Progress observer for the two-phase engine.
pub trait TwoPhaseCallback: Send + Sync {
    /// A phase is starting.
    fn on_phase_change(&self, phase: u8, message: &str);

    /// A candidate finished within `phase`.
    fn on_progress(&self, phase: u8, tested: usize, total: usize, resolver: &str);

    /// A phase finished with `passed` of `total` candidates succeeding.
    fn on_phase_complete(&self, phase: u8, passed: usize, total: usize);

    /// A working resolver was found. Fires at most once per call.
    fn on_resolver_found(&self, resolver: &str, latency_ms: u64);
}

/// Split candidate input on newlines, trimming whitespace and dropping
/// empties and `#` comments.
pub fn parse_candidates(input: &str) -> Vec<String> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Append the default DNS port when the candidate has none.
pub(crate) fn ensure_port(resolver: &str) -> String {
    if resolver.contains(':') {
        resolver.to_string()
    } else {
        format!("{}:53", resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_candidates() {
        let input = "8.8.8.8\n  1.1.1.1:5353  \n\n# commented out\n9.9.9.9\n";
        assert_eq!(
            parse_candidates(input),
            vec!["8.8.8.8", "1.1.1.1:5353", "9.9.9.9"]
        );
    }

    #[test]
    fn test_parse_candidates_empty_input() {
        assert!(parse_candidates("").is_empty());
        assert!(parse_candidates("\n# only a comment\n   \n").is_empty());
    }

    #[test]
    fn test_ensure_port() {
        assert_eq!(ensure_port("8.8.8.8"), "8.8.8.8:53");
        assert_eq!(ensure_port("8.8.8.8:5353"), "8.8.8.8:5353");
    }

    #[test]
    fn test_report_best_skips_failures() {
        let report = ScanReport {
            results: vec![
                ResolverResult {
                    resolver: "a".into(),
                    success: false,
                    latency_ms: 1,
                    error: Some("timeout".into()),
                },
                ResolverResult {
                    resolver: "b".into(),
                    success: true,
                    latency_ms: 30,
                    error: None,
                },
            ],
        };
        assert_eq!(report.best().unwrap().resolver, "b");
        assert_eq!(report.passed(), 1);
    }
}
