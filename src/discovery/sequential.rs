//! Sequential resolver discovery.
//!
//! Walks the candidate list in input order and stops at the first
//! candidate that passes both the DNS probe and a full tunnel handshake.
//! No worker pool, no sorting: cheap enough for short curated lists where
//! the caller trusts the ordering.

use std::sync::Arc;
use std::time::Duration;

use crate::dns::DomainName;
use crate::fingerprint::Fingerprint;
use crate::keys::PublicKey;

use super::{ensure_port, parse_candidates, ResolverCallback, ResolverProbe};

const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Return the first candidate that passes both probes, with its port
/// defaulted, or `None`.
///
/// `on_progress` fires per candidate before probing it; `on_result` fires
/// once per completed candidate. The tunnel probe runs only for candidates
/// that passed the DNS probe.
pub async fn find_first_working_resolver(
    probe: Arc<dyn ResolverProbe>,
    candidates: &str,
    domain: &str,
    pubkey_hex: &str,
    timeout: Duration,
    callback: Option<Arc<dyn ResolverCallback>>,
) -> Option<String> {
    let list = parse_candidates(candidates);
    if list.is_empty() {
        tracing::warn!("no resolver candidates provided");
        return None;
    }
    let domain = match DomainName::parse(domain) {
        Ok(domain) => domain,
        Err(e) => {
            tracing::warn!("invalid domain: {}", e);
            return None;
        }
    };
    let pubkey = match PublicKey::from_hex(pubkey_hex) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!("invalid pubkey: {}", e);
            return None;
        }
    };

    let timeout = if timeout < MIN_TIMEOUT {
        FALLBACK_TIMEOUT
    } else {
        timeout
    };

    let total = list.len();
    tracing::info!("walking {} candidates for the first working resolver", total);

    for (i, resolver) in list.iter().enumerate() {
        if let Some(cb) = &callback {
            cb.on_progress(i + 1, total, resolver);
        }

        let outcome = probe.test_dns(resolver, &domain, timeout).await;
        let latency_ms = outcome.latency.as_millis() as u64;
        if !outcome.success {
            tracing::debug!(
                "[{}/{}] {} failed DNS probe: {}",
                i + 1,
                total,
                resolver,
                outcome.error.as_deref().unwrap_or("unknown")
            );
            if let Some(cb) = &callback {
                cb.on_result(resolver, false, 0, outcome.error.as_deref());
            }
            continue;
        }

        let addr = ensure_port(resolver);
        tracing::debug!(
            "[{}/{}] {} passed DNS probe ({}ms), verifying tunnel...",
            i + 1,
            total,
            resolver,
            latency_ms
        );
        match probe
            .test_tunnel(
                &addr,
                &domain,
                &pubkey,
                Some(Fingerprint::Chrome),
                timeout,
            )
            .await
        {
            Ok(()) => {
                tracing::info!("[{}/{}] {} works ({}ms)", i + 1, total, addr, latency_ms);
                if let Some(cb) = &callback {
                    cb.on_result(&addr, true, latency_ms, None);
                }
                return Some(addr);
            }
            Err(e) => {
                tracing::debug!("[{}/{}] {} failed tunnel probe: {}", i + 1, total, resolver, e);
                if let Some(cb) = &callback {
                    cb.on_result(resolver, false, latency_ms, Some(&e.to_string()));
                }
            }
        }
    }

    tracing::info!("no working resolver among {} candidates", total);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::discovery::ProbeOutcome;
    use crate::error::{Error, Result};

    /// Scripted per-candidate behavior: (dns passes, tunnel passes).
    struct WalkProbe {
        script: Vec<(&'static str, bool, bool)>,
        dns_calls: Mutex<Vec<String>>,
        tunnel_calls: Mutex<Vec<String>>,
    }

    impl WalkProbe {
        fn entry(&self, resolver: &str) -> Option<&(&'static str, bool, bool)> {
            let bare = resolver.strip_suffix(":53").unwrap_or(resolver);
            self.script.iter().find(|(name, ..)| *name == bare)
        }
    }

    #[async_trait]
    impl ResolverProbe for WalkProbe {
        async fn test_dns(
            &self,
            resolver: &str,
            _domain: &DomainName,
            _timeout: Duration,
        ) -> ProbeOutcome {
            self.dns_calls.lock().push(resolver.to_string());
            let success = matches!(self.entry(resolver), Some((_, true, _)));
            ProbeOutcome {
                success,
                latency: Duration::from_millis(25),
                error: (!success).then(|| "servfail".to_string()),
            }
        }

        async fn test_tunnel(
            &self,
            resolver: &str,
            _domain: &DomainName,
            _pubkey: &PublicKey,
            fingerprint: Option<Fingerprint>,
            _timeout: Duration,
        ) -> Result<()> {
            assert_eq!(fingerprint, Some(Fingerprint::Chrome));
            self.tunnel_calls.lock().push(resolver.to_string());
            match self.entry(resolver) {
                Some((.., true)) => Ok(()),
                _ => Err(Error::probe("handshake failed")),
            }
        }
    }

    fn pubkey_hex() -> String {
        "12".repeat(32)
    }

    #[tokio::test]
    async fn test_returns_first_full_success_in_order() {
        // A fails DNS, B passes DNS but not tunnel, C passes both, D unused.
        let probe = Arc::new(WalkProbe {
            script: vec![
                ("a", false, false),
                ("b", true, false),
                ("c", true, true),
                ("d", true, true),
            ],
            dns_calls: Mutex::new(Vec::new()),
            tunnel_calls: Mutex::new(Vec::new()),
        });

        let found = find_first_working_resolver(
            Arc::clone(&probe) as Arc<dyn ResolverProbe>,
            "a\nb\nc\nd\n",
            "t.example.com",
            &pubkey_hex(),
            Duration::from_secs(2),
            None,
        )
        .await;

        assert_eq!(found.as_deref(), Some("c:53"));
        assert_eq!(probe.dns_calls.lock().as_slice(), ["a", "b", "c"]);
        // Tunnel probed for B and C but never D.
        assert_eq!(probe.tunnel_calls.lock().as_slice(), ["b:53", "c:53"]);
    }

    #[tokio::test]
    async fn test_exhausted_list_returns_none() {
        let probe = Arc::new(WalkProbe {
            script: vec![("a", true, false), ("b", false, false)],
            dns_calls: Mutex::new(Vec::new()),
            tunnel_calls: Mutex::new(Vec::new()),
        });
        let found = find_first_working_resolver(
            probe,
            "a\nb\n",
            "t.example.com",
            &pubkey_hex(),
            Duration::from_secs(2),
            None,
        )
        .await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_keeps_existing_port() {
        let probe = Arc::new(WalkProbe {
            script: vec![("dns.example:5353", true, true)],
            dns_calls: Mutex::new(Vec::new()),
            tunnel_calls: Mutex::new(Vec::new()),
        });
        let found = find_first_working_resolver(
            probe,
            "dns.example:5353\n",
            "t.example.com",
            &pubkey_hex(),
            Duration::from_secs(2),
            None,
        )
        .await;
        assert_eq!(found.as_deref(), Some("dns.example:5353"));
    }
}
