//! Breadth scan: probe every candidate resolver with bounded concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};

use crate::dns::DomainName;
use crate::fingerprint::Fingerprint;
use crate::keys::PublicKey;

use super::{
    ensure_port, parse_candidates, ResolverCallback, ResolverProbe, ResolverResult, ScanReport,
};

const DEFAULT_CONCURRENCY: usize = 50;

/// Below this, the timeout is assumed misconfigured and replaced.
const MIN_DNS_TIMEOUT: Duration = Duration::from_millis(500);
const FALLBACK_DNS_TIMEOUT: Duration = Duration::from_millis(2000);

const MIN_TUNNEL_TIMEOUT: Duration = Duration::from_secs(2);
const FALLBACK_TUNNEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunnel verification caps in [`test_resolvers_with_tunnel`].
const MAX_TUNNEL_TESTS: usize = 20;
const MAX_SCAN_LATENCY_MS: u64 = 500;

pub(crate) fn floor_dns_timeout(timeout: Duration) -> Duration {
    if timeout < MIN_DNS_TIMEOUT {
        FALLBACK_DNS_TIMEOUT
    } else {
        timeout
    }
}

pub(crate) fn floor_tunnel_timeout(timeout: Duration) -> Duration {
    if timeout < MIN_TUNNEL_TIMEOUT {
        FALLBACK_TUNNEL_TIMEOUT
    } else {
        timeout
    }
}

/// Probe every candidate and return all results, successful-then-fastest
/// first.
///
/// One probe task per candidate, gated by a semaphore of `concurrency`
/// permits (default 50 when zero). Progress and per-result callbacks fire
/// from worker context with no ordering guarantee across workers. The
/// report always holds exactly one entry per parsed candidate.
pub async fn test_resolvers(
    probe: Arc<dyn ResolverProbe>,
    candidates: &str,
    domain: &str,
    timeout: Duration,
    concurrency: usize,
    callback: Option<Arc<dyn ResolverCallback>>,
) -> ScanReport {
    let list = parse_candidates(candidates);
    if list.is_empty() {
        tracing::warn!("no resolver candidates provided");
        return ScanReport::default();
    }
    let domain = match DomainName::parse(domain) {
        Ok(domain) => Arc::new(domain),
        Err(e) => {
            tracing::warn!("invalid domain: {}", e);
            return ScanReport::default();
        }
    };

    let timeout = floor_dns_timeout(timeout);
    let concurrency = if concurrency < 1 {
        DEFAULT_CONCURRENCY
    } else {
        concurrency
    };

    let total = list.len();
    tracing::info!(
        "testing {} resolvers, concurrency {}, timeout {:?}",
        total,
        concurrency,
        timeout
    );

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let (result_tx, mut result_rx) = mpsc::channel(total);
    let tested = Arc::new(AtomicUsize::new(0));

    for resolver in list {
        let probe = Arc::clone(&probe);
        let semaphore = Arc::clone(&semaphore);
        let domain = Arc::clone(&domain);
        let tested = Arc::clone(&tested);
        let callback = callback.clone();
        let result_tx = result_tx.clone();
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let outcome = probe.test_dns(&resolver, &domain, timeout).await;
            let result = ResolverResult {
                resolver,
                success: outcome.success,
                latency_ms: outcome.latency.as_millis() as u64,
                error: outcome.error,
            };

            let done = tested.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(cb) = &callback {
                cb.on_progress(done, total, &result.resolver);
                cb.on_result(
                    &result.resolver,
                    result.success,
                    result.latency_ms,
                    result.error.as_deref(),
                );
            }
            let _ = result_tx.send(result).await;
        });
    }
    drop(result_tx);

    let mut results = Vec::with_capacity(total);
    while let Some(result) = result_rx.recv().await {
        results.push(result);
    }

    results.sort_by(|a, b| {
        b.success
            .cmp(&a.success)
            .then(a.latency_ms.cmp(&b.latency_ms))
    });

    let report = ScanReport { results };
    tracing::info!(
        "resolver scan complete: {}/{} passed",
        report.passed(),
        total
    );
    report
}

/// Breadth-scan, then verify tunnel connectivity through the fastest
/// survivors.
///
/// Walks the scan winners in latency order, skipping anything slower than
/// 500 ms, and attempts a full tunnel handshake (Chrome fingerprint) on up
/// to 20 of them. Returns the first verified resolver with its port
/// defaulted, or `None`.
pub async fn test_resolvers_with_tunnel(
    probe: Arc<dyn ResolverProbe>,
    candidates: &str,
    domain: &str,
    pubkey_hex: &str,
    timeout: Duration,
    concurrency: usize,
    callback: Option<Arc<dyn ResolverCallback>>,
) -> Option<String> {
    let report = test_resolvers(
        Arc::clone(&probe),
        candidates,
        domain,
        timeout,
        concurrency,
        callback,
    )
    .await;
    if report.is_empty() {
        return None;
    }

    // The scan already validated the domain.
    let domain = DomainName::parse(domain).ok()?;
    let pubkey = match PublicKey::from_hex(pubkey_hex) {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!("invalid pubkey: {}", e);
            return None;
        }
    };

    let tunnel_timeout = floor_tunnel_timeout(timeout);
    let mut tested = 0usize;
    for result in &report.results {
        if tested >= MAX_TUNNEL_TESTS {
            break;
        }
        if !result.success {
            continue;
        }
        if result.latency_ms > MAX_SCAN_LATENCY_MS {
            tracing::debug!(
                "skipping {} (latency {}ms too high)",
                result.resolver,
                result.latency_ms
            );
            continue;
        }

        tested += 1;
        let addr = ensure_port(&result.resolver);
        tracing::debug!("verifying tunnel via {}...", addr);
        match probe
            .test_tunnel(
                &addr,
                &domain,
                &pubkey,
                Some(Fingerprint::Chrome),
                tunnel_timeout,
            )
            .await
        {
            Ok(()) => {
                tracing::info!("tunnel verified via {}", addr);
                return Some(addr);
            }
            Err(e) => {
                tracing::debug!("tunnel test failed for {}: {}", addr, e);
            }
        }
    }

    tracing::info!("no resolver could establish a tunnel connection");
    None
}
