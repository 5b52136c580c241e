//! Two-phase resolver discovery.
//!
//! Phase 1 sweeps the whole candidate list with cheap DNS-only probes
//! through a fixed worker pool, keeping memory bounded when candidates run
//! to the thousands. Phase 2 takes the fastest survivors and attempts real
//! tunnel handshakes, stopping everything the moment one succeeds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dns::DomainName;
use crate::keys::PublicKey;

use super::scan::{floor_dns_timeout, floor_tunnel_timeout};
use super::{ensure_port, parse_candidates, ResolverProbe, TwoPhaseCallback};

/// Tuning knobs for [`find_working_resolver`].
#[derive(Debug, Clone)]
pub struct TwoPhaseConfig {
    /// Phase 1 worker count
    pub phase1_concurrency: usize,
    /// Per-candidate DNS probe timeout, floored at 500 ms
    pub phase1_timeout: Duration,
    /// Phase 2 worker count
    pub phase2_concurrency: usize,
    /// Per-candidate tunnel probe timeout, floored at 2 s
    pub phase2_timeout: Duration,
    /// Cap on candidates carried into phase 2
    pub phase2_max_to_test: usize,
    /// Phase 1 latency bound for phase 2 admission
    pub max_latency_ms: u64,
}

impl Default for TwoPhaseConfig {
    fn default() -> Self {
        Self {
            phase1_concurrency: 100,
            phase1_timeout: Duration::from_secs(2),
            phase2_concurrency: 20,
            phase2_timeout: Duration::from_secs(5),
            phase2_max_to_test: 30,
            max_latency_ms: 500,
        }
    }
}

#[derive(Debug, Clone)]
struct DnsWinner {
    resolver: String,
    latency_ms: u64,
}

/// Find one resolver that can carry the tunnel, or `None`.
///
/// `on_resolver_found` fires at most once per call; cancellation after the
/// first success is cooperative, so phase 2 workers finish at most the
/// probe they already have in flight.
pub async fn find_working_resolver(
    probe: Arc<dyn ResolverProbe>,
    candidates: &str,
    domain: &str,
    pubkey_hex: &str,
    config: &TwoPhaseConfig,
    callback: Option<Arc<dyn TwoPhaseCallback>>,
) -> Option<String> {
    let list = parse_candidates(candidates);
    if list.is_empty() {
        tracing::warn!("no resolver candidates provided");
        return None;
    }
    let domain = match DomainName::parse(domain) {
        Ok(domain) => Arc::new(domain),
        Err(e) => {
            tracing::warn!("invalid domain: {}", e);
            return None;
        }
    };
    let pubkey = match PublicKey::from_hex(pubkey_hex) {
        Ok(key) => Arc::new(key),
        Err(e) => {
            tracing::warn!("invalid pubkey: {}", e);
            return None;
        }
    };

    let total = list.len();
    tracing::info!("two-phase discovery over {} candidates", total);

    let winners = phase1_dns_sweep(
        Arc::clone(&probe),
        list,
        Arc::clone(&domain),
        config,
        callback.clone(),
    )
    .await;
    if winners.is_empty() {
        tracing::info!("no resolvers passed phase 1");
        return None;
    }

    let max_to_test = if config.phase2_max_to_test < 1 {
        30
    } else {
        config.phase2_max_to_test
    };
    let selected = select_phase2_candidates(&winners, config.max_latency_ms, max_to_test);

    phase2_tunnel_verify(probe, selected, domain, pubkey, config, callback).await
}

/// DNS-only sweep over every candidate. Returns successes sorted fastest
/// first and fires the phase 1 callbacks.
async fn phase1_dns_sweep(
    probe: Arc<dyn ResolverProbe>,
    candidates: Vec<String>,
    domain: Arc<DomainName>,
    config: &TwoPhaseConfig,
    callback: Option<Arc<dyn TwoPhaseCallback>>,
) -> Vec<DnsWinner> {
    let total = candidates.len();
    if let Some(cb) = &callback {
        cb.on_phase_change(1, &format!("Phase 1: Testing {} DNS resolvers...", total));
    }

    let timeout = floor_dns_timeout(config.phase1_timeout);
    let workers = if config.phase1_concurrency < 1 {
        500
    } else {
        config.phase1_concurrency
    };

    // Bounded work channel, pre-filled: the pool pulls from it instead of
    // spawning one task per candidate.
    let (work_tx, work_rx) = mpsc::channel::<String>(total);
    for resolver in candidates {
        let _ = work_tx.try_send(resolver);
    }
    drop(work_tx);
    let work_rx = Arc::new(AsyncMutex::new(work_rx));

    let (result_tx, mut result_rx) = mpsc::channel::<DnsWinner>(total);
    let tested = Arc::new(AtomicUsize::new(0));

    let mut pool = JoinSet::new();
    for _ in 0..workers.min(total) {
        let probe = Arc::clone(&probe);
        let domain = Arc::clone(&domain);
        let work_rx = Arc::clone(&work_rx);
        let result_tx = result_tx.clone();
        let tested = Arc::clone(&tested);
        let callback = callback.clone();
        pool.spawn(async move {
            loop {
                let resolver = match work_rx.lock().await.recv().await {
                    Some(resolver) => resolver,
                    None => return,
                };

                let outcome = probe.test_dns(&resolver, &domain, timeout).await;
                let done = tested.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(cb) = &callback {
                    cb.on_progress(1, done, total, &resolver);
                }

                if outcome.success {
                    let _ = result_tx
                        .send(DnsWinner {
                            resolver,
                            latency_ms: outcome.latency.as_millis() as u64,
                        })
                        .await;
                }
            }
        });
    }
    drop(result_tx);

    while pool.join_next().await.is_some() {}

    let mut winners = Vec::new();
    while let Some(winner) = result_rx.recv().await {
        winners.push(winner);
    }
    winners.sort_by(|a, b| a.latency_ms.cmp(&b.latency_ms));

    tracing::info!(
        "phase 1 complete: {}/{} resolvers passed",
        winners.len(),
        total
    );
    if let Some(cb) = &callback {
        cb.on_phase_complete(1, winners.len(), total);
    }
    winners
}

/// Keep winners within the latency bound, capped at `max_to_test`. When
/// the filter admits nothing, fall back to the fastest `max_to_test`
/// regardless of latency, so a slow-but-working list still gets verified.
fn select_phase2_candidates(
    winners: &[DnsWinner],
    max_latency_ms: u64,
    max_to_test: usize,
) -> Vec<DnsWinner> {
    let selected: Vec<DnsWinner> = winners
        .iter()
        .filter(|w| w.latency_ms <= max_latency_ms)
        .take(max_to_test)
        .cloned()
        .collect();
    if !selected.is_empty() {
        return selected;
    }
    winners.iter().take(max_to_test).cloned().collect()
}

/// Attempt real tunnel handshakes over the selected candidates, stopping
/// all workers at the first success.
async fn phase2_tunnel_verify(
    probe: Arc<dyn ResolverProbe>,
    selected: Vec<DnsWinner>,
    domain: Arc<DomainName>,
    pubkey: Arc<PublicKey>,
    config: &TwoPhaseConfig,
    callback: Option<Arc<dyn TwoPhaseCallback>>,
) -> Option<String> {
    let total = selected.len();
    tracing::info!("phase 2: verifying {} fastest resolvers", total);
    if let Some(cb) = &callback {
        cb.on_phase_change(
            2,
            &format!("Phase 2: Verifying {} fastest resolvers...", total),
        );
    }

    let timeout = floor_tunnel_timeout(config.phase2_timeout);
    let workers = if config.phase2_concurrency < 1 {
        30
    } else {
        config.phase2_concurrency
    };

    let cancel = CancellationToken::new();
    let (work_tx, work_rx) = mpsc::channel::<DnsWinner>(total);
    let work_rx = Arc::new(AsyncMutex::new(work_rx));
    // Single-slot: the first success publishes, later ones are dropped.
    let (found_tx, mut found_rx) = mpsc::channel::<String>(1);
    let tested = Arc::new(AtomicUsize::new(0));
    let passed = Arc::new(AtomicUsize::new(0));

    let mut pool = JoinSet::new();
    for _ in 0..workers.min(total) {
        let probe = Arc::clone(&probe);
        let domain = Arc::clone(&domain);
        let pubkey = Arc::clone(&pubkey);
        let work_rx = Arc::clone(&work_rx);
        let found_tx = found_tx.clone();
        let cancel = cancel.clone();
        let tested = Arc::clone(&tested);
        let passed = Arc::clone(&passed);
        let callback = callback.clone();
        pool.spawn(async move {
            loop {
                // Biased select: once cancellation is observed, no further
                // work item is picked up.
                let work = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    next = async { work_rx.lock().await.recv().await } => match next {
                        Some(work) => work,
                        None => return,
                    },
                };

                let addr = ensure_port(&work.resolver);
                let done = tested.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(cb) = &callback {
                    cb.on_progress(2, done, total, &work.resolver);
                }

                // Phase 2 probes use plain TLS.
                match probe
                    .test_tunnel(&addr, &domain, &pubkey, None, timeout)
                    .await
                {
                    Ok(()) => {
                        passed.fetch_add(1, Ordering::SeqCst);
                        tracing::info!(
                            "found working resolver {} (latency {}ms)",
                            addr,
                            work.latency_ms
                        );
                        if found_tx.try_send(addr.clone()).is_ok() {
                            // First to publish stops the rest.
                            cancel.cancel();
                            if let Some(cb) = &callback {
                                cb.on_resolver_found(&addr, work.latency_ms);
                            }
                        }
                        return;
                    }
                    Err(e) => {
                        tracing::debug!("tunnel test failed for {}: {}", addr, e);
                    }
                }
            }
        });
    }
    drop(found_tx);

    // Feeder: abandon the rest of the list once a worker cancels.
    let feeder_cancel = cancel.clone();
    tokio::spawn(async move {
        for work in selected {
            tokio::select! {
                _ = feeder_cancel.cancelled() => break,
                sent = work_tx.send(work) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while pool.join_next().await.is_some() {}

    let found = found_rx.recv().await;
    if let Some(cb) = &callback {
        cb.on_phase_complete(2, passed.load(Ordering::SeqCst), total);
    }
    if found.is_none() {
        tracing::info!("no working resolver found after two-phase discovery");
    }
    found
}
