//! Tunnel client lifecycle.
//!
//! [`TunnelClient`] owns one session at a time: a pool of carriers, the
//! local SOCKS listener, and the background accept and stats tasks. The
//! state machine is Stopped → Connecting → Connected (or Error), back to
//! Stopped on [`TunnelClient::stop`]. State lives in an atomic so hosts
//! can poll it from any thread; everything else sits behind a mutex.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::carrier::{CarrierFactory, CarrierOptions};
use crate::config::{TransportKind, TunnelConfig};
use crate::discovery::scan::test_resolvers_with_tunnel;
use crate::discovery::{ResolverCallback, ResolverProbe};
use crate::dns::DomainName;
use crate::error::{Error, Result};
use crate::fingerprint::{sample_distribution, Fingerprint};
use crate::keys::PublicKey;
use crate::metrics::TunnelMetrics;
use crate::pool::TunnelPool;
use crate::relay;

/// Query-name framing overhead in bytes: 8 client id + 1 padding length +
/// 3 padding + 1 packet length.
const MTU_FRAMING_OVERHEAD: usize = 13;

/// Smallest effective MTU the carrier can work with.
const MIN_EFFECTIVE_MTU: usize = 80;

/// Cadence of byte-counter reports.
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Tunnel client state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No session; start is allowed
    Stopped = 0,
    /// Start is in progress
    Connecting = 1,
    /// Session is live and serving SOCKS connections
    Connected = 2,
    /// Last start failed; start is allowed again
    Error = 3,
}

impl ClientState {
    /// Numeric code for host bindings.
    pub fn code(self) -> u8 {
        self as u8
    }

    fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Error,
            _ => Self::Stopped,
        }
    }

    fn is_running(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Host-provided status observer.
pub trait StatusCallback: Send + Sync {
    /// A state transition happened; `message` is human-readable.
    fn on_status_change(&self, state: ClientState, message: &str);

    /// Periodic byte counter report, once per second while connected.
    fn on_bytes_transferred(&self, bytes_in: u64, bytes_out: u64);
}

type CallbackSlot = Arc<Mutex<Option<Arc<dyn StatusCallback>>>>;

struct Session {
    pool: Arc<TunnelPool>,
    cancel: CancellationToken,
    local_addr: std::net::SocketAddr,
}

/// A DNS-tunnel SOCKS proxy client.
///
/// At most one session runs per client; concurrent `start` calls race on
/// an atomic guard and all but one fail with [`Error::AlreadyRunning`].
pub struct TunnelClient {
    state: AtomicU8,
    metrics: Arc<TunnelMetrics>,
    callback: CallbackSlot,
    session: Mutex<Option<Session>>,
}

impl Default for TunnelClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelClient {
    /// Create a client in the Stopped state.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ClientState::Stopped.code()),
            metrics: Arc::new(TunnelMetrics::new()),
            callback: Arc::new(Mutex::new(None)),
            session: Mutex::new(None),
        }
    }

    /// Install the status callback.
    pub fn set_callback(&self, callback: Arc<dyn StatusCallback>) {
        *self.callback.lock() = Some(callback);
    }

    /// Current state, readable at any time.
    pub fn state(&self) -> ClientState {
        ClientState::from_code(self.state.load(Ordering::SeqCst))
    }

    /// Total bytes received from upstream this session.
    pub fn bytes_in(&self) -> u64 {
        self.metrics.bytes_in()
    }

    /// Total bytes sent upstream this session.
    pub fn bytes_out(&self) -> u64 {
        self.metrics.bytes_out()
    }

    /// Number of relays currently in flight.
    pub fn active_streams(&self) -> u64 {
        self.metrics.active_streams()
    }

    /// Address the SOCKS listener is bound to, while a session is running.
    ///
    /// Useful when the configuration asked for an ephemeral port.
    pub fn listen_addr(&self) -> Option<std::net::SocketAddr> {
        self.session.lock().as_ref().map(|s| s.local_addr)
    }

    /// Start a session with the given configuration.
    ///
    /// Fails with [`Error::AlreadyRunning`] while a session is connecting
    /// or connected. Any other failure transitions to
    /// [`ClientState::Error`] with a human-readable message and leaves the
    /// client startable again.
    pub async fn start(&self, factory: &dyn CarrierFactory, config: &TunnelConfig) -> Result<()> {
        self.begin_connecting()?;
        self.set_state(ClientState::Connecting, "Connecting...");
        self.start_session(factory, config).await
    }

    /// Probe `candidates` for a working resolver, then start over UDP
    /// transport through the first one found.
    pub async fn start_with_best_resolver(
        &self,
        factory: &dyn CarrierFactory,
        mut config: TunnelConfig,
        candidates: &str,
        probe: Arc<dyn ResolverProbe>,
        callback: Option<Arc<dyn ResolverCallback>>,
    ) -> Result<()> {
        self.begin_connecting()?;
        self.set_state(ClientState::Connecting, "Testing resolvers...");

        let found = test_resolvers_with_tunnel(
            probe,
            candidates,
            &config.domain,
            &config.pubkey_hex,
            Duration::from_secs(3),
            50,
            callback,
        )
        .await;
        let resolver = match found {
            Some(resolver) => resolver,
            None => {
                self.set_state(ClientState::Error, "No working resolver found");
                return Err(Error::probe("no working resolver found"));
            }
        };

        self.set_state(
            ClientState::Connecting,
            &format!("Connecting via {}...", resolver),
        );
        config.transport = TransportKind::Udp;
        config.transport_addr = resolver;
        self.start_session(factory, &config).await
    }

    /// Stop the running session. Idempotent.
    pub fn stop(&self) {
        let session = self.session.lock().take();
        if session.is_none() && self.state() == ClientState::Stopped {
            return;
        }
        if let Some(session) = session {
            session.cancel.cancel();
            session.pool.close();
        }
        self.set_state(ClientState::Stopped, "Stopped");
    }

    /// Win the Stopped/Error → Connecting race or report a running session.
    fn begin_connecting(&self) -> Result<()> {
        loop {
            let current = self.state();
            if current.is_running() {
                return Err(Error::AlreadyRunning);
            }
            if self
                .state
                .compare_exchange(
                    current.code(),
                    ClientState::Connecting.code(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Steps 3–10 of session startup. The caller has already transitioned
    /// to Connecting.
    async fn start_session(
        &self,
        factory: &dyn CarrierFactory,
        config: &TunnelConfig,
    ) -> Result<()> {
        let pubkey = match PublicKey::from_hex(&config.pubkey_hex) {
            Ok(key) => key,
            Err(e) => return Err(self.fail(format!("Invalid pubkey: {}", e), e)),
        };

        let domain = match DomainName::parse(&config.domain) {
            Ok(domain) => domain,
            Err(e) => return Err(self.fail(format!("Invalid domain: {}", e), e)),
        };

        let fingerprint = match self.pick_fingerprint(config) {
            Ok(fingerprint) => fingerprint,
            Err(e) => return Err(self.fail(format!("Invalid uTLS spec: {}", e), e)),
        };

        // DNS encoding limits the payload per query; the advisory MTU from
        // the config cannot exceed what the domain leaves room for.
        let capacity = domain.capacity();
        if capacity < MTU_FRAMING_OVERHEAD + MIN_EFFECTIVE_MTU {
            let mtu = capacity as i64 - MTU_FRAMING_OVERHEAD as i64;
            let e = Error::config(format!(
                "domain {} leaves only {} bytes for payload",
                config.domain, mtu
            ));
            return Err(self.fail(format!("Domain too long, MTU only {} bytes", mtu), e));
        }
        let mtu = capacity - MTU_FRAMING_OVERHEAD;
        tracing::info!("effective MTU: {} bytes", mtu);

        let options = CarrierOptions {
            fingerprint,
            pubkey,
            domain,
            mtu,
            transport: config.transport,
            transport_addr: config.transport_addr.clone(),
            use_zstd: config.use_zstd,
            num_parallel: config.clamped_parallel(),
        };
        if options.use_zstd {
            tracing::info!("zstd compression enabled");
        }

        let pool = Arc::new(TunnelPool::new());
        let tunnels = config.effective_tunnels();
        let mut successes = 0usize;
        tracing::info!(
            "creating {} carriers, transport={} addr={} domain={}",
            tunnels,
            options.transport,
            options.transport_addr,
            config.domain
        );
        for i in 0..tunnels {
            match factory.create(&options).await {
                Ok(carrier) => {
                    pool.add(carrier);
                    successes += 1;
                }
                Err(e) => {
                    tracing::warn!("carrier {}/{} failed: {}", i + 1, tunnels, e);
                }
            }
        }
        if successes == 0 {
            let e = Error::CarrierStartup("failed to create any tunnels".into());
            return Err(self.fail("Failed to create any tunnels".into(), e));
        }

        let listen_addr = config.effective_listen_addr().to_string();
        let listener = match TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                pool.close();
                let e = Error::Listen {
                    addr: listen_addr,
                    source,
                };
                return Err(self.fail(format!("Failed to listen: {}", e), e));
            }
        };

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                pool.close();
                let e = Error::Listen {
                    addr: listen_addr,
                    source,
                };
                return Err(self.fail(format!("Failed to listen: {}", e), e));
            }
        };

        let cancel = CancellationToken::new();
        self.metrics.reset();
        *self.session.lock() = Some(Session {
            pool: Arc::clone(&pool),
            cancel: cancel.clone(),
            local_addr,
        });

        self.set_state(
            ClientState::Connected,
            &format!("Connected with {} tunnels", successes),
        );

        tokio::spawn(relay::accept_loop(
            listener,
            pool,
            Arc::clone(&self.metrics),
            cancel.clone(),
        ));
        tokio::spawn(stats_reporter(
            Arc::clone(&self.metrics),
            Arc::clone(&self.callback),
            cancel,
        ));

        Ok(())
    }

    fn pick_fingerprint(&self, config: &TunnelConfig) -> Result<Option<Fingerprint>> {
        if config.fingerprint_disabled() {
            tracing::info!("using standard TLS (fingerprinting disabled)");
            return Ok(None);
        }
        let fingerprint = sample_distribution(&config.utls_fingerprint)?;
        tracing::info!("sampled TLS fingerprint: {:?}", fingerprint);
        Ok(fingerprint)
    }

    /// Transition to Error with a host-facing message, passing the error
    /// back through for the caller to return.
    fn fail(&self, message: String, error: Error) -> Error {
        self.set_state(ClientState::Error, &message);
        error
    }

    fn set_state(&self, state: ClientState, message: &str) {
        self.state.store(state.code(), Ordering::SeqCst);
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback.on_status_change(state, message);
        }
    }
}

/// Report byte counters once per interval until the session is cancelled.
async fn stats_reporter(
    metrics: Arc<TunnelMetrics>,
    callback: CallbackSlot,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now() + STATS_INTERVAL;
    let mut ticker = tokio::time::interval_at(start, STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let cb = callback.lock().clone();
                if let Some(cb) = cb {
                    let (bytes_in, bytes_out) = metrics.snapshot();
                    cb.on_bytes_transferred(bytes_in, bytes_out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::carrier::{Carrier, CarrierStream};

    struct FailingFactory;

    #[async_trait]
    impl CarrierFactory for FailingFactory {
        async fn create(&self, _options: &CarrierOptions) -> Result<Arc<dyn Carrier>> {
            Err(Error::CarrierStartup("unreachable resolver".into()))
        }
    }

    struct IdleCarrier;

    #[async_trait]
    impl Carrier for IdleCarrier {
        async fn open_stream(&self) -> Result<Box<dyn CarrierStream>> {
            Err(Error::StreamOpen("idle".into()))
        }

        fn close(&self) {}
    }

    struct IdleFactory;

    #[async_trait]
    impl CarrierFactory for IdleFactory {
        async fn create(&self, _options: &CarrierOptions) -> Result<Arc<dyn Carrier>> {
            Ok(Arc::new(IdleCarrier))
        }
    }

    struct RecordingCallback {
        states: Mutex<Vec<(ClientState, String)>>,
    }

    impl RecordingCallback {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(Vec::new()),
            })
        }
    }

    impl StatusCallback for RecordingCallback {
        fn on_status_change(&self, state: ClientState, message: &str) {
            self.states.lock().push((state, message.to_string()));
        }

        fn on_bytes_transferred(&self, _bytes_in: u64, _bytes_out: u64) {}
    }

    fn test_config() -> TunnelConfig {
        TunnelConfig {
            pubkey_hex: "ab".repeat(32),
            domain: "t.example.com".into(),
            listen_addr: "127.0.0.1:0".into(),
            tunnels: 2,
            ..TunnelConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_rejects_bad_pubkey() {
        let client = TunnelClient::new();
        let mut config = test_config();
        config.pubkey_hex = "zz".into();

        let err = client.start(&IdleFactory, &config).await.unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
        assert_eq!(client.state(), ClientState::Error);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_domain() {
        let client = TunnelClient::new();
        let mut config = test_config();
        config.domain = "a..b".into();

        let err = client.start(&IdleFactory, &config).await.unwrap_err();
        assert!(matches!(err, Error::InvalidDomain(_)));
        assert_eq!(client.state(), ClientState::Error);
    }

    #[tokio::test]
    async fn test_start_rejects_overlong_domain() {
        let client = TunnelClient::new();
        let mut config = test_config();
        // A zone this long leaves fewer than 80 payload bytes per query.
        config.domain = format!("{}.{}.{}", "a".repeat(60), "b".repeat(60), "example.com");

        let err = client.start(&IdleFactory, &config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(client.state(), ClientState::Error);
    }

    #[tokio::test]
    async fn test_start_with_no_carriers_fails() {
        let client = TunnelClient::new();
        let callback = RecordingCallback::new();
        client.set_callback(callback.clone());

        let err = client.start(&FailingFactory, &test_config()).await.unwrap_err();
        assert!(matches!(err, Error::CarrierStartup(_)));
        assert_eq!(client.state(), ClientState::Error);

        let states: Vec<ClientState> =
            callback.states.lock().iter().map(|(s, _)| *s).collect();
        assert_eq!(states, vec![ClientState::Connecting, ClientState::Error]);

        // A failed start leaves the client startable.
        assert!(client.start(&IdleFactory, &test_config()).await.is_ok());
        client.stop();
    }

    #[tokio::test]
    async fn test_start_twice_reports_already_running() {
        let client = TunnelClient::new();
        client.start(&IdleFactory, &test_config()).await.unwrap();
        assert_eq!(client.state(), ClientState::Connected);

        let err = client.start(&IdleFactory, &test_config()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning));
        assert_eq!(client.state(), ClientState::Connected);

        client.stop();
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let client = TunnelClient::new();
        let callback = RecordingCallback::new();
        client.set_callback(callback.clone());

        client.start(&IdleFactory, &test_config()).await.unwrap();
        client.stop();
        client.stop();

        let stops = callback
            .states
            .lock()
            .iter()
            .filter(|(s, _)| *s == ClientState::Stopped)
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn test_counters_reset_on_start() {
        let client = TunnelClient::new();
        client.metrics.add_bytes_in(100);
        client.metrics.add_bytes_out(50);

        client.start(&IdleFactory, &test_config()).await.unwrap();
        assert_eq!(client.bytes_in(), 0);
        assert_eq!(client.bytes_out(), 0);
        client.stop();
    }

    #[tokio::test]
    async fn test_connected_message_reports_carrier_count() {
        let client = TunnelClient::new();
        let callback = RecordingCallback::new();
        client.set_callback(callback.clone());

        client.start(&IdleFactory, &test_config()).await.unwrap();
        let connected = callback
            .states
            .lock()
            .iter()
            .find(|(s, _)| *s == ClientState::Connected)
            .map(|(_, m)| m.clone())
            .unwrap();
        assert_eq!(connected, "Connected with 2 tunnels");
        client.stop();
    }
}
