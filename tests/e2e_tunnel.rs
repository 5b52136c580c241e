//! End-to-end tunnel scenarios with a stub carrier factory.
//!
//! The stub carrier hands out in-memory duplex streams backed by a
//! scripted upstream SOCKS5 server, so a real TCP client can exercise the
//! whole path: listener → nested handshake → bidirectional copy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;

use dnstun::{
    Carrier, CarrierFactory, CarrierOptions, CarrierStream, ClientState, Error, Result,
    StatusCallback, TunnelClient, TunnelConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// How the scripted upstream behaves after the greeting.
#[derive(Clone)]
enum UpstreamScript {
    /// Accept auth, accept CONNECT, answer the first payload chunk with
    /// `response`.
    Echo { response: Vec<u8> },
    /// Reply `0x05 0x01` to the greeting and hang up.
    RejectAuth,
    /// Accept the CONNECT, then send `response` only after the client
    /// half-closes its sending side.
    RespondAfterEof { response: Vec<u8> },
}

struct StubCarrier {
    script: UpstreamScript,
    received: Arc<Mutex<Vec<u8>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Carrier for StubCarrier {
    async fn open_stream(&self) -> Result<Box<dyn CarrierStream>> {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        tokio::spawn(upstream_server(
            remote,
            self.script.clone(),
            Arc::clone(&self.received),
        ));
        Ok(Box::new(local))
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

async fn upstream_server(
    mut stream: DuplexStream,
    script: UpstreamScript,
    received: Arc<Mutex<Vec<u8>>>,
) {
    // Greeting: VER NMETHODS METHOD
    let mut greeting = [0u8; 3];
    if stream.read_exact(&mut greeting).await.is_err() {
        return;
    }
    assert_eq!(greeting, [0x05, 0x01, 0x00]);

    if let UpstreamScript::RejectAuth = script {
        let _ = stream.write_all(&[0x05, 0x01]).await;
        return;
    }
    if stream.write_all(&[0x05, 0x00]).await.is_err() {
        return;
    }

    // CONNECT request, forwarded verbatim by the relay.
    let mut buf = [0u8; 256];
    let n = match stream.read(&mut buf).await {
        Ok(n) if n > 0 => n,
        _ => return,
    };
    // The relay forwards the CONNECT request bytes untouched.
    assert_eq!(&buf[..n], connect_request().as_slice());
    if stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .is_err()
    {
        return;
    }

    match script {
        UpstreamScript::Echo { response } => {
            let mut responded = false;
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        received.lock().extend_from_slice(&buf[..n]);
                        if !responded {
                            responded = true;
                            if stream.write_all(&response).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        UpstreamScript::RespondAfterEof { response } => {
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received.lock().extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream.write_all(&response).await;
        }
        UpstreamScript::RejectAuth => unreachable!(),
    }
}

struct StubFactory {
    script: UpstreamScript,
    received: Arc<Mutex<Vec<u8>>>,
    closes: Arc<AtomicUsize>,
}

impl StubFactory {
    fn new(script: UpstreamScript) -> Self {
        Self {
            script,
            received: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl CarrierFactory for StubFactory {
    async fn create(&self, _options: &CarrierOptions) -> Result<Arc<dyn Carrier>> {
        Ok(Arc::new(StubCarrier {
            script: self.script.clone(),
            received: Arc::clone(&self.received),
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct AlwaysFailsFactory;

#[async_trait]
impl CarrierFactory for AlwaysFailsFactory {
    async fn create(&self, _options: &CarrierOptions) -> Result<Arc<dyn Carrier>> {
        Err(Error::CarrierStartup("resolver unreachable".into()))
    }
}

struct BytesCallback {
    reports: Mutex<Vec<(u64, u64)>>,
}

impl StatusCallback for BytesCallback {
    fn on_status_change(&self, _state: ClientState, _message: &str) {}

    fn on_bytes_transferred(&self, bytes_in: u64, bytes_out: u64) {
        self.reports.lock().push((bytes_in, bytes_out));
    }
}

fn test_config(tunnels: usize) -> TunnelConfig {
    TunnelConfig {
        pubkey_hex: "ab".repeat(32),
        domain: "t.example.com".into(),
        listen_addr: "127.0.0.1:0".into(),
        tunnels,
        ..TunnelConfig::default()
    }
}

/// CONNECT to "example":80 with ATYP=DOMAIN.
fn connect_request() -> Vec<u8> {
    let mut req = vec![0x05, 0x01, 0x00, 0x03, 0x07];
    req.extend_from_slice(b"example");
    req.extend_from_slice(&80u16.to_be_bytes());
    req
}

async fn socks_handshake(conn: &mut TcpStream) {
    conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);
}

#[tokio::test]
async fn test_happy_path_relays_bytes_verbatim() {
    init_tracing();
    let response = b"HTTP/1.0 200 OK\r\n\r\nhello".to_vec();
    let factory = StubFactory::new(UpstreamScript::Echo {
        response: response.clone(),
    });
    let client = TunnelClient::new();
    let callback = Arc::new(BytesCallback {
        reports: Mutex::new(Vec::new()),
    });
    client.set_callback(callback.clone());

    client.start(&factory, &test_config(4)).await.unwrap();
    assert_eq!(client.state(), ClientState::Connected);
    let addr = client.listen_addr().unwrap();

    let mut conn = TcpStream::connect(addr).await.unwrap();
    socks_handshake(&mut conn).await;

    conn.write_all(&connect_request()).await.unwrap();
    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x05, 0x00]);

    conn.write_all(b"GET /").await.unwrap();
    let mut body = vec![0u8; response.len()];
    conn.read_exact(&mut body).await.unwrap();
    assert_eq!(body, response);

    // The request payload arrived upstream unmodified.
    assert_eq!(factory.received.lock().as_slice(), b"GET /");

    // Within the next tick the stats reporter delivers the totals, and the
    // counters match what actually crossed the relay.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(client.bytes_out(), 5);
    assert_eq!(client.bytes_in(), response.len() as u64);
    let last = *callback.reports.lock().last().expect("no stats report");
    assert_eq!(last, (response.len() as u64, 5));

    client.stop();
    assert_eq!(client.state(), ClientState::Stopped);
    // One close per carrier.
    assert_eq!(factory.closes.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_no_carriers_start_fails() {
    init_tracing();
    let client = TunnelClient::new();
    let err = client
        .start(&AlwaysFailsFactory, &test_config(3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CarrierStartup(_)));
    assert_eq!(client.state(), ClientState::Error);
    assert!(client.listen_addr().is_none());
}

#[tokio::test]
async fn test_unsupported_atyp_gets_exact_reply() {
    init_tracing();
    let factory = StubFactory::new(UpstreamScript::Echo {
        response: b"unused".to_vec(),
    });
    let client = TunnelClient::new();
    client.start(&factory, &test_config(1)).await.unwrap();
    let addr = client.listen_addr().unwrap();

    let mut conn = TcpStream::connect(addr).await.unwrap();
    socks_handshake(&mut conn).await;

    // ATYP 0x02 is not a thing.
    conn.write_all(&[0x05, 0x01, 0x00, 0x02, 1, 2, 3, 4, 0, 80])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    // Connection is closed right after the reply.
    let mut rest = [0u8; 1];
    assert_eq!(conn.read(&mut rest).await.unwrap(), 0);

    assert_eq!(client.bytes_out(), 0);
    // The relay task has exited; its stream guard is released.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.active_streams(), 0);

    client.stop();
}

#[tokio::test]
async fn test_upstream_auth_reject_surfaces_generic_failure() {
    init_tracing();
    let factory = StubFactory::new(UpstreamScript::RejectAuth);
    let client = TunnelClient::new();
    client.start(&factory, &test_config(1)).await.unwrap();
    let addr = client.listen_addr().unwrap();

    let mut conn = TcpStream::connect(addr).await.unwrap();
    socks_handshake(&mut conn).await;

    conn.write_all(&connect_request()).await.unwrap();
    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x05, 0x01]);

    let mut rest = [0u8; 1];
    assert_eq!(conn.read(&mut rest).await.unwrap(), 0);

    client.stop();
}

#[tokio::test]
async fn test_client_eof_does_not_cut_off_response() {
    init_tracing();
    let response = b"late bytes".to_vec();
    let factory = StubFactory::new(UpstreamScript::RespondAfterEof {
        response: response.clone(),
    });
    let client = TunnelClient::new();
    client.start(&factory, &test_config(1)).await.unwrap();
    let addr = client.listen_addr().unwrap();

    let mut conn = TcpStream::connect(addr).await.unwrap();
    socks_handshake(&mut conn).await;

    conn.write_all(&connect_request()).await.unwrap();
    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).await.unwrap();

    conn.write_all(b"PING").await.unwrap();
    // Half-close: we are done sending, but the upstream has not spoken yet.
    conn.shutdown().await.unwrap();

    let mut body = Vec::new();
    conn.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, response);

    client.stop();
}

#[tokio::test]
async fn test_active_streams_tracks_open_relays() {
    init_tracing();
    let factory = StubFactory::new(UpstreamScript::Echo {
        response: b"pong".to_vec(),
    });
    let client = TunnelClient::new();
    client.start(&factory, &test_config(2)).await.unwrap();
    let addr = client.listen_addr().unwrap();

    let mut conn = TcpStream::connect(addr).await.unwrap();
    socks_handshake(&mut conn).await;
    conn.write_all(&connect_request()).await.unwrap();
    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.active_streams(), 1);

    drop(conn);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.active_streams(), 0);

    client.stop();
}
