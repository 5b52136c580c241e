//! Local SOCKS5 listener and nested relay.
//!
//! Accepts TCP connections on the local listen address, performs the
//! client-facing SOCKS5 handshake, then repeats the handshake with the
//! upstream SOCKS server through a tunnel stream and pumps bytes both
//! ways. The CONNECT request itself is never interpreted: it is forwarded
//! verbatim, and so is the upstream reply, success or not, so the local
//! client sees the upstream's own result codes.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics::TunnelMetrics;
use crate::pool::TunnelPool;

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

/// VER, NMETHODS=1, METHOD=no-auth.
const UPSTREAM_GREETING: [u8; 3] = [SOCKS_VERSION, 0x01, 0x00];
/// REP=0x08 address type not supported, bound to 0.0.0.0:0.
const REPLY_ADDR_UNSUPPORTED: [u8; 10] = [SOCKS_VERSION, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
/// REP=0x01 general failure, bound to 0.0.0.0:0.
const REPLY_GENERAL_FAILURE: [u8; 10] = [SOCKS_VERSION, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Accept local SOCKS connections until the session is cancelled.
///
/// Each accepted connection gets its own relay task. Accept errors keep
/// the loop running; cancellation ends it and drops the listener.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    pool: Arc<TunnelPool>,
    metrics: Arc<TunnelMetrics>,
    cancel: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    tracing::debug!("SOCKS connection from {}", peer);
                    conn
                }
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                    continue;
                }
            },
        };

        let pool = Arc::clone(&pool);
        let metrics = Arc::clone(&metrics);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _active = metrics.stream_guard();
            if let Err(e) = relay_connection(conn, &pool, &metrics, cancel).await {
                tracing::debug!("relay closed: {}", e);
            }
        });
    }
}

/// Run the nested SOCKS5 protocol machine over one local connection.
pub(crate) async fn relay_connection(
    mut conn: TcpStream,
    pool: &TunnelPool,
    metrics: &TunnelMetrics,
    cancel: CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; 256];

    // Client-facing greeting: version + auth method list in one read.
    let n = conn.read(&mut buf).await?;
    if n < 2 || buf[0] != SOCKS_VERSION {
        return Err(Error::handshake("not SOCKS5"));
    }
    conn.write_all(&[SOCKS_VERSION, 0x00]).await?;

    // Client-facing CONNECT request, also in one read.
    let n = conn.read(&mut buf).await?;
    if n < 4 || buf[0] != SOCKS_VERSION || buf[1] != CMD_CONNECT {
        return Err(Error::handshake("only CONNECT supported"));
    }
    let request_len = match buf[3] {
        // IPv4: header + 4 address bytes + 2 port bytes
        0x01 => 10,
        // Domain: header + length octet + domain + 2 port bytes
        0x03 => 5 + buf[4] as usize + 2,
        // IPv6: header + 16 address bytes + 2 port bytes
        0x04 => 22,
        atyp => {
            let _ = conn.write_all(&REPLY_ADDR_UNSUPPORTED).await;
            return Err(Error::handshake(format!(
                "unsupported address type 0x{:02x}",
                atyp
            )));
        }
    };
    if n < request_len {
        return Err(Error::handshake("truncated CONNECT request"));
    }

    // Borrow a carrier and open a logical stream on it. Failures here are
    // silent: the local client sees only a closed connection.
    let carrier = match pool.get() {
        Some(carrier) => carrier,
        None => return Err(Error::handshake("no live carrier")),
    };
    let mut stream = carrier.open_stream().await?;

    // Upstream greeting through the tunnel.
    let mut auth = [0u8; 2];
    let greeted = async {
        stream.write_all(&UPSTREAM_GREETING).await?;
        stream.read_exact(&mut auth).await?;
        std::io::Result::Ok(())
    }
    .await;
    if greeted.is_err() || auth != [SOCKS_VERSION, 0x00] {
        let _ = conn.write_all(&REPLY_GENERAL_FAILURE).await;
        return Err(Error::handshake("upstream rejected auth"));
    }

    // Forward the CONNECT request verbatim and read the upstream reply.
    if stream.write_all(&buf[..request_len]).await.is_err() {
        let _ = conn.write_all(&REPLY_GENERAL_FAILURE).await;
        return Err(Error::handshake("sending CONNECT upstream"));
    }
    let mut reply = [0u8; 256];
    let reply_len = match stream.read(&mut reply).await {
        Ok(n) if n >= 10 => n,
        _ => {
            let _ = conn.write_all(&REPLY_GENERAL_FAILURE).await;
            return Err(Error::handshake("short CONNECT reply from upstream"));
        }
    };
    if reply[1] != 0x00 {
        tracing::debug!("upstream CONNECT failed with code {}", reply[1]);
    }
    // Forwarded as-is even on failure; the client interprets the code.
    conn.write_all(&reply[..reply_len]).await?;

    // Bidirectional copy. Each direction half-closes its write side when
    // its source reaches EOF, so a client EOF does not cut off response
    // bytes still in flight the other way.
    let (mut local_read, mut local_write) = conn.into_split();
    let (mut upstream_read, mut upstream_write) = tokio::io::split(stream);

    let outbound = async {
        let res = copy_counted(&mut local_read, &mut upstream_write, |n| {
            metrics.add_bytes_out(n)
        })
        .await;
        let _ = upstream_write.shutdown().await;
        res
    };
    let inbound = async {
        let res = copy_counted(&mut upstream_read, &mut local_write, |n| {
            metrics.add_bytes_in(n)
        })
        .await;
        let _ = local_write.shutdown().await;
        res
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = async { let _ = tokio::join!(outbound, inbound); } => {}
    }

    Ok(())
}

/// Copy until EOF, reporting each chunk so the stats reporter sees byte
/// counts grow while the relay is still running.
async fn copy_counted<R, W, F>(reader: &mut R, writer: &mut W, count: F) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: Fn(u64),
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        count(n as u64);
        total += n as u64;
    }
}
