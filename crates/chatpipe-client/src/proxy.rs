//! Local HTTP/CONNECT proxy front-end.
//!
//! Accepts browser connections on a local bind, reads the request head,
//! and bridges each connection onto a tunnel stream:
//!
//! 1. `CONNECT host:port` opens a stream, answers
//!    `200 Connection established`, and pumps the raw bytes (TLS included)
//!    in both directions.
//! 2. Any other method derives the origin from the absolute-form request
//!    target or the `Host` header, re-emits the request line in origin
//!    form with the header lines unchanged, and pumps.
//!
//! Malformed heads get `400 Bad Request`; a stream that cannot be opened
//! gets `500 Internal Server Error`. Each connection runs in its own task
//! so a slow origin never blocks the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use chatpipe_core::pipe::PipeReader;
use chatpipe_core::transport::MessageChannel;

use crate::engine::{StreamWriter, TunnelClient};

/// Upper bound on a request head before it counts as malformed.
const MAX_HEAD_BYTES: usize = 32 * 1024;

/// Chunk size for the bidirectional copiers.
const COPY_CHUNK: usize = 4096;

/// Errors that prevent the proxy from starting.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind proxy listener: {0}")]
    Bind(std::io::Error),
}

/// The local proxy listener.
pub struct ProxyServer<C: MessageChannel> {
    listener: TcpListener,
    local_addr: SocketAddr,
    tunnel: Arc<TunnelClient<C>>,
}

impl<C: MessageChannel> ProxyServer<C> {
    /// Binds the proxy to `addr` (e.g. `127.0.0.1:8888`; port `0` asks the
    /// OS for a free one).
    pub async fn bind(addr: &str, tunnel: Arc<TunnelClient<C>>) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await.map_err(ProxyError::Bind)?;
        let local_addr = listener.local_addr().map_err(ProxyError::Bind)?;
        info!(addr = %local_addr, "HTTP proxy listening");
        Ok(Self {
            listener,
            local_addr,
            tunnel,
        })
    }

    /// The address the proxy actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever, one task per browser connection.
    pub async fn accept_loop(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "accepted proxy connection");
                    let tunnel = self.tunnel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, tunnel).await {
                            debug!(peer = %peer, error = %e, "proxy connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept proxy connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// A parsed request head.
struct RequestHead {
    /// The request line, e.g. `GET http://example.com/ HTTP/1.1`.
    line: String,
    /// Header lines exactly as received, without their CRLFs.
    headers: Vec<String>,
    /// Bytes read past the blank line (pipelined body or TLS hello).
    leftover: Bytes,
}

enum HeadOutcome {
    Complete(RequestHead),
    Malformed,
    ClosedEarly,
}

async fn handle_connection<C: MessageChannel>(
    mut client: TcpStream,
    tunnel: Arc<TunnelClient<C>>,
) -> std::io::Result<()> {
    let head = match read_head(&mut client).await? {
        HeadOutcome::Complete(head) => head,
        HeadOutcome::Malformed => return respond(&mut client, "400 Bad Request").await,
        HeadOutcome::ClosedEarly => return Ok(()),
    };

    let mut parts = head.line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return respond(&mut client, "400 Bad Request").await;
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        let Some((host, port)) = split_host_port(target, 443) else {
            return respond(&mut client, "400 Bad Request").await;
        };
        debug!(host, port, "CONNECT tunnel requested");
        let (reader, mut writer) = match tunnel.open_stream(&host, port).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(host, port, error = %e, "failed to open tunnel stream");
                return respond(&mut client, "500 Internal Server Error").await;
            }
        };
        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
        client.flush().await?;

        // TLS bytes the browser sent without waiting for our 200.
        if !head.leftover.is_empty() {
            let _ = writer.write(&head.leftover).await;
            let _ = writer.flush().await;
        }
        pump(client, reader, writer).await;
        return Ok(());
    }

    let Some(target) = derive_target(target, &head.headers) else {
        return respond(&mut client, "400 Bad Request").await;
    };
    debug!(method, host = %target.host, port = target.port, "forwarding HTTP request");

    let (reader, mut writer) = match tunnel.open_stream(&target.host, target.port).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(host = %target.host, port = target.port, error = %e, "failed to open tunnel stream");
            return respond(&mut client, "500 Internal Server Error").await;
        }
    };

    // Re-emit the request line in origin form, headers untouched.
    let mut request = format!("{method} {} {version}\r\n", target.origin_form);
    for line in &head.headers {
        request.push_str(line);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    if writer.write(request.as_bytes()).await.is_err()
        || writer.write(&head.leftover).await.is_err()
        || writer.flush().await.is_err()
    {
        return respond(&mut client, "500 Internal Server Error").await;
    }

    pump(client, reader, writer).await;
    Ok(())
}

/// Reads the request head (request line plus headers up to the blank line)
/// without consuming any bytes past it.
async fn read_head(client: &mut TcpStream) -> std::io::Result<HeadOutcome> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = buf.split_to(end + 4);
            let leftover = buf.freeze();
            let Ok(text) = std::str::from_utf8(&head) else {
                return Ok(HeadOutcome::Malformed);
            };
            let mut lines = text.split("\r\n");
            let Some(line) = lines.next().map(str::to_string) else {
                return Ok(HeadOutcome::Malformed);
            };
            if line.is_empty() {
                return Ok(HeadOutcome::Malformed);
            }
            let headers = lines
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            return Ok(HeadOutcome::Complete(RequestHead {
                line,
                headers,
                leftover,
            }));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Ok(HeadOutcome::Malformed);
        }
        if client.read_buf(&mut buf).await? == 0 {
            return Ok(HeadOutcome::ClosedEarly);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// The origin a plain HTTP request should be tunneled to.
struct HttpTarget {
    host: String,
    port: u16,
    /// The request target rewritten for the origin (path plus query).
    origin_form: String,
}

fn derive_target(target: &str, headers: &[String]) -> Option<HttpTarget> {
    if let Some(rest) = target.strip_prefix("http://") {
        let (authority, path) = split_authority(rest);
        let (host, port) = split_host_port(authority, 80)?;
        return Some(HttpTarget {
            host,
            port,
            origin_form: path,
        });
    }
    if let Some(rest) = target.strip_prefix("https://") {
        let (authority, path) = split_authority(rest);
        let (host, port) = split_host_port(authority, 443)?;
        return Some(HttpTarget {
            host,
            port,
            origin_form: path,
        });
    }

    // Origin-form target: the host comes from the Host header.
    let host_header = headers.iter().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("host")
            .then(|| value.trim().to_string())
    })?;
    let (host, port) = split_host_port(&host_header, 80)?;
    Some(HttpTarget {
        host,
        port,
        origin_form: target.to_string(),
    })
}

fn split_authority(rest: &str) -> (&str, String) {
    match rest.find('/') {
        Some(at) => (&rest[..at], rest[at..].to_string()),
        None => (rest, "/".to_string()),
    }
}

fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            port.parse().ok().map(|port| (host.to_string(), port))
        }
        Some(_) => None,
        None => Some((authority.to_string(), default_port)),
    }
}

/// Two concurrent copiers bridging the browser socket and the stream.
/// The first side to hit end-of-stream closes the other gracefully: the
/// stream writer emits its final flush and `CLOSE`, the client half gets a
/// TCP shutdown.
async fn pump<C: MessageChannel>(
    client: TcpStream,
    mut reader: PipeReader,
    mut writer: StreamWriter<C>,
) {
    let (mut client_read, mut client_write) = client.into_split();

    let to_origin = async move {
        let mut chunk = [0u8; COPY_CHUNK];
        loop {
            match client_read.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.write(&chunk[..n]).await.is_err() {
                        break;
                    }
                    if writer.flush().await.is_err() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = writer.close().await {
            debug!(error = %e, "failed to close tunnel stream");
        }
    };

    let to_client = async move {
        loop {
            let chunk = reader.read(COPY_CHUNK).await;
            if chunk.is_empty() {
                break;
            }
            if client_write.write_all(&chunk).await.is_err() {
                break;
            }
            if client_write.flush().await.is_err() {
                break;
            }
        }
        let _ = client_write.shutdown().await;
    };

    tokio::join!(to_origin, to_client);
}

async fn respond(client: &mut TcpStream, status: &str) -> std::io::Result<()> {
    client
        .write_all(format!("HTTP/1.1 {status}\r\n\r\n").as_bytes())
        .await?;
    client.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
