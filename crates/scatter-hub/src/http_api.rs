//! HTTP/1.1 forward-proxy front end.
//!
//! Parses proxy requests straight off the accepted TCP stream: CONNECT
//! requests become raw tunnels (the `200 OK` is written only after the
//! probe acknowledged the dial), any other method is re-serialized in
//! origin form and forwarded to the normalized `host:port`. Forwarding
//! failures are translated to minimal HTTP error responses.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use http::{Method, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use scatter_core::conn::{AcceptFn, Conn};
use scatter_core::error::{Error, ForwardError, ForwardErrorKind, Result};
use scatter_core::trace::TraceId;

use crate::core::HubCore;

/// How much data to read for the request head before it's considered invalid.
pub const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Default port appended to plain-HTTP targets without one.
const DEFAULT_HTTP_PORT: u16 = 80;

/// HTTP proxy server over a hub core.
pub struct HttpProxy {
    core: Arc<HubCore>,
}

impl HttpProxy {
    pub fn new(core: Arc<HubCore>) -> Self {
        Self { core }
    }

    /// Accepts client connections until the listener fails. Each request
    /// runs in its own task under a fresh trace-id span.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();
        loop {
            let (stream, peer) = listener.accept().await?;
            let core = self.core.clone();
            let trace_id = TraceId::generate();
            let span = tracing::error_span!("proxy", trace_id = %trace_id, client = %peer);
            let child = cancel.child_token();
            tokio::spawn(
                async move {
                    tokio::select! {
                        _ = child.cancelled() => {}
                        _ = handle_client(core, stream, peer, trace_id) => {}
                    }
                }
                .instrument(span),
            );
        }
    }
}

/// Serves one client connection. Generic over the stream so tests can
/// drive it with in-memory pipes.
pub(crate) async fn handle_client<S>(
    core: Arc<HubCore>,
    stream: S,
    peer: SocketAddr,
    trace_id: TraceId,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let (head, leftover) = match read_head(&mut read_half).await {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "failed to read request head");
            let _ = write_http_error(&mut write_half, StatusCode::BAD_REQUEST).await;
            return;
        }
    };

    if head.method == Method::CONNECT {
        handle_connect(core, head, leftover, read_half, write_half, peer, trace_id).await;
    } else {
        handle_plain(core, head, leftover, read_half, write_half, peer, trace_id).await;
    }
}

/// Parsed request line and headers.
struct RequestHead {
    method: Method,
    target: String,
    headers: http::HeaderMap,
}

/// Reads and parses the header section, returning the head and any bytes
/// that arrived after it.
async fn read_head<R>(reader: &mut R) -> Result<(RequestHead, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if buf.len() >= HEADER_SECTION_MAX_LENGTH {
            return Err(Error::InvalidMessage(
                "request header section too large".into(),
            ));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::InvalidMessage(
                "connection closed before request head".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf) {
            Ok(httparse::Status::Complete(header_len)) => {
                let head = to_request_head(&request)?;
                let leftover = buf[header_len..].to_vec();
                return Ok((head, leftover));
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => {
                return Err(Error::InvalidMessage(format!("invalid HTTP request: {e}")))
            }
        }
    }
}

fn to_request_head(request: &httparse::Request<'_, '_>) -> Result<RequestHead> {
    let method = request
        .method
        .ok_or_else(|| Error::InvalidMessage("missing HTTP method".into()))?
        .parse::<Method>()
        .map_err(|e| Error::InvalidMessage(format!("invalid HTTP method: {e}")))?;
    let target = request
        .path
        .ok_or_else(|| Error::InvalidMessage("missing request target".into()))?
        .to_string();

    let mut headers = http::HeaderMap::new();
    for header in request.headers.iter() {
        let name = http::HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| Error::InvalidMessage(format!("invalid header name: {e}")))?;
        let value = http::HeaderValue::from_bytes(header.value)
            .map_err(|e| Error::InvalidMessage(format!("invalid header value: {e}")))?;
        headers.append(name, value);
    }

    Ok(RequestHead {
        method,
        target,
        headers,
    })
}

type ClientSlot<R, W> = Arc<Mutex<Option<(R, W)>>>;

async fn handle_connect<R, W>(
    core: Arc<HubCore>,
    head: RequestHead,
    leftover: Vec<u8>,
    read_half: R,
    write_half: W,
    peer: SocketAddr,
    trace_id: TraceId,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    info!(target = %head.target, "handling CONNECT request");

    let slot: ClientSlot<R, W> = Arc::new(Mutex::new(Some((read_half, write_half))));
    let accept_slot = slot.clone();
    let accept: AcceptFn = Box::new(move || {
        Box::pin(async move {
            let (read_half, mut write_half) = accept_slot
                .lock()
                .expect("client slot lock poisoned")
                .take()
                .expect("client connection already taken");
            write_half
                .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
                .await
                .map_err(|e| {
                    ForwardError::wrap(
                        ForwardErrorKind::Internal,
                        "failed to write 200 OK to client",
                        e,
                    )
                })?;
            // Bytes that arrived with the request head (e.g. an eager TLS
            // client hello) are replayed ahead of the socket.
            let reader = Cursor::new(leftover).chain(read_half);
            Ok(Conn::from_io("client", reader, write_half))
        })
    });

    let result = core
        .forward(&trace_id, &peer.to_string(), &head.target, accept)
        .await;
    finish(result, slot).await;
}

async fn handle_plain<R, W>(
    core: Arc<HubCore>,
    head: RequestHead,
    leftover: Vec<u8>,
    read_half: R,
    mut write_half: W,
    peer: SocketAddr,
    trace_id: TraceId,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    debug!(target = %head.target, "handling regular request");

    let (target, head_bytes) = match serialize_plain(&head) {
        Ok(parts) => parts,
        Err(e) => {
            warn!(error = %e, "failed to re-serialize request");
            let _ = write_http_error(&mut write_half, StatusCode::BAD_REQUEST).await;
            return;
        }
    };

    // The virtual client connection replays the re-serialized head, then
    // any body bytes that came with it, then the rest of the socket.
    let mut prefix = head_bytes;
    prefix.extend_from_slice(&leftover);

    let slot: ClientSlot<R, W> = Arc::new(Mutex::new(Some((read_half, write_half))));
    let accept_slot = slot.clone();
    let accept: AcceptFn = Box::new(move || {
        Box::pin(async move {
            let (read_half, write_half) = accept_slot
                .lock()
                .expect("client slot lock poisoned")
                .take()
                .expect("client connection already taken");
            let reader = Cursor::new(prefix).chain(read_half);
            Ok(Conn::from_io("client", reader, write_half))
        })
    });

    let result = core
        .forward(&trace_id, &peer.to_string(), &target, accept)
        .await;
    finish(result, slot).await;
}

/// Normalizes the plain-HTTP target and re-serializes the request head in
/// origin form with the Host header preserved and the body stripped.
fn serialize_plain(head: &RequestHead) -> Result<(String, Vec<u8>)> {
    let uri: Option<Uri> = head.target.parse().ok();

    // Prefer the request URI's host, fall back to the Host header.
    let uri_host = uri
        .as_ref()
        .and_then(|u| u.authority())
        .map(|a| a.to_string());
    let header_host = head
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let host = uri_host
        .clone()
        .or_else(|| header_host.clone())
        .ok_or_else(|| Error::InvalidMessage("request has no target host".into()))?;
    let target = ensure_port(&host, DEFAULT_HTTP_PORT);

    let path = uri
        .as_ref()
        .and_then(|u| u.path_and_query())
        .map(|p| p.to_string())
        .filter(|p| p.starts_with('/'))
        .unwrap_or_else(|| "/".to_string());

    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", head.method, path).as_bytes());
    let host_header = header_host.unwrap_or(host);
    out.extend_from_slice(format!("Host: {host_header}\r\n").as_bytes());
    for (name, value) in head.headers.iter() {
        if name == http::header::HOST {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");

    Ok((target, out))
}

/// Appends `:port` when `host` has none. Handles bracketed IPv6 literals.
fn ensure_port(host: &str, port: u16) -> String {
    let has_port = match host.rfind(':') {
        Some(idx) => {
            let suffix = &host[idx + 1..];
            !suffix.is_empty()
                && !suffix.contains(']')
                && suffix.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    };
    if has_port {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

/// Writes the error response when the client connection was never handed
/// to the splice; afterwards the socket is gone and there is nobody to
/// answer.
async fn finish<R, W>(result: std::result::Result<(), ForwardError>, slot: ClientSlot<R, W>)
where
    R: Send,
    W: AsyncWrite + Unpin + Send,
{
    let err = match result {
        Ok(()) => return,
        Err(err) => err,
    };

    let status = match err.kind() {
        ForwardErrorKind::Unknown | ForwardErrorKind::Internal => {
            error!(error = %err, "unknown error when forwarding connection");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ForwardErrorKind::FailedToResolveHost => {
            info!(error = %err, "failed to resolve target host");
            StatusCode::BAD_GATEWAY
        }
        ForwardErrorKind::HostUnreachable => {
            info!(error = %err, "failed to reach target host");
            StatusCode::GATEWAY_TIMEOUT
        }
    };

    let taken = slot.lock().expect("client slot lock poisoned").take();
    if let Some((_read_half, mut write_half)) = taken {
        let _ = write_http_error(&mut write_half, status).await;
    }
}

async fn write_http_error<W>(writer: &mut W, status: StatusCode) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await
}
