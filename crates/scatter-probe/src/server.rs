//! Forward-stream server.
//!
//! Accepts WebSocket connections from hubs, authenticates the upgrade
//! request with the shared bearer secret, recovers the propagated trace
//! id, enforces the dial-first protocol, and hands established streams to
//! the forwarding service.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use scatter_core::conn::{AcceptFn, Forwarder};
use scatter_core::error::{ForwardError, ForwardErrorKind, Result};
use scatter_core::messages::{DialCode, Envelope, MsgType, Payload};
use scatter_core::stream::{close_with_reason, recv_envelope, send_envelope, stream_conn};
use scatter_core::trace::{TraceId, TRACE_ID_HEADER};

/// WebSocket server exposing the forward operation to hubs.
pub struct ForwardServer {
    forwarder: Arc<dyn Forwarder>,
    secret: String,
}

impl ForwardServer {
    pub fn new(forwarder: Arc<dyn Forwarder>, secret: impl Into<String>) -> Self {
        Self {
            forwarder,
            secret: secret.into(),
        }
    }

    /// Accepts forward streams until the listener fails. Each connection
    /// is served on its own task.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            let child = cancel.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = child.cancelled() => {}
                    _ = this.handle_conn(stream, peer) => {}
                }
            });
        }
    }

    async fn handle_conn(&self, stream: TcpStream, peer: SocketAddr) {
        let mut trace_header: Option<String> = None;
        let secret = self.secret.clone();
        let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
            if !authorized(req, &secret) {
                let mut unauthorized = ErrorResponse::new(None);
                *unauthorized.status_mut() = StatusCode::UNAUTHORIZED;
                return Err(unauthorized);
            }
            trace_header = req
                .headers()
                .get(TRACE_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            Ok(resp)
        };

        let ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(client = %peer, error = %e, "stream handshake rejected");
                return;
            }
        };

        let trace_id = trace_header.map(TraceId::from).unwrap_or_else(TraceId::generate);
        let span = tracing::error_span!("forward", trace_id = %trace_id, client = %peer);
        self.serve_stream(ws).instrument(span).await;
    }

    async fn serve_stream(&self, mut ws: WebSocketStream<TcpStream>) {
        debug!("handling forward stream");

        let envelope = match recv_envelope(&mut ws).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "failed to receive initial frame");
                return;
            }
        };

        let destination = match (envelope.msg_type, envelope.payload) {
            (MsgType::Dial, Payload::Dial(dial)) => dial.destination,
            _ => {
                warn!("initial frame was not a dial request, rejecting");
                let _ = close_with_reason(
                    &mut ws,
                    CloseCode::Policy,
                    "initial frame must be a dial request",
                )
                .await;
                return;
            }
        };
        if destination.is_empty() {
            let _ = close_with_reason(&mut ws, CloseCode::Policy, "destination cannot be empty")
                .await;
            return;
        }

        // The stream moves into the accept closure on success; the slot
        // lets the failure path reclaim it to send an error response.
        let slot = Arc::new(Mutex::new(Some(ws)));
        let accept_slot = slot.clone();
        let accept: AcceptFn = Box::new(move || {
            Box::pin(async move {
                let mut ws = accept_slot
                    .lock()
                    .expect("stream slot lock poisoned")
                    .take()
                    .expect("forward stream already taken");
                send_envelope(&mut ws, &Envelope::dial_response(DialCode::Unspecified))
                    .await
                    .map_err(|e| {
                        ForwardError::wrap(
                            ForwardErrorKind::Internal,
                            "failed to acknowledge successful dial",
                            e,
                        )
                    })?;
                Ok(stream_conn(ws, "client"))
            })
        });

        match self.forwarder.forward(&destination, accept).await {
            Ok(()) => info!(destination = %destination, "forward stream finished"),
            Err(err) => {
                let code = match err.kind() {
                    ForwardErrorKind::FailedToResolveHost => {
                        info!(destination = %destination, error = %err, "failed to resolve target host");
                        Some(DialCode::FailedToResolveHost)
                    }
                    ForwardErrorKind::HostUnreachable => {
                        info!(destination = %destination, error = %err, "target host unreachable");
                        Some(DialCode::HostUnreachable)
                    }
                    ForwardErrorKind::Internal | ForwardErrorKind::Unknown => {
                        error!(destination = %destination, error = %err, "forwarding failed");
                        None
                    }
                };

                let taken = slot.lock().expect("stream slot lock poisoned").take();
                if let Some(mut ws) = taken {
                    match code {
                        Some(code) => {
                            let _ = send_envelope(&mut ws, &Envelope::dial_response(code)).await;
                            let _ = ws.close(None).await;
                        }
                        None => {
                            let _ = close_with_reason(&mut ws, CloseCode::Error, "internal error")
                                .await;
                        }
                    }
                }
            }
        }
    }
}

/// Validates the `authorization: bearer <secret>` upgrade header.
fn authorized(req: &Request, secret: &str) -> bool {
    let header = match req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
    {
        Some(value) => value,
        None => return false,
    };
    match header.split_once(' ') {
        Some((scheme, token)) => scheme.eq_ignore_ascii_case("bearer") && token == secret,
        None => false,
    }
}
