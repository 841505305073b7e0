//! Telemetry subscription server.
//!
//! Subscribers connect over WebSocket, optionally authenticate with the
//! telemetry bearer secret, send one `SubscribeTransfer` or
//! `SubscribeConnection` envelope, and then receive the corresponding
//! event stream with nanosecond Unix timestamps.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use scatter_core::broadcast::Broadcaster;
use scatter_core::error::Result;
use scatter_core::messages::{
    ConnectionEventPayload, Envelope, MsgType, Payload, TransferEventPayload,
};
use scatter_core::stream::{close_with_reason, recv_envelope, send_envelope};
use scatter_core::telemetry::{ConnectionEvent, Publisher, TransferEvent};

use crate::core::TelemetrySink;

/// WebSocket server broadcasting hub telemetry to subscribers.
pub struct TelemetryServer {
    transfer_events: Arc<Broadcaster<TransferEvent>>,
    connection_events: Arc<Broadcaster<ConnectionEvent>>,
    secret: Option<String>,
}

impl TelemetryServer {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            transfer_events: Arc::new(Broadcaster::new()),
            connection_events: Arc::new(Broadcaster::new()),
            secret,
        }
    }

    /// Starts both event broadcasters. Must be called once before serving.
    pub fn start_broadcasting(&self, cancel: CancellationToken) -> Result<()> {
        self.transfer_events.start(cancel.clone())?;
        self.connection_events.start(cancel)
    }

    /// Accepts subscriber connections until the listener fails.
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
        let secret = self.secret.clone();
        let callback =
            |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                if let Some(secret) = &secret {
                    if !bearer_matches(req, secret) {
                        let mut unauthorized = ErrorResponse::new(None);
                        *unauthorized.status_mut() = StatusCode::UNAUTHORIZED;
                        return Err(unauthorized);
                    }
                }
                Ok(resp)
            };

        let ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(subscriber = %peer, error = %e, "telemetry handshake rejected");
                return;
            }
        };

        let span = tracing::error_span!("telemetry", subscriber = %peer);
        self.serve_subscriber(ws).instrument(span).await;
    }

    async fn serve_subscriber(&self, mut ws: WebSocketStream<TcpStream>) {
        let envelope = match recv_envelope(&mut ws).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "failed to receive subscribe request");
                return;
            }
        };

        match envelope.msg_type {
            MsgType::SubscribeTransfer => {
                info!("handling transfer subscribe request");
                self.serve_transfer(ws).await;
            }
            MsgType::SubscribeConnection => {
                info!("handling connection subscribe request");
                self.serve_connection(ws).await;
            }
            other => {
                debug!(msg_type = ?other, "unexpected first frame from subscriber");
                let _ = close_with_reason(
                    &mut ws,
                    CloseCode::Policy,
                    "first frame must be a subscribe request",
                )
                .await;
            }
        }
    }

    async fn serve_transfer(&self, mut ws: WebSocketStream<TcpStream>) {
        let mut subscription = match self.transfer_events.subscribe().await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(error = %e, "failed to subscribe to transfer events");
                return;
            }
        };
        loop {
            let event = match subscription.receive().await {
                Ok(event) => event,
                Err(e) => {
                    debug!(error = %e, "transfer subscription ended");
                    return;
                }
            };
            let envelope = Envelope {
                msg_type: MsgType::TransferEvent,
                payload: Payload::TransferEvent(TransferEventPayload::from(&event)),
            };
            if let Err(e) = send_envelope(&mut ws, &envelope).await {
                debug!(error = %e, "failed to send transfer event");
                subscription.close().await;
                return;
            }
        }
    }

    async fn serve_connection(&self, mut ws: WebSocketStream<TcpStream>) {
        let mut subscription = match self.connection_events.subscribe().await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(error = %e, "failed to subscribe to connection events");
                return;
            }
        };
        loop {
            let event = match subscription.receive().await {
                Ok(event) => event,
                Err(e) => {
                    debug!(error = %e, "connection subscription ended");
                    return;
                }
            };
            let envelope = Envelope {
                msg_type: MsgType::ConnectionEvent,
                payload: Payload::ConnectionEvent(ConnectionEventPayload::from(&event)),
            };
            if let Err(e) = send_envelope(&mut ws, &envelope).await {
                debug!(error = %e, "failed to send connection event");
                subscription.close().await;
                return;
            }
        }
    }
}

impl TelemetrySink for TelemetryServer {
    fn transfer_publisher(&self) -> Arc<dyn Publisher<TransferEvent>> {
        self.transfer_events.clone()
    }

    fn connection_publisher(&self) -> Arc<dyn Publisher<ConnectionEvent>> {
        self.connection_events.clone()
    }
}

fn bearer_matches(req: &Request, secret: &str) -> bool {
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
