//! Probe client: the hub side of the forward protocol.
//!
//! Each proxied connection opens one WebSocket stream to the selected
//! probe, carrying the bearer secret and trace id in the upgrade request,
//! then performs the `Dial`/`DialResponse` handshake before the stream is
//! wrapped as the target [`Conn`].

use async_trait::async_trait;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::debug;

use scatter_core::conn::{Conn, Dialer};
use scatter_core::error::{ForwardError, ForwardErrorKind};
use scatter_core::messages::{DialCode, Envelope, MsgType, Payload};
use scatter_core::stream::{recv_envelope, send_envelope, stream_conn};
use scatter_core::trace::{TraceId, TRACE_ID_HEADER};

use crate::config::ProbeEndpoint;

/// Dialer that forwards through one remote probe.
pub struct ProbeClient {
    url: String,
    secret: Option<String>,
}

impl ProbeClient {
    pub fn new(endpoint: &ProbeEndpoint) -> Self {
        let scheme = if endpoint.require_tls { "wss" } else { "ws" };
        Self {
            url: format!("{scheme}://{}/", endpoint.host),
            secret: endpoint.secret.clone(),
        }
    }
}

#[async_trait]
impl Dialer for ProbeClient {
    async fn dial(
        &self,
        trace_id: &TraceId,
        target: &str,
    ) -> Result<Conn, ForwardError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ForwardError::wrap(ForwardErrorKind::Unknown, "invalid probe url", e))?;

        if let Some(secret) = &self.secret {
            let value = HeaderValue::from_str(&format!("bearer {secret}")).map_err(|e| {
                ForwardError::wrap(ForwardErrorKind::Unknown, "invalid probe secret", e)
            })?;
            request.headers_mut().insert("authorization", value);
        }
        let trace_value = HeaderValue::from_str(trace_id.as_str()).map_err(|e| {
            ForwardError::wrap(ForwardErrorKind::Unknown, "invalid trace id", e)
        })?;
        request.headers_mut().insert(TRACE_ID_HEADER, trace_value);

        let (mut ws, _response) = connect_async(request).await.map_err(|e| {
            ForwardError::wrap(ForwardErrorKind::Unknown, "failed to reach probe", e)
        })?;
        debug!(probe = %self.url, "forward stream opened");

        send_envelope(&mut ws, &Envelope::dial(target))
            .await
            .map_err(|e| {
                ForwardError::wrap(ForwardErrorKind::Unknown, "failed to send dial request", e)
            })?;

        let envelope = recv_envelope(&mut ws)
            .await
            .map_err(|e| {
                ForwardError::wrap(
                    ForwardErrorKind::Unknown,
                    "failed to receive dial response",
                    e,
                )
            })?
            .ok_or_else(|| {
                ForwardError::new(
                    ForwardErrorKind::Unknown,
                    "stream closed before dial response",
                )
            })?;

        match (envelope.msg_type, envelope.payload) {
            (MsgType::DialResponse, Payload::DialResponse(response)) => match response.code {
                DialCode::Unspecified => Ok(stream_conn(ws, "target")),
                DialCode::FailedToResolveHost => Err(ForwardError::new(
                    ForwardErrorKind::FailedToResolveHost,
                    "failed to resolve host",
                )),
                DialCode::HostUnreachable => Err(ForwardError::new(
                    ForwardErrorKind::HostUnreachable,
                    "host unreachable",
                )),
            },
            _ => Err(ForwardError::new(
                ForwardErrorKind::Unknown,
                "first probe frame was not a dial response",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_scheme_follows_tls_flag() {
        let plain = ProbeClient::new(&ProbeEndpoint {
            host: "probe-a:8000".into(),
            secret: None,
            require_tls: false,
        });
        assert_eq!(plain.url, "ws://probe-a:8000/");

        let tls = ProbeClient::new(&ProbeEndpoint {
            host: "probe-b:8443".into(),
            secret: Some("s".into()),
            require_tls: true,
        });
        assert_eq!(tls.url, "wss://probe-b:8443/");
    }
}
