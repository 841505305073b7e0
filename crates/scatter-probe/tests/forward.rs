//! Forward-stream protocol tests against a live probe server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use scatter_core::messages::{DialCode, Envelope, MsgType, Payload};
use scatter_core::stream::{recv_envelope, send_envelope};
use scatter_probe::{ForwardServer, ForwardService};

const SECRET: &str = "probe-test-secret";

async fn spawn_probe() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(ForwardServer::new(
        Arc::new(ForwardService::new()),
        SECRET,
    ));
    tokio::spawn(async move {
        let _ = server.run(listener).await;
    });
    addr
}

async fn open_stream(
    addr: SocketAddr,
    secret: &str,
) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let mut request = format!("ws://{addr}/").into_client_request().unwrap();
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("bearer {secret}")).unwrap(),
    );
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

#[tokio::test]
async fn dial_and_transfer_happy_path() {
    // Loopback target that echoes one message back.
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = target.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(&buf[..n]).await.unwrap();
    });

    let probe_addr = spawn_probe().await;
    let mut ws = open_stream(probe_addr, SECRET).await;

    send_envelope(&mut ws, &Envelope::dial(target_addr.to_string()))
        .await
        .unwrap();
    let response = recv_envelope(&mut ws).await.unwrap().unwrap();
    assert_eq!(response.msg_type, MsgType::DialResponse);
    match response.payload {
        Payload::DialResponse(p) => assert_eq!(p.code, DialCode::Unspecified),
        other => panic!("unexpected payload: {other:?}"),
    }

    send_envelope(&mut ws, &Envelope::transfer(b"over the stream".to_vec()))
        .await
        .unwrap();
    let frame = recv_envelope(&mut ws).await.unwrap().unwrap();
    assert_eq!(
        frame.into_transfer_data().unwrap(),
        b"over the stream".to_vec()
    );
}

#[tokio::test]
async fn unreachable_target_reports_code() {
    // Learn a free port, then free it again so the connect is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let probe_addr = spawn_probe().await;
    let mut ws = open_stream(probe_addr, SECRET).await;

    send_envelope(&mut ws, &Envelope::dial(dead_addr.to_string()))
        .await
        .unwrap();
    let response = recv_envelope(&mut ws).await.unwrap().unwrap();
    match response.payload {
        Payload::DialResponse(p) => assert_eq!(p.code, DialCode::HostUnreachable),
        other => panic!("unexpected payload: {other:?}"),
    }
    // The probe ends the stream after a failed dial.
    assert!(recv_envelope(&mut ws).await.unwrap().is_none());
}

#[tokio::test]
async fn resolution_failure_reports_code() {
    let probe_addr = spawn_probe().await;
    let mut ws = open_stream(probe_addr, SECRET).await;

    send_envelope(&mut ws, &Envelope::dial("nope.invalid:80"))
        .await
        .unwrap();
    let response = recv_envelope(&mut ws).await.unwrap().unwrap();
    match response.payload {
        Payload::DialResponse(p) => assert_eq!(p.code, DialCode::FailedToResolveHost),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn first_frame_must_be_a_dial() {
    let probe_addr = spawn_probe().await;
    let mut ws = open_stream(probe_addr, SECRET).await;

    send_envelope(&mut ws, &Envelope::transfer(b"too early".to_vec()))
        .await
        .unwrap();
    // The stream is rejected without a dial response.
    let next = tokio::time::timeout(Duration::from_secs(5), recv_envelope(&mut ws))
        .await
        .expect("probe should end the stream");
    assert!(matches!(next, Ok(None) | Err(_)));
}

#[tokio::test]
async fn empty_destination_is_rejected() {
    let probe_addr = spawn_probe().await;
    let mut ws = open_stream(probe_addr, SECRET).await;

    send_envelope(&mut ws, &Envelope::dial(""))
        .await
        .unwrap();
    let next = tokio::time::timeout(Duration::from_secs(5), recv_envelope(&mut ws))
        .await
        .expect("probe should end the stream");
    assert!(matches!(next, Ok(None) | Err(_)));
}

#[tokio::test]
async fn wrong_secret_is_rejected_at_handshake() {
    let probe_addr = spawn_probe().await;

    let mut request = format!("ws://{probe_addr}/").into_client_request().unwrap();
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str("bearer wrong").unwrap(),
    );
    assert!(connect_async(request).await.is_err());
}

#[tokio::test]
async fn missing_authorization_is_rejected() {
    let probe_addr = spawn_probe().await;
    let request = format!("ws://{probe_addr}/").into_client_request().unwrap();
    assert!(connect_async(request).await.is_err());
}
