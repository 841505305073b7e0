//! Stream-as-Conn adapter over a WebSocket forward stream.
//!
//! The forward protocol is message-oriented: every WebSocket binary
//! message carries one CBOR [`Envelope`]. This module bridges that to the
//! byte-stream semantics of [`Conn`]: writes become `Transfer` frames,
//! reads drain a held-back payload and block on at most one frame.
//!
//! Also provides the envelope send/receive helpers both ends use for the
//! `Dial`/`DialResponse` handshake before the stream is wrapped.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use async_trait::async_trait;

use crate::codec;
use crate::conn::{Conn, ConnReader, ConnWriter};
use crate::error::{Error, Result};
use crate::messages::Envelope;

/// Maximum tunnel bytes per `Transfer` frame, leaving headroom for the
/// envelope encoding under [`codec::MAX_FRAME_SIZE`].
pub const MAX_DATA_LEN: usize = codec::MAX_FRAME_SIZE - 1024;

/// Sends one envelope as a binary message.
pub async fn send_envelope<S>(ws: &mut WebSocketStream<S>, env: &Envelope) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = codec::encode(env)?;
    ws.send(Message::Binary(bytes)).await.map_err(ws_to_error)
}

/// Receives the next envelope. `Ok(None)` means the peer closed cleanly.
/// Non-binary messages are skipped.
pub async fn recv_envelope<S>(ws: &mut WebSocketStream<S>) -> Result<Option<Envelope>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            None => return Ok(None),
            Some(Ok(Message::Binary(data))) => return codec::decode(&data).map(Some),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) if is_clean_close(&e) => return Ok(None),
            Some(Err(e)) => return Err(ws_to_error(e)),
        }
    }
}

/// Ends the stream with a close frame carrying a protocol-level reason.
pub async fn close_with_reason<S>(
    ws: &mut WebSocketStream<S>,
    code: CloseCode,
    reason: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    match ws.close(Some(frame)).await {
        Ok(()) => Ok(()),
        Err(e) if is_clean_close(&e) => Ok(()),
        Err(e) => Err(ws_to_error(e)),
    }
}

/// Wraps an established forward stream as a [`Conn`].
///
/// The caller must have completed the `Dial`/`DialResponse` exchange;
/// every subsequent frame in both directions is `Transfer`.
pub fn stream_conn<S>(ws: WebSocketStream<S>, name: impl Into<String>) -> Conn
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = ws.split();
    Conn::new(
        name,
        Box::new(StreamReader {
            ws: source,
            held: Vec::new(),
            offset: 0,
        }),
        Box::new(StreamWriter {
            ws: sink,
            closed: false,
        }),
    )
}

fn ws_to_error(e: WsError) -> Error {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => Error::Closed,
        WsError::Io(io) => Error::Io(io),
        other => Error::Transport(other.to_string()),
    }
}

fn is_clean_close(e: &WsError) -> bool {
    matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

struct StreamReader<S> {
    ws: SplitStream<WebSocketStream<S>>,
    held: Vec<u8>,
    offset: usize,
}

impl<S> StreamReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Receives the next `Transfer` payload. `Ok(None)` is normalized
    /// end of stream (peer close or clean transport shutdown).
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.ws.next().await {
                None => return Ok(None),
                Some(Ok(Message::Binary(data))) => {
                    let env: Envelope = codec::decode(&data)?;
                    match env.into_transfer_data() {
                        Some(data) => return Ok(Some(data)),
                        None => {
                            return Err(Error::InvalidMessage(
                                "expected transfer frame on established stream".into(),
                            ))
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) if is_clean_close(&e) => return Ok(None),
                Some(Err(e)) => return Err(ws_to_error(e)),
            }
        }
    }
}

#[async_trait]
impl<S> ConnReader for StreamReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.offset < self.held.len() {
                let n = buf.len().min(self.held.len() - self.offset);
                buf[..n].copy_from_slice(&self.held[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }
            // Block on exactly one frame; empty payloads carry no data and
            // must not look like end of stream, so keep waiting.
            match self.recv_frame().await? {
                None => return Ok(0),
                Some(data) => {
                    self.held = data;
                    self.offset = 0;
                }
            }
        }
    }

    async fn read_to(&mut self, dst: &mut dyn ConnWriter) -> Result<u64> {
        let mut total = 0u64;
        if self.offset < self.held.len() {
            dst.write_all(&self.held[self.offset..]).await?;
            total += (self.held.len() - self.offset) as u64;
            self.held.clear();
            self.offset = 0;
        }
        loop {
            match self.recv_frame().await? {
                None => return Ok(total),
                Some(data) => {
                    dst.write_all(&data).await?;
                    total += data.len() as u64;
                }
            }
        }
    }
}

struct StreamWriter<S> {
    ws: SplitSink<WebSocketStream<S>, Message>,
    closed: bool,
}

#[async_trait]
impl<S> ConnWriter for StreamWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        for chunk in buf.chunks(MAX_DATA_LEN) {
            let bytes = codec::encode(&Envelope::transfer(chunk.to_vec()))?;
            self.ws
                .send(Message::Binary(bytes))
                .await
                .map_err(ws_to_error)?;
        }
        Ok(buf.len())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.ws.send(Message::Close(None)).await {
            Ok(()) => Ok(()),
            Err(e) if is_clean_close(&e) => Ok(()),
            Err(e) => Err(ws_to_error(e)),
        }
    }
}
