//! Telemetry event records and the metering connection wrapper.
//!
//! Two immutable record shapes describe traffic: [`ConnectionEvent`]
//! (emitted on open and on close of each proxied connection) and
//! [`TransferEvent`] (one per observed transfer batch). The metering
//! wrapper instruments a [`Conn`]'s write side so every batch that reaches
//! a destination is observed exactly once per direction.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::conn::{Conn, ConnWriter, COPY_BATCH_SIZE};
use crate::error::Result;
use crate::messages::{ConnectionEventPayload, TransferEventPayload};

/// Lifecycle of a single proxied connection.
///
/// Emitted twice: once on open with `closed_at = None`, once on close with
/// both timestamps populated.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub connection_id: String,
    pub client_address: String,
    pub target_address: String,
    pub opened_at: SystemTime,
    pub closed_at: Option<SystemTime>,
}

/// One data transfer batch within a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub connection_id: String,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub bytes_count: u64,
}

/// Publishes events of type `T` to all interested subscribers.
#[async_trait]
pub trait Publisher<T>: Send + Sync {
    async fn publish(&self, event: T) -> Result<()>;
}

/// Nanosecond Unix timestamp for the wire encoding.
pub fn unix_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl From<&ConnectionEvent> for ConnectionEventPayload {
    fn from(event: &ConnectionEvent) -> Self {
        Self {
            connection_id: event.connection_id.clone(),
            client_address: event.client_address.clone(),
            target_address: event.target_address.clone(),
            opened_at: unix_nanos(event.opened_at),
            closed_at: event.closed_at.map(unix_nanos).unwrap_or(0),
        }
    }
}

impl From<&TransferEvent> for TransferEventPayload {
    fn from(event: &TransferEvent) -> Self {
        Self {
            connection_id: event.connection_id.clone(),
            started_at: unix_nanos(event.started_at),
            finished_at: unix_nanos(event.finished_at),
            bytes_count: event.bytes_count,
        }
    }
}

/// Callback invoked once per metered batch with its start time, finish
/// time, and byte count.
pub type Emit = Arc<dyn Fn(SystemTime, SystemTime, u64) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps a [`Conn`] so each write batch is reported through `emit`.
///
/// Only the write side is metered: in a duplex splice both connections are
/// wrapped, so every copied batch lands in exactly one metered writer per
/// direction.
pub fn instrument(conn: Conn, emit: Emit) -> Conn {
    let (name, reader, writer) = conn.into_parts();
    Conn::new(
        name,
        reader,
        Box::new(MeterWriter {
            inner: writer,
            emit,
        }),
    )
}

struct MeterWriter {
    inner: Box<dyn ConnWriter>,
    emit: Emit,
}

#[async_trait]
impl ConnWriter for MeterWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return self.inner.write(buf).await;
        }
        for chunk in buf.chunks(COPY_BATCH_SIZE) {
            let started_at = SystemTime::now();
            self.inner.write_all(chunk).await?;
            let finished_at = SystemTime::now();
            (self.emit)(started_at, finished_at, chunk.len() as u64).await;
        }
        Ok(buf.len())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn pipe_pair() -> (Conn, Conn) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Conn::from_io("left", ar, aw), Conn::from_io("right", br, bw))
    }

    fn recording_emit() -> (Emit, Arc<Mutex<Vec<u64>>>) {
        let batches: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = batches.clone();
        let emit: Emit = Arc::new(move |started, finished, n| {
            let recorded = recorded.clone();
            Box::pin(async move {
                assert!(started <= finished);
                recorded.lock().unwrap().push(n);
            })
        });
        (emit, batches)
    }

    #[tokio::test]
    async fn emits_once_per_write_batch() {
        let (left, mut right) = pipe_pair();
        let (emit, batches) = recording_emit();
        let mut metered = instrument(left, emit);

        metered.write_all(b"hello").await.unwrap();
        metered.write_all(b"world!").await.unwrap();

        let mut buf = [0u8; 32];
        let mut got = Vec::new();
        while got.len() < 11 {
            let n = right.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got, b"helloworld!");
        assert_eq!(*batches.lock().unwrap(), vec![5, 6]);
    }

    #[tokio::test]
    async fn large_writes_are_batched() {
        let (left, mut right) = pipe_pair();
        let (emit, batches) = recording_emit();
        let mut metered = instrument(left, emit);

        let payload = vec![1u8; COPY_BATCH_SIZE + 17];
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            let mut total = 0usize;
            while total < COPY_BATCH_SIZE + 17 {
                let n = right.read(&mut buf).await.unwrap();
                total += n;
            }
            total
        });

        metered.write_all(&payload).await.unwrap();
        let total = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(total, COPY_BATCH_SIZE + 17);
        assert_eq!(
            *batches.lock().unwrap(),
            vec![COPY_BATCH_SIZE as u64, 17u64]
        );
    }

    #[test]
    fn nanos_conversion() {
        let t = UNIX_EPOCH + Duration::from_nanos(1_234_567_890);
        assert_eq!(unix_nanos(t), 1_234_567_890);
    }

    #[test]
    fn open_event_encodes_zero_closed_at() {
        let event = ConnectionEvent {
            connection_id: "abc".into(),
            client_address: "127.0.0.1:9999".into(),
            target_address: "example.com:443".into(),
            opened_at: UNIX_EPOCH + Duration::from_secs(100),
            closed_at: None,
        };
        let payload = ConnectionEventPayload::from(&event);
        assert_eq!(payload.closed_at, 0);
        assert_eq!(payload.opened_at, 100_000_000_000);
    }
}
