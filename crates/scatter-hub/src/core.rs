//! Hub core: probe selection and per-connection lifecycle.
//!
//! Owns the probe pool, picks the next probe round-robin for every
//! accepted request, and wraps each splice with telemetry: an opening and
//! closing [`ConnectionEvent`] plus one [`TransferEvent`] per observed
//! batch, fanned out to every registered telemetry sink.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use scatter_core::conn::{AcceptFn, Dialer};
use scatter_core::duplex::duplex;
use scatter_core::error::{Error, ForwardError, Result};
use scatter_core::telemetry::{instrument, ConnectionEvent, Emit, Publisher, TransferEvent};
use scatter_core::trace::TraceId;

/// A downstream consumer of hub telemetry.
pub trait TelemetrySink {
    fn transfer_publisher(&self) -> Arc<dyn Publisher<TransferEvent>>;
    fn connection_publisher(&self) -> Arc<dyn Publisher<ConnectionEvent>>;
}

/// Publishes every event to all registered publishers, joining errors.
pub struct MultiPublisher<T> {
    publishers: RwLock<Vec<Arc<dyn Publisher<T>>>>,
}

impl<T> MultiPublisher<T> {
    fn new() -> Self {
        Self {
            publishers: RwLock::new(Vec::new()),
        }
    }

    fn register(&self, publisher: Arc<dyn Publisher<T>>) {
        self.publishers
            .write()
            .expect("publisher lock poisoned")
            .push(publisher);
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Publisher<T> for MultiPublisher<T> {
    async fn publish(&self, event: T) -> Result<()> {
        let publishers = self
            .publishers
            .read()
            .expect("publisher lock poisoned")
            .clone();
        let mut failures = Vec::new();
        for publisher in publishers {
            if let Err(e) = publisher.publish(event.clone()).await {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Broadcast(failures.join("; ")))
        }
    }
}

/// Central coordinator for proxied connections.
pub struct HubCore {
    probes: Vec<Arc<dyn Dialer>>,
    cursor: AtomicUsize,
    transfer_events: Arc<MultiPublisher<TransferEvent>>,
    connection_events: Arc<MultiPublisher<ConnectionEvent>>,
}

impl HubCore {
    /// Creates the core over a non-empty probe pool.
    pub fn new(probes: Vec<Arc<dyn Dialer>>) -> Result<Self> {
        if probes.is_empty() {
            return Err(Error::Config("probe pool must not be empty".into()));
        }
        Ok(Self {
            probes,
            cursor: AtomicUsize::new(0),
            transfer_events: Arc::new(MultiPublisher::new()),
            connection_events: Arc::new(MultiPublisher::new()),
        })
    }

    /// Registers an additional telemetry consumer. Intended to be called
    /// during startup wiring, before traffic flows.
    pub fn register_telemetry(&self, sink: &dyn TelemetrySink) {
        self.transfer_events.register(sink.transfer_publisher());
        self.connection_events.register(sink.connection_publisher());
    }

    /// Strict round-robin selection; each call advances the shared cursor
    /// by one, wrapping at pool size.
    fn next_probe(&self) -> (usize, Arc<dyn Dialer>) {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.probes.len();
        (idx, self.probes[idx].clone())
    }

    /// Handles a single proxy request: selects a probe, dials the target,
    /// accepts the client, and relays with accounting.
    pub async fn forward<'a>(
        &self,
        trace_id: &TraceId,
        client_address: &str,
        target: &str,
        accept: AcceptFn<'a>,
    ) -> std::result::Result<(), ForwardError> {
        let (probe_idx, probe) = self.next_probe();
        debug!(probe_idx, "forwarding connection");

        let target_conn = probe.dial(trace_id, target).await?;

        // Accept the client only once the probe acknowledged the dial.
        let client_conn = accept().await?;

        let connection_id = Uuid::new_v4().to_string();
        let opened_at = SystemTime::now();

        if let Err(e) = self
            .connection_events
            .publish(ConnectionEvent {
                connection_id: connection_id.clone(),
                client_address: client_address.to_string(),
                target_address: target.to_string(),
                opened_at,
                closed_at: None,
            })
            .await
        {
            debug!(error = %e, "failed to publish connection open event");
        }

        let emit: Emit = {
            let publisher = self.transfer_events.clone();
            let connection_id = connection_id.clone();
            Arc::new(move |started_at, finished_at, bytes_count| {
                let publisher = publisher.clone();
                let connection_id = connection_id.clone();
                Box::pin(async move {
                    let event = TransferEvent {
                        connection_id,
                        started_at,
                        finished_at,
                        bytes_count,
                    };
                    if let Err(e) = publisher.publish(event).await {
                        debug!(error = %e, "failed to publish transfer event");
                    }
                })
            })
        };

        duplex(
            instrument(target_conn, emit.clone()),
            instrument(client_conn, emit),
        )
        .await;

        if let Err(e) = self
            .connection_events
            .publish(ConnectionEvent {
                connection_id,
                client_address: client_address.to_string(),
                target_address: target.to_string(),
                opened_at,
                closed_at: Some(SystemTime::now()),
            })
            .await
        {
            debug!(error = %e, "failed to publish connection close event");
        }

        info!("connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scatter_core::conn::Conn;
    use scatter_core::error::ForwardErrorKind;
    use std::sync::Mutex as StdMutex;

    /// Dialer that records its calls and hands out loopback pipes.
    struct MockDialer {
        label: &'static str,
        calls: Arc<StdMutex<Vec<&'static str>>>,
        peers: Arc<StdMutex<Vec<Conn>>>,
    }

    impl MockDialer {
        fn new(label: &'static str, calls: Arc<StdMutex<Vec<&'static str>>>) -> Self {
            Self {
                label,
                calls,
                peers: Arc::new(StdMutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(
            &self,
            _trace_id: &TraceId,
            _target: &str,
        ) -> std::result::Result<Conn, ForwardError> {
            self.calls.lock().unwrap().push(self.label);
            let (a, b) = tokio::io::duplex(4096);
            let (ar, aw) = tokio::io::split(a);
            let (br, bw) = tokio::io::split(b);
            self.peers
                .lock()
                .unwrap()
                .push(Conn::from_io("target-peer", br, bw));
            Ok(Conn::from_io("target", ar, aw))
        }
    }

    struct FailingDialer;

    #[async_trait]
    impl Dialer for FailingDialer {
        async fn dial(
            &self,
            _trace_id: &TraceId,
            _target: &str,
        ) -> std::result::Result<Conn, ForwardError> {
            Err(ForwardError::new(
                ForwardErrorKind::FailedToResolveHost,
                "no such host",
            ))
        }
    }

    struct RecordingSink {
        transfers: Arc<RecordingPublisher<TransferEvent>>,
        connections: Arc<RecordingPublisher<ConnectionEvent>>,
    }

    struct RecordingPublisher<T> {
        events: StdMutex<Vec<T>>,
    }

    #[async_trait]
    impl<T: Clone + Send + Sync + 'static> Publisher<T> for RecordingPublisher<T> {
        async fn publish(&self, event: T) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    impl TelemetrySink for RecordingSink {
        fn transfer_publisher(&self) -> Arc<dyn Publisher<TransferEvent>> {
            self.transfers.clone()
        }
        fn connection_publisher(&self) -> Arc<dyn Publisher<ConnectionEvent>> {
            self.connections.clone()
        }
    }

    fn pipe_conn_pair() -> (Conn, Conn) {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Conn::from_io("client", ar, aw),
            Conn::from_io("client-peer", br, bw),
        )
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(HubCore::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn round_robin_over_three_probes() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let probes: Vec<Arc<dyn Dialer>> = vec![
            Arc::new(MockDialer::new("a", calls.clone())),
            Arc::new(MockDialer::new("b", calls.clone())),
            Arc::new(MockDialer::new("c", calls.clone())),
        ];
        let core = HubCore::new(probes).unwrap();
        let trace_id = TraceId::generate();

        for _ in 0..4 {
            let (client, client_peer) = pipe_conn_pair();
            // Close the client side immediately so the splice finishes.
            drop(client_peer);
            let accept: AcceptFn = Box::new(move || Box::pin(async move { Ok(client) }));
            core.forward(&trace_id, "127.0.0.1:1", "example.com:80", accept)
                .await
                .unwrap();
        }

        assert_eq!(*calls.lock().unwrap(), vec!["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn pool_of_one_always_selects_it() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let probes: Vec<Arc<dyn Dialer>> =
            vec![Arc::new(MockDialer::new("only", calls.clone()))];
        let core = HubCore::new(probes).unwrap();
        let trace_id = TraceId::generate();

        for _ in 0..3 {
            let (client, client_peer) = pipe_conn_pair();
            drop(client_peer);
            let accept: AcceptFn = Box::new(move || Box::pin(async move { Ok(client) }));
            core.forward(&trace_id, "127.0.0.1:1", "example.com:80", accept)
                .await
                .unwrap();
        }
        assert_eq!(*calls.lock().unwrap(), vec!["only", "only", "only"]);
    }

    #[tokio::test]
    async fn dial_failure_propagates_without_accepting() {
        let core = HubCore::new(vec![Arc::new(FailingDialer) as Arc<dyn Dialer>]).unwrap();
        let trace_id = TraceId::generate();

        let accepted = Arc::new(StdMutex::new(false));
        let accepted_flag = accepted.clone();
        let accept: AcceptFn = Box::new(move || {
            Box::pin(async move {
                *accepted_flag.lock().unwrap() = true;
                Err(ForwardError::new(ForwardErrorKind::Internal, "unreachable"))
            })
        });

        let err = core
            .forward(&trace_id, "127.0.0.1:1", "nope.invalid:80", accept)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ForwardErrorKind::FailedToResolveHost);
        assert!(!*accepted.lock().unwrap(), "accept must not run on dial failure");
    }

    #[tokio::test]
    async fn telemetry_events_bracket_the_connection() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let dialer = Arc::new(MockDialer::new("a", calls));
        let peers = dialer.peers.clone();
        let core = HubCore::new(vec![dialer as Arc<dyn Dialer>]).unwrap();

        let sink = RecordingSink {
            transfers: Arc::new(RecordingPublisher {
                events: StdMutex::new(Vec::new()),
            }),
            connections: Arc::new(RecordingPublisher {
                events: StdMutex::new(Vec::new()),
            }),
        };
        core.register_telemetry(&sink);

        let trace_id = TraceId::generate();
        let (client, mut client_peer) = pipe_conn_pair();
        let accept: AcceptFn = Box::new(move || Box::pin(async move { Ok(client) }));

        let forward = core.forward(&trace_id, "127.0.0.1:9999", "example.com:80", accept);
        let drive = async {
            client_peer.write_all(b"four").await.unwrap();
            let mut target_peer = loop {
                let taken = peers.lock().unwrap().pop();
                if let Some(conn) = taken {
                    break conn;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            };
            let mut buf = [0u8; 16];
            let n = target_peer.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"four");
            client_peer.close().await.unwrap();
            target_peer.close().await.unwrap();
        };
        let (result, ()) = tokio::join!(forward, drive);
        result.unwrap();

        let connections = sink.connections.events.lock().unwrap();
        assert_eq!(connections.len(), 2);
        assert!(connections[0].closed_at.is_none());
        assert!(connections[1].closed_at.is_some());
        assert_eq!(connections[0].connection_id, connections[1].connection_id);
        assert_eq!(connections[0].client_address, "127.0.0.1:9999");
        assert_eq!(connections[0].target_address, "example.com:80");

        let transfers = sink.transfers.events.lock().unwrap();
        let client_to_target: u64 = transfers
            .iter()
            .map(|t| {
                assert_eq!(t.connection_id, connections[0].connection_id);
                assert!(connections[0].opened_at <= t.finished_at);
                t.bytes_count
            })
            .sum();
        assert_eq!(client_to_target, 4);
    }
}
