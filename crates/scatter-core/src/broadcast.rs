//! Generic single-publisher, many-subscriber event fan-out.
//!
//! A broadcaster is started exactly once; a long-lived task then owns the
//! subscriber set and delivers published events in publication order. A
//! subscriber whose bounded buffer is full has the event dropped so slow
//! consumers never stall publishers or other subscribers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::telemetry::Publisher;

/// Buffer size of the publish mailbox.
const PUBLISH_BUFFER: usize = 10;
/// Buffer size of each subscriber's mailbox.
const SUBSCRIBER_BUFFER: usize = 10;

/// Pub-sub broadcaster for events of type `T`.
pub struct Broadcaster<T> {
    started: AtomicBool,
    next_id: AtomicU64,
    publish_tx: mpsc::Sender<T>,
    subscribe_tx: mpsc::Sender<(u64, mpsc::Sender<T>)>,
    unsubscribe_tx: mpsc::Sender<u64>,
    inbox: Mutex<Option<Inbox<T>>>,
}

struct Inbox<T> {
    publish_rx: mpsc::Receiver<T>,
    subscribe_rx: mpsc::Receiver<(u64, mpsc::Sender<T>)>,
    unsubscribe_rx: mpsc::Receiver<u64>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new() -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_BUFFER);
        let (subscribe_tx, subscribe_rx) = mpsc::channel(PUBLISH_BUFFER);
        let (unsubscribe_tx, unsubscribe_rx) = mpsc::channel(PUBLISH_BUFFER);
        Self {
            started: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            publish_tx,
            subscribe_tx,
            unsubscribe_tx,
            inbox: Mutex::new(Some(Inbox {
                publish_rx,
                subscribe_rx,
                unsubscribe_rx,
            })),
        }
    }

    /// Starts the fan-out task. Fails if called twice. The broadcaster
    /// shuts down, closing every subscription, when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Broadcast("broadcaster is already started".into()));
        }
        let inbox = self
            .inbox
            .lock()
            .expect("inbox lock poisoned")
            .take()
            .expect("inbox consumed before start");
        tokio::spawn(fan_out(inbox, cancel));
        Ok(())
    }

    /// Publishes an event to every active subscriber.
    pub async fn publish(&self, event: T) -> Result<()> {
        self.ensure_started()?;
        self.publish_tx
            .send(event)
            .await
            .map_err(|_| Error::Broadcast("broadcaster is stopped".into()))
    }

    /// Registers a new subscriber.
    pub async fn subscribe(&self) -> Result<Subscription<T>> {
        self.ensure_started()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribe_tx
            .send((id, tx))
            .await
            .map_err(|_| Error::Broadcast("broadcaster is stopped".into()))?;
        Ok(Subscription {
            id,
            rx,
            unsubscribe_tx: self.unsubscribe_tx.clone(),
        })
    }

    fn ensure_started(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::Broadcast("broadcaster is not started".into()));
        }
        Ok(())
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Publisher<T> for Broadcaster<T> {
    async fn publish(&self, event: T) -> Result<()> {
        Broadcaster::publish(self, event).await
    }
}

async fn fan_out<T: Clone + Send + 'static>(mut inbox: Inbox<T>, cancel: CancellationToken) {
    let mut subscribers: Vec<(u64, mpsc::Sender<T>)> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                subscribers.clear();
                return;
            }
            Some(event) = inbox.publish_rx.recv() => {
                subscribers.retain(|(id, tx)| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(subscriber = id, "subscriber buffer full, dropping event");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
            Some((id, tx)) = inbox.subscribe_rx.recv() => {
                subscribers.push((id, tx));
            }
            Some(id) = inbox.unsubscribe_rx.recv() => {
                let before = subscribers.len();
                subscribers.retain(|(sub_id, _)| *sub_id != id);
                if subscribers.len() == before {
                    warn!(subscriber = id, "tried to unsubscribe an unknown subscriber");
                }
            }
            else => return,
        }
    }
}

/// An active subscription handed out by [`Broadcaster::subscribe`].
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    unsubscribe_tx: mpsc::Sender<u64>,
}

impl<T> Subscription<T> {
    /// Blocks until the next event, or fails once the broadcaster shut
    /// down and the buffered events are drained.
    pub async fn receive(&mut self) -> Result<T> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::Broadcast("subscription closed".into()))
    }

    /// Removes the subscriber and releases its buffer.
    pub async fn close(self) {
        let _ = self.unsubscribe_tx.send(self.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn started<T: Clone + Send + 'static>() -> (Broadcaster<T>, CancellationToken) {
        let broadcaster = Broadcaster::new();
        let cancel = CancellationToken::new();
        broadcaster.start(cancel.clone()).unwrap();
        (broadcaster, cancel)
    }

    #[tokio::test]
    async fn delivers_in_publication_order() {
        let (broadcaster, _cancel) = started::<u32>();
        let mut sub = broadcaster.subscribe().await.unwrap();

        for i in 0..5 {
            broadcaster.publish(i).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(sub.receive().await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn operations_require_start() {
        let broadcaster = Broadcaster::<u32>::new();
        assert!(broadcaster.publish(1).await.is_err());
        assert!(broadcaster.subscribe().await.is_err());
    }

    #[tokio::test]
    async fn double_start_fails() {
        let broadcaster = Broadcaster::<u32>::new();
        let cancel = CancellationToken::new();
        broadcaster.start(cancel.clone()).unwrap();
        assert!(broadcaster.start(cancel).is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_excess_events() {
        let (broadcaster, _cancel) = started::<u32>();
        let mut slow = broadcaster.subscribe().await.unwrap();
        let mut fast = broadcaster.subscribe().await.unwrap();

        // The fast subscriber consumes concurrently and sees everything in
        // order; once it has the last event, the fan-out has attempted
        // delivery of all 15 to the slow subscriber as well.
        let fast_task = tokio::spawn(async move {
            for i in 0..15 {
                assert_eq!(fast.receive().await.unwrap(), i);
            }
        });

        // The slow subscriber never receives while 15 events go out; its
        // buffer holds 10, the rest are dropped.
        for i in 0..15 {
            broadcaster.publish(i).await.unwrap();
        }
        fast_task.await.unwrap();

        for i in 0..10 {
            assert_eq!(slow.receive().await.unwrap(), i);
        }
        let pending = tokio::time::timeout(Duration::from_millis(50), slow.receive()).await;
        assert!(pending.is_err(), "events beyond the buffer must be dropped");
    }

    #[tokio::test]
    async fn cancellation_closes_subscriptions() {
        let (broadcaster, cancel) = started::<u32>();
        let mut sub = broadcaster.subscribe().await.unwrap();

        broadcaster.publish(7).await.unwrap();
        assert_eq!(sub.receive().await.unwrap(), 7);

        cancel.cancel();
        assert!(sub.receive().await.is_err());
        // Give the fan-out task a moment to observe the cancellation.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(broadcaster.publish(8).await.is_err());
    }

    #[tokio::test]
    async fn closed_subscription_is_removed() {
        let (broadcaster, _cancel) = started::<u32>();
        let sub = broadcaster.subscribe().await.unwrap();
        let mut other = broadcaster.subscribe().await.unwrap();

        sub.close().await;
        broadcaster.publish(3).await.unwrap();
        assert_eq!(other.receive().await.unwrap(), 3);
    }
}
