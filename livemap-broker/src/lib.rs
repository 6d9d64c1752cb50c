//! In-process publish/subscribe hub.
//!
//! A single dispatch task owns the subscriber set. Subscribing, unsubscribing
//! and publishing are all commands on its inbound channel, so the set is never
//! shared. Fan-out never blocks: each subscriber has a bounded buffer and a
//! full buffer drops the message for that subscriber only.

pub mod error;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

pub use error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Depth of the inbound command channel.
    pub capacity: usize,
    /// Per-subscriber buffer depth.
    pub subscriber_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            subscriber_buffer: 32,
        }
    }
}

type SubscriberId = u64;

enum Command<T> {
    Subscribe {
        id: SubscriberId,
        tx: mpsc::Sender<T>,
        ack: oneshot::Sender<()>,
    },
    Unsubscribe(SubscriberId),
    Publish(T),
}

#[derive(Debug, Default)]
struct Counters {
    next_id: AtomicU64,
    subscribers: AtomicUsize,
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Cloneable handle onto a running broker.
pub struct Broker<T> {
    commands: mpsc::Sender<Command<T>>,
    counters: Arc<Counters>,
    subscriber_buffer: usize,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            counters: self.counters.clone(),
            subscriber_buffer: self.subscriber_buffer,
        }
    }
}

impl<T> std::fmt::Debug for Broker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("subscribers", &self.subscriber_count())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Start a broker. The dispatch task ends when `shutdown` fires or every
/// handle and subscription is dropped; subscribers then see end-of-stream.
pub fn spawn<T>(
    config: BrokerConfig,
    shutdown: broadcast::Receiver<()>,
) -> (Broker<T>, JoinHandle<()>)
where
    T: Clone + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let counters = Arc::new(Counters::default());
    let handle = tokio::spawn(dispatch(rx, counters.clone(), shutdown));
    let broker = Broker {
        commands: tx,
        counters,
        subscriber_buffer: config.subscriber_buffer.max(1),
    };
    (broker, handle)
}

impl<T: Clone + Send + 'static> Broker<T> {
    /// Register a new subscriber. The subscription is live once this returns.
    pub async fn subscribe(&self) -> Result<Subscription<T>, BrokerError> {
        let id = self.counters.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let (ack, acked) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { id, tx, ack })
            .await
            .map_err(|_| BrokerError::Closed)?;
        acked.await.map_err(|_| BrokerError::Closed)?;
        Ok(Subscription {
            id,
            rx,
            commands: self.commands.clone(),
        })
    }

    /// Remove `subscription` from the fan-out set.
    pub async fn unsubscribe(&self, mut subscription: Subscription<T>) {
        subscription.rx.close();
        let _ = self
            .commands
            .send(Command::Unsubscribe(subscription.id))
            .await;
    }

    /// Queue `message` for fan-out. Returns `false` without queueing when
    /// nobody is subscribed or the broker has shut down.
    pub async fn publish(&self, message: T) -> bool {
        if self.subscriber_count() == 0 {
            return false;
        }
        self.commands.send(Command::Publish(message)).await.is_ok()
    }
}

impl<T> Broker<T> {
    pub fn subscriber_count(&self) -> usize {
        self.counters.subscribers.load(Ordering::Acquire)
    }

    /// Messages dropped because a subscriber's buffer was full.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Messages that reached the dispatch task.
    pub fn published(&self) -> u64 {
        self.counters.published.load(Ordering::Relaxed)
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: SubscriberId,
    rx: mpsc::Receiver<T>,
    commands: mpsc::Sender<Command<T>>,
}

impl<T> Subscription<T> {
    /// Next message; `None` once the broker has shut down.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        // Best effort; a closed receiver is pruned on the next publish anyway.
        let _ = self.commands.try_send(Command::Unsubscribe(self.id));
    }
}

async fn dispatch<T: Clone>(
    mut rx: mpsc::Receiver<Command<T>>,
    counters: Arc<Counters>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut subscribers: HashMap<SubscriberId, mpsc::Sender<T>> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Subscribe { id, tx, ack } => {
                        subscribers.insert(id, tx);
                        counters.subscribers.store(subscribers.len(), Ordering::Release);
                        let _ = ack.send(());
                    }
                    Command::Unsubscribe(id) => {
                        subscribers.remove(&id);
                        counters.subscribers.store(subscribers.len(), Ordering::Release);
                    }
                    Command::Publish(message) => {
                        counters.published.fetch_add(1, Ordering::Relaxed);
                        fan_out(&mut subscribers, &counters, message);
                    }
                }
            }
        }
    }

    let remaining = subscribers.len();
    subscribers.clear();
    counters.subscribers.store(0, Ordering::Release);
    tracing::debug!(subscribers = remaining, "broker dispatch stopped");
}

fn fan_out<T: Clone>(
    subscribers: &mut HashMap<SubscriberId, mpsc::Sender<T>>,
    counters: &Counters,
    message: T,
) {
    subscribers.retain(|id, tx| match tx.try_send(message.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(subscriber = id, "subscriber buffer full; message dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
    counters
        .subscribers
        .store(subscribers.len(), Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(buffer: usize) -> (Broker<u32>, broadcast::Sender<()>, JoinHandle<()>) {
        let (shutdown, _) = broadcast::channel(1);
        let (broker, handle) = spawn(
            BrokerConfig {
                capacity: 16,
                subscriber_buffer: buffer,
            },
            shutdown.subscribe(),
        );
        (broker, shutdown, handle)
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let (broker, _shutdown, _handle) = start(4);
        assert!(!broker.publish(1).await);
        assert_eq!(broker.published(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_message() {
        let (broker, _shutdown, _handle) = start(4);
        let mut a = broker.subscribe().await.unwrap();
        let mut b = broker.subscribe().await.unwrap();
        assert_eq!(broker.subscriber_count(), 2);

        assert!(broker.publish(7).await);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn full_buffer_drops_newest_for_that_subscriber_only() {
        let (broker, _shutdown, _handle) = start(1);
        let mut slow = broker.subscribe().await.unwrap();
        let mut fast = broker.subscribe().await.unwrap();

        broker.publish(1).await;
        assert_eq!(fast.recv().await, Some(1));
        broker.publish(2).await;
        assert_eq!(fast.recv().await, Some(2));

        assert_eq!(slow.recv().await, Some(1));
        assert_eq!(broker.dropped(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_and_drop_shrink_the_set() {
        let (broker, _shutdown, _handle) = start(4);
        let a = broker.subscribe().await.unwrap();
        let b = broker.subscribe().await.unwrap();

        broker.unsubscribe(a).await;
        drop(b);
        // Both commands are processed before the subscribe below is acked.
        let _c = broker.subscribe().await.unwrap();
        assert_eq!(broker.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_ends_every_subscription() {
        let (broker, shutdown, handle) = start(4);
        let mut sub = broker.subscribe().await.unwrap();
        shutdown.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(sub.recv().await, None);
        assert_eq!(broker.subscriber_count(), 0);
        assert!(!broker.publish(1).await);
        assert_eq!(broker.subscribe().await.err(), Some(BrokerError::Closed));
    }
}
