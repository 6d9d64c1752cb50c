//! Change feeds.

use tokio::sync::broadcast::{self, error::RecvError};

/// One applied mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent<T> {
    Put { key: String, value: T },
    Delete { key: String, old: T },
}

impl<T> StoreEvent<T> {
    pub fn key(&self) -> &str {
        match self {
            StoreEvent::Put { key, .. } | StoreEvent::Delete { key, .. } => key,
        }
    }
}

/// Receiving end of a store's change feed, optionally narrowed to one key.
pub struct Watcher<T> {
    bucket: String,
    key: Option<String>,
    rx: broadcast::Receiver<StoreEvent<T>>,
}

impl<T: Clone> Watcher<T> {
    pub(crate) fn new(
        bucket: String,
        key: Option<String>,
        rx: broadcast::Receiver<StoreEvent<T>>,
    ) -> Self {
        Self { bucket, key, rx }
    }

    /// Next matching event; `None` once the store is dropped.
    ///
    /// A watcher that falls behind skips what it missed and keeps going.
    pub async fn recv(&mut self) -> Option<StoreEvent<T>> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        bucket = %self.bucket,
                        skipped,
                        "store watcher lagged; events dropped",
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &StoreEvent<T>) -> bool {
        self.key.as_deref().map_or(true, |key| event.key() == key)
    }
}
