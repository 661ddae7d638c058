use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type SubscriptionId = u64;

/// Receiving end of a subscription. Dropping it disconnects the subscriber;
/// the broadcaster notices on its next delivery attempt.
pub struct Subscription<E> {
    pub id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

/// Fans every event out to all current subscribers.
///
/// Each subscriber has its own unbounded queue, so events reach a given
/// subscriber in the order `broadcast` was called. Delivery is best-effort:
/// a subscriber whose receiver is gone is logged and dropped without
/// affecting anyone else. There is no backpressure, so a subscriber that
/// stops reading accumulates events until it disconnects.
pub struct Broadcaster<E> {
    subscribers: Mutex<BTreeMap<SubscriptionId, mpsc::UnboundedSender<E>>>,
    next_id: AtomicU64,
}

impl<E: Clone> Broadcaster<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<SubscriptionId, mpsc::UnboundedSender<E>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Subscription<E> {
        self.subscribe_with(None)
    }

    /// Subscribes and queues `initial` ahead of any later broadcast.
    pub fn subscribe_with(&self, initial: Option<E>) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(event) = initial {
            // The receiver is still in hand, so this cannot fail.
            let _ = tx.send(event);
        }
        self.table().insert(id, tx);
        debug!(subscriber = id, "Subscriber added");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.table().remove(&id).is_some();
        if removed {
            debug!(subscriber = id, "Subscriber removed");
        }
        removed
    }

    /// Delivers `event` to every subscriber and returns how many accepted it.
    pub fn broadcast(&self, event: E) -> usize {
        let mut table = self.table();
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, tx) in table.iter() {
            match tx.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(subscriber = *id, "Delivery failed, subscriber disconnected");
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            table.remove(&id);
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.table().len()
    }
}

impl<E: Clone> Default for Broadcaster<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let broadcaster = Broadcaster::new();
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        assert_eq!(broadcaster.broadcast("hello".to_string()), 2);
        assert_eq!(first.recv().await.unwrap(), "hello");
        assert_eq!(second.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_fifo_per_subscriber() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe();

        for i in 0..100 {
            broadcaster.broadcast(i);
        }
        for i in 0..100 {
            assert_eq!(sub.recv().await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn test_initial_event_comes_first() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe_with(Some("init"));
        broadcaster.broadcast("update");

        assert_eq!(sub.recv().await.unwrap(), "init");
        assert_eq!(sub.recv().await.unwrap(), "update");
    }

    #[test]
    fn test_dead_subscriber_isolated() {
        let broadcaster = Broadcaster::new();
        let dropped = broadcaster.subscribe();
        let mut alive = broadcaster.subscribe();
        drop(dropped);

        assert_eq!(broadcaster.broadcast(7), 1);
        assert_eq!(alive.try_recv(), Some(7));
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe();

        assert!(broadcaster.unsubscribe(sub.id));
        assert!(!broadcaster.unsubscribe(sub.id));
        assert_eq!(broadcaster.broadcast(1), 0);
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        let broadcaster: Broadcaster<u32> = Broadcaster::new();
        assert_eq!(broadcaster.broadcast(1), 0);
    }
}
