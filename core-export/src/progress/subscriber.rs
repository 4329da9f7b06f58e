//! Bounded per-subscriber delivery queues.
//!
//! Each subscriber owns one `mpsc` queue. Publishing never waits: a full
//! queue loses that notification for that subscriber only, and queues whose
//! receiver was dropped are pruned on the next publish.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::warn;

/// Callback invoked with every item delivered to its queue
pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

pub(crate) struct SubscriberSet<T> {
    senders: Vec<mpsc::Sender<T>>,
}

impl<T: Clone> SubscriberSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            senders: Vec::new(),
        }
    }

    /// Open a new queue and return its receiving end
    pub(crate) fn subscribe(&mut self, capacity: usize) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.senders.push(tx);
        rx
    }

    /// Offer `item` to every queue; returns how many queues were full
    pub(crate) fn publish(&mut self, item: &T) -> u64 {
        let mut dropped = 0;
        self.senders.retain(|tx| match tx.try_send(item.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        dropped
    }

    /// Drop queues whose receiver is gone; returns true when none remain
    pub(crate) fn prune(&mut self) -> bool {
        self.senders.retain(|tx| !tx.is_closed());
        self.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

/// Drain `rx` on a dedicated task, invoking `callback` for each item in order
///
/// A panicking callback is counted in `failures` and the drain continues with
/// the next item.
pub(crate) fn spawn_callback_drain<T>(
    mut rx: mpsc::Receiver<T>,
    callback: Callback<T>,
    failures: Arc<AtomicU64>,
) -> JoinHandle<()>
where
    T: Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let callback = Arc::clone(&callback);
            if catch_unwind(AssertUnwindSafe(move || callback(item))).is_err() {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!("Progress subscriber callback panicked");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_publish_delivers_to_all_queues() {
        let mut set = SubscriberSet::new();
        let mut a = set.subscribe(4);
        let mut b = set.subscribe(4);

        assert_eq!(set.publish(&7u32), 0);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_for_that_subscriber() {
        let mut set = SubscriberSet::new();
        let mut slow = set.subscribe(1);
        let mut fast = set.subscribe(4);

        assert_eq!(set.publish(&1u32), 0);
        assert_eq!(set.publish(&2u32), 1);

        assert_eq!(slow.recv().await, Some(1));
        assert!(slow.try_recv().is_err());
        assert_eq!(fast.recv().await, Some(1));
        assert_eq!(fast.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_closed_queues_are_pruned() {
        let mut set = SubscriberSet::new();
        let rx = set.subscribe(4);
        let kept = set.subscribe(4);
        drop(rx);

        set.publish(&1u32);
        assert_eq!(set.len(), 1);
        assert!(!set.is_empty());

        drop(kept);
        assert!(set.prune());
    }

    #[tokio::test]
    async fn test_callback_drain_survives_panics() {
        let (tx, rx) = mpsc::channel(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(AtomicU64::new(0));

        let sink = Arc::clone(&seen);
        let callback: Callback<u32> = Arc::new(move |value| {
            if value == 2 {
                panic!("subscriber bug");
            }
            sink.lock().unwrap().push(value);
        });

        let handle = spawn_callback_drain(rx, callback, Arc::clone(&failures));
        for value in 1..=3 {
            tx.send(value).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
        assert_eq!(failures.load(Ordering::Relaxed), 1);
    }
}
