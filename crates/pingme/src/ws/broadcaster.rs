//! Bounded broadcast queue and its single delivery worker.

use log::{debug, info};
use pingme_protocol::MessageView;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::registry::ConnectionRegistry;

/// Default number of accepted messages that may wait for fan-out.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 100;

/// The delivery worker has stopped; nothing will fan the message out.
#[derive(Debug, Error)]
#[error("broadcast queue closed")]
pub struct BroadcastError;

/// Producer half of the broadcast queue.
///
/// Cheap to clone. Every clone feeds the same FIFO.
#[derive(Clone)]
pub struct Broadcaster {
    tx: mpsc::Sender<Arc<MessageView>>,
}

impl Broadcaster {
    /// Create a queue of `capacity` slots (at least one) and its worker.
    ///
    /// The worker owns the receiving end, so there is exactly one consumer.
    pub fn new(capacity: usize) -> (Self, DeliveryWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, DeliveryWorker { rx })
    }

    /// Enqueue a message for every connection.
    ///
    /// Waits while the queue is full.
    pub async fn publish(&self, view: Arc<MessageView>) -> Result<(), BroadcastError> {
        self.tx.send(view).await.map_err(|_| BroadcastError)
    }

    /// Free slots right now. Only meaningful as a hint.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer half: drains the queue in order and fans each message out.
pub struct DeliveryWorker {
    rx: mpsc::Receiver<Arc<MessageView>>,
}

impl DeliveryWorker {
    pub fn spawn(self, registry: Arc<ConnectionRegistry>) -> JoinHandle<()> {
        tokio::spawn(self.run(registry))
    }

    /// Run until every [`Broadcaster`] clone is dropped.
    pub async fn run(mut self, registry: Arc<ConnectionRegistry>) {
        info!("Delivery worker started");
        let mut fanned_out: u64 = 0;

        while let Some(view) = self.rx.recv().await {
            let report = registry.for_each(|_, sink| sink.deliver(view.clone()));
            fanned_out += 1;
            debug!(
                "Fanned out {} to {} connections ({} failed, {} pruned)",
                view.id, report.delivered, report.failed, report.pruned
            );
        }

        info!("Delivery worker stopped after {} messages", fanned_out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::registry::ConnectionSink;
    use crate::ws::registry::tests::{RecordingSink, view};
    use std::time::Duration;

    #[tokio::test]
    async fn test_delivers_in_publish_order() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let handle: Arc<dyn ConnectionSink> = sink.clone();
        registry.register(&handle).unwrap();

        let (broadcaster, worker) = Broadcaster::new(DEFAULT_BROADCAST_CAPACITY);
        let task = worker.spawn(registry.clone());

        for i in 0..10 {
            broadcaster.publish(view(&i.to_string())).await.unwrap();
        }
        drop(broadcaster);
        task.await.unwrap();

        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(sink.bodies(), expected);
    }

    #[tokio::test]
    async fn test_publish_waits_when_queue_is_full() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let handle: Arc<dyn ConnectionSink> = sink.clone();
        registry.register(&handle).unwrap();

        let (broadcaster, worker) = Broadcaster::new(DEFAULT_BROADCAST_CAPACITY);
        for i in 0..DEFAULT_BROADCAST_CAPACITY {
            broadcaster.publish(view(&i.to_string())).await.unwrap();
        }
        assert_eq!(broadcaster.available(), 0);

        let extra = broadcaster.clone();
        let blocked = tokio::spawn(async move { extra.publish(view("overflow")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        let task = worker.spawn(registry.clone());
        blocked.await.unwrap().unwrap();
        drop(broadcaster);
        task.await.unwrap();

        let bodies = sink.bodies();
        assert_eq!(bodies.len(), DEFAULT_BROADCAST_CAPACITY + 1);
        assert_eq!(bodies[0], "0");
        assert_eq!(bodies[DEFAULT_BROADCAST_CAPACITY - 1], "99");
        assert_eq!(bodies[DEFAULT_BROADCAST_CAPACITY], "overflow");
    }

    #[tokio::test]
    async fn test_publish_fails_once_worker_is_gone() {
        let (broadcaster, worker) = Broadcaster::new(1);
        drop(worker);
        assert!(broadcaster.publish(view("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let (broadcaster, _worker) = Broadcaster::new(0);
        assert_eq!(broadcaster.available(), 1);
    }
}
