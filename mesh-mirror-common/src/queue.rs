use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use crate::event::Event;

/// An event plus the number of times its handler has already failed.
#[derive(Clone, Debug)]
pub struct QueuedEvent {
    pub event: Event,
    pub attempts: u32,
}

impl QueuedEvent {
    pub fn new(event: Event) -> Self {
        Self { event, attempts: 0 }
    }
}

/// Capability to enqueue events into one cluster's queue. Probe workers
/// and stream pumps hold this, never the queue itself, so probe
/// concurrency stays decoupled from reconciliation ordering.
pub trait EventSink: Send + Sync + 'static {
    fn send(&self, event: Event);
}

/// Creates a single-consumer, FIFO event queue for one cluster watcher.
pub fn event_queue() -> (QueueHandle, EventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = QueueHandle {
        tx,
        closed: Arc::new(AtomicBool::new(false)),
    };
    (handle, EventQueue { rx })
}

/// Sending half of a cluster watcher's queue. Cloneable; once closed,
/// new enqueues are dropped while already-queued work drains.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueuedEvent>,
    closed: Arc<AtomicBool>,
}

impl QueueHandle {
    /// Enqueues at the tail. Returns false if the queue no longer
    /// accepts new work.
    pub fn send(&self, event: Event) -> bool {
        if self.closed.load(Ordering::Acquire) {
            debug!(event = %event, "queue closed, dropping event");
            return false;
        }
        self.tx.send(QueuedEvent::new(event)).is_ok()
    }

    /// Requeues a failed event at the tail. Not gated on the closed
    /// flag: retries of already-accepted work are part of draining.
    pub fn requeue(&self, queued: QueuedEvent) -> bool {
        self.tx.send(queued).is_ok()
    }

    /// Stops accepting new enqueues. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl EventSink for QueueHandle {
    fn send(&self, event: Event) {
        QueueHandle::send(self, event);
    }
}

/// Consuming half. Owned by exactly one consumer task, which serializes
/// all mutation of the cluster's mirrors.
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<QueuedEvent>,
}

impl EventQueue {
    pub async fn recv(&mut self) -> Option<QueuedEvent> {
        self.rx.recv().await
    }

    /// Non-blocking pop, used when draining after teardown.
    pub fn try_recv(&mut self) -> Option<QueuedEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let (handle, mut queue) = event_queue();
        handle.send(Event::OrphanSweepTriggered);
        handle.send(Event::GatewayDeleted);
        handle.send(Event::ClusterUnregistered);

        assert!(matches!(
            queue.recv().await.unwrap().event,
            Event::OrphanSweepTriggered
        ));
        assert!(matches!(
            queue.recv().await.unwrap().event,
            Event::GatewayDeleted
        ));
        assert!(matches!(
            queue.recv().await.unwrap().event,
            Event::ClusterUnregistered
        ));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_new_events() {
        let (handle, mut queue) = event_queue();
        handle.send(Event::OrphanSweepTriggered);
        handle.close();
        assert!(!handle.send(Event::GatewayDeleted));

        assert!(matches!(
            queue.recv().await.unwrap().event,
            Event::OrphanSweepTriggered
        ));
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_requeue_lands_at_tail_and_survives_close() {
        let (handle, mut queue) = event_queue();
        handle.send(Event::OrphanSweepTriggered);
        let failed = QueuedEvent {
            event: Event::GatewayDeleted,
            attempts: 2,
        };
        handle.close();
        assert!(handle.requeue(failed));

        assert!(matches!(
            queue.recv().await.unwrap().event,
            Event::OrphanSweepTriggered
        ));
        let tail = queue.recv().await.unwrap();
        assert!(matches!(tail.event, Event::GatewayDeleted));
        assert_eq!(tail.attempts, 2);
    }

    #[tokio::test]
    async fn test_sink_capability() {
        let (handle, mut queue) = event_queue();
        let sink: Arc<dyn EventSink> = Arc::new(handle);
        sink.send(Event::ProbeTransition { reachable: true });
        assert!(matches!(
            queue.recv().await.unwrap().event,
            Event::ProbeTransition { reachable: true }
        ));
    }
}
