//! One-way event sink for follower/UI updates and audit records.
//!
//! Fire-and-forget over per-topic broadcast channels: publishing never
//! blocks the dispatcher, delivery is at most once, and a receiver that
//! falls behind the channel capacity loses the oldest messages.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{OrderSide, OrderStatus};

const CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the replication engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A master order was accepted and its fan-out scheduled.
    MasterAccepted {
        master_order_id: Uuid,
        owner: String,
        symbol: String,
        side: OrderSide,
        quantity: i64,
    },
    /// A follower order moved through its lifecycle.
    OrderUpdate {
        order_id: Uuid,
        owner: String,
        status: OrderStatus,
        message: Option<String>,
    },
    /// A fan-out sealed; the "X of N replicated, Y pending" aggregate.
    ReplicationSealed {
        master_order_id: Uuid,
        total: usize,
        dispatched: usize,
        pending_reconciliation: usize,
        p50_ms: Option<f64>,
        p95_ms: Option<f64>,
    },
}

/// Topics consumers subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Per-order lifecycle updates for dashboards and notifications.
    Orders,
    /// Fan-out aggregates for the master's view.
    Replication,
    /// Durable audit trail feed.
    Audit,
}

/// Topic-fanned broadcast publisher.
#[derive(Clone)]
pub struct EventPublisher {
    orders_tx: broadcast::Sender<EngineEvent>,
    replication_tx: broadcast::Sender<EngineEvent>,
    audit_tx: broadcast::Sender<EngineEvent>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            orders_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            replication_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            audit_tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<EngineEvent> {
        match topic {
            Topic::Orders => self.orders_tx.subscribe(),
            Topic::Replication => self.replication_tx.subscribe(),
            Topic::Audit => self.audit_tx.subscribe(),
        }
    }

    /// Publish to a topic and mirror to the audit feed. A send with no
    /// receivers is not an error.
    pub fn publish(&self, topic: Topic, event: EngineEvent) {
        let tx = match topic {
            Topic::Orders => &self.orders_tx,
            Topic::Replication => &self.replication_tx,
            Topic::Audit => &self.audit_tx,
        };
        let _ = tx.send(event.clone());
        if topic != Topic::Audit {
            let _ = self.audit_tx.send(event);
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(total: usize) -> EngineEvent {
        EngineEvent::ReplicationSealed {
            master_order_id: Uuid::new_v4(),
            total,
            dispatched: total,
            pending_reconciliation: 0,
            p50_ms: None,
            p95_ms: None,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_topic_events() {
        let publisher = EventPublisher::new();
        let mut rx = publisher.subscribe(Topic::Replication);
        publisher.publish(Topic::Replication, sealed(3));

        match rx.recv().await.unwrap() {
            EngineEvent::ReplicationSealed { total, .. } => assert_eq!(total, 3),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let publisher = EventPublisher::new();
        publisher.publish(Topic::Orders, sealed(1));
    }

    #[tokio::test]
    async fn audit_mirrors_other_topics() {
        let publisher = EventPublisher::new();
        let mut audit = publisher.subscribe(Topic::Audit);
        publisher.publish(Topic::Replication, sealed(2));
        assert!(audit.recv().await.is_ok());
    }

    #[tokio::test]
    async fn slow_consumer_drops_oldest() {
        let publisher = EventPublisher::new();
        let mut rx = publisher.subscribe(Topic::Replication);
        for i in 0..CHANNEL_CAPACITY + 10 {
            publisher.publish(Topic::Replication, sealed(i));
        }
        // The receiver lagged; the first recv reports the loss.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 10),
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
