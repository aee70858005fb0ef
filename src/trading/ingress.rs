//! Ingress hook: where the front door hands an accepted master order to
//! the replication core.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::db::Database;
use crate::events::{EngineEvent, EventPublisher, Topic};
use crate::metrics::latency_stats;

use super::dispatcher::Dispatcher;

/// Entry point called after a master order is validated, risk-checked for
/// the master itself, and persisted as submitted.
#[derive(Clone)]
pub struct IngressHook {
    db: Database,
    dispatcher: Arc<Dispatcher>,
    events: EventPublisher,
}

impl IngressHook {
    pub fn new(db: Database, dispatcher: Arc<Dispatcher>, events: EventPublisher) -> Self {
        Self {
            db,
            dispatcher,
            events,
        }
    }

    /// Kick off the fan-out and return immediately; the master order's
    /// acknowledgment never waits on follower replication. The returned
    /// handle resolves when the replication event seals.
    pub fn accept(&self, master_order_id: Uuid) -> JoinHandle<()> {
        let db = self.db.clone();
        let dispatcher = self.dispatcher.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let master = match db.get_order(master_order_id).await {
                Ok(order) => order,
                Err(e) => {
                    warn!(master_order = %master_order_id, error = %e, "ingress: master order unavailable");
                    return;
                }
            };

            events.publish(
                Topic::Replication,
                EngineEvent::MasterAccepted {
                    master_order_id,
                    owner: master.owner.clone(),
                    symbol: master.symbol.clone(),
                    side: master.side,
                    quantity: master.quantity,
                },
            );

            match dispatcher.dispatch(master_order_id).await {
                Ok(event) => {
                    let stats = latency_stats(&event.latencies_ms);
                    events.publish(
                        Topic::Replication,
                        EngineEvent::ReplicationSealed {
                            master_order_id,
                            total: event.total,
                            dispatched: event.dispatched,
                            pending_reconciliation: event.timed_out,
                            p50_ms: stats.map(|s| s.p50),
                            p95_ms: stats.map(|s| s.p95),
                        },
                    );
                }
                Err(e) => {
                    warn!(master_order = %master_order_id, error = %e, "fan-out failed");
                }
            }
        })
    }
}
