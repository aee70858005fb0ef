//! Background resolver for orders left in Unknown state.
//!
//! A dispatch deadline or a broker I/O timeout leaves a follower order
//! Unknown: the broker may or may not have accepted it. Outside the
//! fan-out path, this task polls the broker by idempotency token and
//! appends whatever the broker reports. Orders the broker never saw, or
//! that stay unresolved past the attempt budget, are closed out as
//! rejected.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{BrokerAdapter, BrokerError};
use crate::db::{Database, StatusUpdate, StoreError};
use crate::events::{EngineEvent, EventPublisher, Topic};
use crate::instruments::InstrumentMapper;
use crate::models::{Order, OrderStatus};
use crate::session::CredentialVault;
use crate::trading::ReplicationConfig;

const BATCH_SIZE: i64 = 100;

pub struct Reconciler {
    db: Database,
    vault: Arc<CredentialVault>,
    broker: Arc<dyn BrokerAdapter>,
    instruments: Arc<InstrumentMapper>,
    events: EventPublisher,
    config: ReplicationConfig,
    /// Poll attempts per order. In-memory: a restart re-grants the budget,
    /// which only delays the give-up, never loses an order.
    attempts: std::sync::Mutex<ahash::AHashMap<Uuid, u32>>,
}

impl Reconciler {
    pub fn new(
        db: Database,
        vault: Arc<CredentialVault>,
        broker: Arc<dyn BrokerAdapter>,
        instruments: Arc<InstrumentMapper>,
        events: EventPublisher,
        config: ReplicationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            vault,
            broker,
            instruments,
            events,
            config,
            attempts: std::sync::Mutex::new(ahash::AHashMap::new()),
        })
    }

    /// Poll loop; exits on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_ms = self.config.reconcile_interval_ms,
            "reconciler started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.resolve_once().await {
                        Ok(0) => {}
                        Ok(n) => info!(resolved = n, "reconciler pass complete"),
                        Err(e) => warn!(error = %e, "reconciler pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reconciler stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over Unknown orders. Returns how many reached a decision.
    pub async fn resolve_once(&self) -> Result<usize> {
        let orders = self.db.list_unknown_orders(BATCH_SIZE).await?;
        let mut resolved = 0usize;

        for order in orders {
            let attempt = self.bump_attempt(order.id);
            match self.poll_order(&order).await {
                Ok(Some(update)) => {
                    let status = update.status.unwrap_or(OrderStatus::Unknown);
                    match self.db.append_status(order.id, update).await {
                        Ok(_) => {
                            self.clear_attempt(order.id);
                            resolved += 1;
                            debug!(order = %order.id, status = status.as_str(), "order reconciled");
                            self.events.publish(
                                Topic::Orders,
                                EngineEvent::OrderUpdate {
                                    order_id: order.id,
                                    owner: order.owner.clone(),
                                    status,
                                    message: None,
                                },
                            );
                        }
                        Err(StoreError::StaleTransition { .. }) => {
                            self.clear_attempt(order.id);
                        }
                        Err(e) => warn!(order = %order.id, error = %e, "reconcile append failed"),
                    }
                }
                Ok(None) => {
                    // Still unresolved; give up once the budget is spent.
                    if attempt >= self.config.reconcile_max_attempts {
                        self.give_up(&order, attempt).await;
                        resolved += 1;
                    }
                }
                Err(e) => {
                    warn!(order = %order.id, error = %e, "reconcile poll failed");
                    if attempt >= self.config.reconcile_max_attempts {
                        self.give_up(&order, attempt).await;
                        resolved += 1;
                    }
                }
            }
        }
        Ok(resolved)
    }

    /// Ask the broker what became of one order. `Ok(None)` means "ask again
    /// later"; an update means the broker gave a definitive answer.
    async fn poll_order(&self, order: &Order) -> Result<Option<StatusUpdate>> {
        let session = self.vault.session(&order.owner).await?;
        let instrument = self
            .instruments
            .resolve(&order.symbol, order.exchange)
            .await?;

        let report = self
            .broker
            .status(
                &session,
                instrument.scrip_code,
                order.exchange,
                &order.id.to_string(),
            )
            .await;

        match report {
            Ok(report) if report.status != OrderStatus::Unknown => Ok(Some(StatusUpdate {
                status: Some(report.status),
                exchange_order_id: report.exchange_order_id,
                message: report.message,
                filled_quantity: (report.filled_quantity > 0).then_some(report.filled_quantity),
                average_price: report.average_price,
                ..Default::default()
            })),
            Ok(_) => Ok(None),
            // The broker never saw the token: the placement was lost on the
            // wire before acceptance.
            Err(BrokerError::Permanent(message)) => Ok(Some(StatusUpdate {
                status: Some(OrderStatus::Rejected),
                message: Some(format!("reconciler: {message}")),
                ..Default::default()
            })),
            Err(e) => Err(e.into()),
        }
    }

    async fn give_up(&self, order: &Order, attempts: u32) {
        warn!(order = %order.id, attempts, "order unresolved past attempt budget, rejecting");
        let update = StatusUpdate {
            status: Some(OrderStatus::Rejected),
            message: Some(format!("unresolved after {attempts} reconciliation polls")),
            ..Default::default()
        };
        match self.db.append_status(order.id, update).await {
            Ok(_) | Err(StoreError::StaleTransition { .. }) => self.clear_attempt(order.id),
            Err(e) => warn!(order = %order.id, error = %e, "give-up append failed"),
        }
    }

    fn bump_attempt(&self, id: Uuid) -> u32 {
        let mut attempts = self.attempts.lock().expect("attempts lock poisoned");
        let counter = attempts.entry(id).or_insert(0);
        *counter += 1;
        *counter
    }

    fn clear_attempt(&self, id: Uuid) {
        self.attempts
            .lock()
            .expect("attempts lock poisoned")
            .remove(&id);
    }
}
