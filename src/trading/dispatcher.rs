//! Bounded-concurrency fan-out engine.
//!
//! One `dispatch` call runs every follower pipeline for a master order in
//! parallel on the runtime, bounded broker-side by a process-global
//! semaphore. Per-follower submission order across master orders is
//! enforced by a striped mutex held over the persist -> place -> persist
//! sequence and released across backoff sleeps. Follower failures stay
//! local: each pipeline terminates in a recorded outcome, never an error
//! that aborts the fan-out.

use std::sync::Arc;
use std::time::Instant;

use ahash::RandomState;
use chrono::Utc;
use std::hash::{BuildHasher, Hash, Hasher};
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{BrokerAdapter, BrokerError, OrderSpec};
use crate::db::{Database, FollowerRegistry, StatusUpdate, StoreError};
use crate::events::{EngineEvent, EventPublisher, Topic};
use crate::instruments::{InstrumentError, InstrumentMapper};
use crate::metrics::{latency_stats, ReplicationSummary};
use crate::models::{
    FollowerLink, FollowerOutcome, FollowerRecord, Order, OrderDraft, OrderStatus,
    ReplicationEvent,
};
use crate::session::VaultError;
use crate::trading::policy::{derive_quantity, Transform};
use crate::trading::risk::{Decision, ProposedOrder, RiskGate};
use crate::trading::ReplicationConfig;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("master order {0} is not replicable in status {1}")]
    NotReplicable(Uuid, String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Shared slot holding the follower order id once persisted, so the
/// deadline handler can mark an in-flight order Unknown after its pipeline
/// future is dropped.
type OrderSlot = Arc<std::sync::Mutex<Option<Uuid>>>;

pub struct Dispatcher {
    db: Database,
    registry: FollowerRegistry,
    instruments: Arc<InstrumentMapper>,
    vault: Arc<crate::session::CredentialVault>,
    broker: Arc<dyn BrokerAdapter>,
    risk: RiskGate,
    events: EventPublisher,
    config: ReplicationConfig,
    /// Cross-tenant backpressure: total broker calls in flight.
    semaphore: Arc<Semaphore>,
    /// Per-follower ordering locks, striped by account hash.
    stripes: Vec<Mutex<()>>,
    stripe_hasher: RandomState,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        registry: FollowerRegistry,
        instruments: Arc<InstrumentMapper>,
        vault: Arc<crate::session::CredentialVault>,
        broker: Arc<dyn BrokerAdapter>,
        risk: RiskGate,
        events: EventPublisher,
        config: ReplicationConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let stripe_count = config.follower_lock_stripes.max(1);
        Arc::new(Self {
            db,
            registry,
            instruments,
            vault,
            broker,
            risk,
            events,
            semaphore: Arc::new(Semaphore::new(config.max_in_flight_broker_calls.max(1))),
            stripes: (0..stripe_count).map(|_| Mutex::new(())).collect(),
            stripe_hasher: RandomState::with_seeds(17, 31, 47, 97),
            config,
            shutdown,
        })
    }

    fn stripe_for(&self, follower: &str) -> &Mutex<()> {
        let mut hasher = self.stripe_hasher.build_hasher();
        follower.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        &self.stripes[index]
    }

    async fn cancelled(&self) {
        let mut rx = self.shutdown.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped: treat as shutdown.
                return;
            }
        }
    }

    fn publish_order_update(&self, order_id: Uuid, owner: &str, status: OrderStatus, message: Option<String>) {
        self.events.publish(
            Topic::Orders,
            EngineEvent::OrderUpdate {
                order_id,
                owner: owner.to_string(),
                status,
                message,
            },
        );
    }

    /// Fan a master order out to its active followers and seal the
    /// replication event once every pipeline has terminated.
    pub async fn dispatch(
        self: &Arc<Self>,
        master_order_id: Uuid,
    ) -> Result<ReplicationEvent, DispatchError> {
        let master = self.db.get_order(master_order_id).await?;
        if !master.is_replicable() {
            return Err(DispatchError::NotReplicable(
                master_order_id,
                master.status.as_str().to_string(),
            ));
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let links = self.registry.active_followers(&master.owner).await?;

        if links.is_empty() {
            let event = ReplicationEvent::seal(master.id, Vec::new(), started_at);
            self.persist_event(&event).await?;
            return Ok(event);
        }

        info!(
            master_order = %master.id,
            owner = %master.owner,
            followers = links.len(),
            "starting fan-out"
        );

        let mut set = JoinSet::new();
        for link in links.iter() {
            let this = self.clone();
            let master = master.clone();
            let link = link.clone();
            set.spawn(async move { this.follower_pipeline(master, link, start).await });
        }

        let mut records = Vec::with_capacity(links.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "follower pipeline aborted"),
            }
        }

        let event = ReplicationEvent::seal(master.id, records, started_at);
        self.persist_event(&event).await?;
        let summary = ReplicationSummary::of(&event);
        info!(
            master_order = %master.id,
            total = summary.total,
            dispatched = summary.dispatched,
            timed_out = summary.timed_out,
            p95_ms = summary.latency.map(|l| l.p95),
            wall_clock_ms = summary.wall_clock_ms,
            "fan-out sealed"
        );
        Ok(event)
    }

    async fn persist_event(&self, event: &ReplicationEvent) -> Result<(), StoreError> {
        let stats = latency_stats(&event.latencies_ms);
        self.db
            .insert_replication_event(
                event,
                stats.map(|s| s.p50),
                stats.map(|s| s.p95),
                stats.map(|s| s.p99),
            )
            .await
    }

    /// One follower's pipeline under the dispatch deadline. Always returns
    /// a record; a deadline or shutdown marks any persisted order Unknown
    /// for the reconciler.
    async fn follower_pipeline(
        self: Arc<Self>,
        master: Order,
        link: FollowerLink,
        fanout_start: Instant,
    ) -> FollowerRecord {
        let follower = link.follower.clone();
        let slot: OrderSlot = Arc::new(std::sync::Mutex::new(None));

        let outcome = tokio::select! {
            finished = tokio::time::timeout(
                self.config.dispatch_timeout(),
                self.run_stages(&master, &link, fanout_start, &slot),
            ) => match finished {
                Ok(outcome) => outcome,
                Err(_) => self.abandon(&slot, &follower, "dispatch deadline exceeded").await,
            },
            _ = self.cancelled() => {
                self.abandon(&slot, &follower, "dispatch cancelled").await
            }
        };

        let order_id = *slot.lock().expect("order slot poisoned");
        debug!(follower = %follower, outcome = ?outcome, "pipeline finished");
        FollowerRecord {
            follower,
            order_id,
            outcome,
        }
    }

    /// Deadline/cancel path: the pipeline future is gone, but a persisted
    /// order may have reached the broker. Leave it Unknown; never roll back.
    async fn abandon(&self, slot: &OrderSlot, follower: &str, why: &str) -> FollowerOutcome {
        let order_id = *slot.lock().expect("order slot poisoned");
        if let Some(id) = order_id {
            let update = StatusUpdate {
                status: Some(OrderStatus::Unknown),
                message: Some(why.to_string()),
                ..Default::default()
            };
            match self.db.append_status(id, update).await {
                Ok(_) => self.publish_order_update(id, follower, OrderStatus::Unknown, Some(why.to_string())),
                // Already terminal: the pipeline won the race; keep its state.
                Err(StoreError::StaleTransition { .. }) => {}
                Err(e) => warn!(order = %id, error = %e, "failed to mark order unknown"),
            }
        }
        FollowerOutcome::TimedOut
    }

    /// Stages (a)-(i). Stage failures return recorded outcomes.
    async fn run_stages(
        &self,
        master: &Order,
        link: &FollowerLink,
        fanout_start: Instant,
        slot: &OrderSlot,
    ) -> FollowerOutcome {
        let broker_error = |message: String| FollowerOutcome::BrokerError { message };

        // Re-dispatch of the same master order short-circuits on the
        // existing record instead of deriving a second order.
        let mut existing = match self.db.find_follower_order(master.id, &link.follower).await {
            Ok(found) => {
                if let Some(order) = &found {
                    *slot.lock().expect("order slot poisoned") = Some(order.id);
                    match order.status {
                        OrderStatus::Unknown => return FollowerOutcome::TimedOut,
                        OrderStatus::Rejected | OrderStatus::Cancelled => {
                            return broker_error(
                                order.message.clone().unwrap_or_else(|| "rejected".to_string()),
                            )
                        }
                        _ if order.broker_order_id.is_some() => {
                            return FollowerOutcome::dispatched(fanout_start.elapsed())
                        }
                        // Pending with no broker id: a crash window left it
                        // unplaced; resume from the session stage.
                        _ => {}
                    }
                }
                found
            }
            Err(e) => return broker_error(e.to_string()),
        };

        let account = match self.db.get_account(&link.follower).await {
            Ok(Some(account)) => account,
            Ok(None) => return broker_error(format!("account {} not provisioned", link.follower)),
            Err(e) => return broker_error(e.to_string()),
        };

        // (b) Instrument resolve.
        let instrument = match self
            .instruments
            .resolve(&master.symbol, master.exchange)
            .await
        {
            Ok(instrument) => instrument,
            Err(InstrumentError::Unknown { .. }) => return FollowerOutcome::Unmapped,
            Err(InstrumentError::Store(e)) => return broker_error(e.to_string()),
        };

        let reference_price = match master.limit_price {
            Some(price) => Some(price),
            None => match self.db.last_mark(&master.symbol, master.exchange).await {
                Ok(mark) => mark,
                Err(e) => return broker_error(e.to_string()),
            },
        };

        // (a) Transform.
        let quantity = match derive_quantity(master, link, &instrument, account.balance, reference_price)
        {
            Transform::Quantity(q) => q,
            Transform::Skip(reason) => return FollowerOutcome::PolicySkip { reason },
        };

        // (c) Risk gate.
        let envelope = self.risk.envelope_for(&account, link);
        let proposed = ProposedOrder {
            symbol: master.symbol.clone(),
            side: master.side,
            quantity,
            reference_price,
        };
        match self.risk.check(&account, &proposed, &envelope).await {
            Ok(Decision::Allow) => {}
            Ok(Decision::Deny(reason)) => return FollowerOutcome::RiskDenied { reason },
            Err(e) => return broker_error(e.to_string()),
        }

        // (d)-(i) under the per-follower stripe, released across backoff
        // sleeps so a retrying pipeline cannot starve the account.
        let stripe = self.stripe_for(&link.follower);
        let mut retries: u32 = 0;
        let mut auth_retried = false;

        loop {
            let guard = stripe.lock().await;

            // (d) Persist the pending follower order; its id is the broker
            // idempotency token.
            let order = match &existing {
                Some(order) => order.clone(),
                None => {
                    let draft = OrderDraft::follower_of(master, &link.follower, quantity);
                    match self.db.create_order(&draft).await {
                        Ok(order) => {
                            *slot.lock().expect("order slot poisoned") = Some(order.id);
                            existing = Some(order.clone());
                            order
                        }
                        Err(e) => return broker_error(e.to_string()),
                    }
                }
            };

            // (e) Session.
            let session = match self.vault.session(&link.follower).await {
                Ok(session) => session,
                Err(VaultError::AuthTransient(message)) => {
                    if auth_retried {
                        return broker_error(format!("auth failed after retry: {message}"));
                    }
                    auth_retried = true;
                    drop(guard);
                    tokio::time::sleep(self.config.backoff_delay(1)).await;
                    continue;
                }
                Err(VaultError::InvalidCredentials(_)) => {
                    self.finish_order(
                        order.id,
                        &link.follower,
                        OrderStatus::Rejected,
                        Some("credential".to_string()),
                        None,
                        None,
                    )
                    .await;
                    return broker_error(format!("invalid credentials for {}", link.follower));
                }
            };

            let spec = OrderSpec {
                exchange: master.exchange,
                segment: instrument.segment.clone(),
                scrip_code: instrument.scrip_code,
                side: master.side,
                kind: master.kind,
                quantity,
                limit_price: master.limit_price,
                trigger_price: master.trigger_price,
                product: master.product,
                validity: master.validity,
                client_token: order.id.to_string(),
            };

            // (f) Place, inside the global broker-call budget.
            let permit = match self.semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => return broker_error("dispatcher shutting down".to_string()),
            };
            let placed = self.broker.place(&session, &spec).await;
            drop(permit);

            match placed {
                Ok(ack) if ack.status == OrderStatus::Rejected => {
                    let message = ack.message.unwrap_or_else(|| "rejected by broker".to_string());
                    self.finish_order(
                        order.id,
                        &link.follower,
                        OrderStatus::Rejected,
                        Some(message.clone()),
                        None,
                        None,
                    )
                    .await;
                    return broker_error(message);
                }
                Ok(ack) => {
                    // (i) Success.
                    self.finish_order(
                        order.id,
                        &link.follower,
                        OrderStatus::Submitted,
                        ack.message,
                        Some(ack.broker_order_id),
                        ack.exchange_order_id,
                    )
                    .await;
                    return FollowerOutcome::dispatched(fanout_start.elapsed());
                }
                // (g) Transient: backoff with the same idempotency token.
                Err(BrokerError::Transient(message)) => {
                    if retries >= self.config.max_retries {
                        self.finish_order(
                            order.id,
                            &link.follower,
                            OrderStatus::Rejected,
                            Some(format!("retries exhausted: {message}")),
                            None,
                            None,
                        )
                        .await;
                        return broker_error(format!("retries exhausted: {message}"));
                    }
                    retries += 1;
                    debug!(follower = %link.follower, retries, %message, "transient broker error, backing off");
                    drop(guard);
                    tokio::time::sleep(self.config.backoff_delay(retries)).await;
                    continue;
                }
                // (f) Timeout: the broker may have accepted it upstream.
                Err(BrokerError::Timeout) => {
                    self.finish_order(
                        order.id,
                        &link.follower,
                        OrderStatus::Unknown,
                        Some("broker call timed out".to_string()),
                        None,
                        None,
                    )
                    .await;
                    return FollowerOutcome::TimedOut;
                }
                // (h) Permanent.
                Err(BrokerError::Permanent(message)) => {
                    self.finish_order(
                        order.id,
                        &link.follower,
                        OrderStatus::Rejected,
                        Some(message.clone()),
                        None,
                        None,
                    )
                    .await;
                    return broker_error(message);
                }
                Err(BrokerError::InvalidCredentials) => {
                    self.finish_order(
                        order.id,
                        &link.follower,
                        OrderStatus::Rejected,
                        Some("credential".to_string()),
                        None,
                        None,
                    )
                    .await;
                    return broker_error(format!("invalid credentials for {}", link.follower));
                }
            }
        }
    }

    async fn finish_order(
        &self,
        order_id: Uuid,
        owner: &str,
        status: OrderStatus,
        message: Option<String>,
        broker_order_id: Option<String>,
        exchange_order_id: Option<String>,
    ) {
        let update = StatusUpdate::with_broker_ids(status, broker_order_id, exchange_order_id, message.clone());
        match self.db.append_status(order_id, update).await {
            Ok(_) => self.publish_order_update(order_id, owner, status, message),
            Err(StoreError::StaleTransition { .. }) => {}
            Err(e) => warn!(order = %order_id, error = %e, "status append failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockBroker;
    use crate::db::AccountRecord;
    use crate::models::{
        CopyPolicy, Exchange, InstrumentCode, OrderKind, OrderSide, ProductKind, RiskEnvelope,
        SkipReason, Validity,
    };
    use crate::session::{BrokerCredentials, CredentialVault};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Harness {
        db: Database,
        broker: Arc<MockBroker>,
        dispatcher: Arc<Dispatcher>,
        shutdown_tx: watch::Sender<bool>,
    }

    async fn harness(config: ReplicationConfig, broker: Arc<MockBroker>) -> Harness {
        let db = Database::in_memory().await.unwrap();
        let key = BASE64.encode([9u8; 32]);
        let vault = Arc::new(
            CredentialVault::new(db.clone(), &key, Duration::from_secs(300)).unwrap(),
        );

        db.save_instrument(&InstrumentCode {
            symbol: "RELIANCE".to_string(),
            exchange: Exchange::Nse,
            segment: "C".to_string(),
            scrip_code: 2885,
            lot_size: 1,
            active: true,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = FollowerRegistry::new(db.clone(), config.follower_snapshot_ttl());
        let instruments = Arc::new(InstrumentMapper::new(db.clone()));
        let risk = RiskGate::new(db.clone(), RiskEnvelope::default());
        let events = EventPublisher::new();
        let dispatcher = Dispatcher::new(
            db.clone(),
            registry,
            instruments,
            vault.clone(),
            broker.clone(),
            risk,
            events,
            config,
            shutdown_rx,
        );

        Harness {
            db,
            broker,
            dispatcher,
            shutdown_tx,
        }
    }

    async fn add_follower(h: &Harness, master: &str, follower: &str, policy: CopyPolicy) {
        let vault = CredentialVault::new(
            h.db.clone(),
            &BASE64.encode([9u8; 32]),
            Duration::from_secs(300),
        )
        .unwrap();
        let sealed = vault
            .seal(&BrokerCredentials {
                client_code: follower.to_string(),
                user_id: follower.to_string(),
                password: "pass".to_string(),
                api_key: "key".to_string(),
                app_name: "copyrelay".to_string(),
                app_version: "1.0.0".to_string(),
                public_ip: "203.0.113.7".to_string(),
            })
            .unwrap();
        h.db.save_account(&AccountRecord {
            account_id: follower.to_string(),
            sealed_credentials: sealed,
            balance: dec!(10000000),
            max_daily_loss: None,
            max_drawdown_pct: None,
            max_position_notional: None,
            max_open_positions: None,
            max_exposure: None,
        })
        .await
        .unwrap();
        h.db.save_link(&FollowerLink {
            master: master.to_string(),
            follower: follower.to_string(),
            policy,
            max_order_notional: None,
            max_daily_loss: None,
            active: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    async fn master_order(h: &Harness, owner: &str, quantity: i64) -> Order {
        let order = h
            .db
            .create_order(&OrderDraft {
                owner: owner.to_string(),
                strategy_id: None,
                parent_id: None,
                side: OrderSide::Buy,
                kind: OrderKind::Market,
                symbol: "RELIANCE".to_string(),
                exchange: Exchange::Nse,
                quantity,
                limit_price: None,
                trigger_price: None,
                product: ProductKind::Intraday,
                validity: Validity::Day,
            })
            .await
            .unwrap();
        h.db.append_status(order.id, StatusUpdate::to(OrderStatus::Submitted))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn ten_clean_followers_all_dispatch() {
        let h = harness(ReplicationConfig::default(), Arc::new(MockBroker::new())).await;
        for i in 1..=10 {
            add_follower(&h, "MA", &format!("F{i}"), CopyPolicy::FixedRatio { ratio: dec!(1) })
                .await;
        }
        let master = master_order(&h, "MA", 100).await;

        let event = h.dispatcher.dispatch(master.id).await.unwrap();
        assert_eq!(event.total, 10);
        assert_eq!(event.dispatched, 10);
        assert_eq!(event.latencies_ms.len(), 10);

        let children = h.db.list_by_parent(master.id).await.unwrap();
        assert_eq!(children.len(), 10);
        for child in &children {
            assert_eq!(child.side, master.side);
            assert_eq!(child.symbol, master.symbol);
            assert_eq!(child.kind, master.kind);
            assert_eq!(child.quantity, 100);
            assert_eq!(child.status, OrderStatus::Submitted);
            assert!(child.broker_order_id.is_some());
        }
        assert_eq!(h.broker.placed().len(), 10);

        let stats = latency_stats(&event.latencies_ms).unwrap();
        assert!(stats.p95 < 1000.0, "p95 was {} ms", stats.p95);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_pipelines() {
        let broker = Arc::new(MockBroker::with_latency(Duration::from_millis(300)));
        let h = harness(ReplicationConfig::default(), broker).await;
        for i in 1..=4 {
            add_follower(&h, "MA", &format!("F{i}"), CopyPolicy::FixedRatio { ratio: dec!(1) })
                .await;
        }
        let master = master_order(&h, "MA", 10).await;

        let dispatcher = h.dispatcher.clone();
        let fanout = tokio::spawn(async move { dispatcher.dispatch(master.id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.shutdown_tx.send(true).unwrap();

        // Pipelines drain cooperatively: the event still seals, with the
        // interrupted followers left for the reconciler.
        let event = fanout.await.unwrap().unwrap();
        assert_eq!(event.total, 4);
        assert_eq!(event.timed_out, 4);
        for record in &event.records {
            let id = record.order_id.expect("order persisted before shutdown");
            let order = h.db.get_order(id).await.unwrap();
            assert_eq!(order.status, OrderStatus::Unknown);
        }
    }

    #[tokio::test]
    async fn tiny_ratio_follower_skips() {
        let h = harness(ReplicationConfig::default(), Arc::new(MockBroker::new())).await;
        for i in 1..=9 {
            add_follower(&h, "MA", &format!("F{i}"), CopyPolicy::FixedRatio { ratio: dec!(1) })
                .await;
        }
        add_follower(&h, "MA", "F10", CopyPolicy::FixedRatio { ratio: dec!(0.0049) }).await;
        let master = master_order(&h, "MA", 100).await;

        let event = h.dispatcher.dispatch(master.id).await.unwrap();
        assert_eq!(event.dispatched, 9);
        assert_eq!(event.policy_skipped, 1);
        let skipped = event
            .records
            .iter()
            .find(|r| r.follower == "F10")
            .unwrap();
        assert_eq!(
            skipped.outcome,
            FollowerOutcome::PolicySkip {
                reason: SkipReason::TooSmall
            }
        );
        // No order row for the skipped follower.
        assert_eq!(h.db.list_by_parent(master.id).await.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn risk_denied_followers_never_reach_broker() {
        let h = harness(ReplicationConfig::default(), Arc::new(MockBroker::new())).await;
        for i in 1..=10 {
            add_follower(&h, "MA", &format!("F{i}"), CopyPolicy::FixedRatio { ratio: dec!(1) })
                .await;
        }
        // Three followers already realized a loss beyond the default cap.
        for i in 1..=3 {
            let loser = h
                .db
                .create_order(&OrderDraft {
                    owner: format!("F{i}"),
                    strategy_id: None,
                    parent_id: None,
                    side: OrderSide::Buy,
                    kind: OrderKind::Market,
                    symbol: "LOSSY".to_string(),
                    exchange: Exchange::Nse,
                    quantity: 1,
                    limit_price: None,
                    trigger_price: None,
                    product: ProductKind::Intraday,
                    validity: Validity::Day,
                })
                .await
                .unwrap();
            h.db.append_status(loser.id, StatusUpdate::to(OrderStatus::Submitted))
                .await
                .unwrap();
            h.db.append_status(
                loser.id,
                StatusUpdate {
                    status: Some(OrderStatus::Filled),
                    filled_quantity: Some(1),
                    average_price: Some(dec!(60000)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        let master = master_order(&h, "MA", 10).await;

        let event = h.dispatcher.dispatch(master.id).await.unwrap();
        assert_eq!(event.dispatched, 7);
        assert_eq!(event.risk_denied, 3);
        // Denied followers placed nothing.
        for i in 1..=3 {
            assert!(h.broker.placed_for(&format!("F{i}")).is_empty());
        }
    }

    #[tokio::test]
    async fn transient_errors_retry_and_succeed() {
        let broker = Arc::new(MockBroker::new());
        let config = ReplicationConfig {
            retry_base_ms: 10,
            retry_cap_ms: 20,
            ..Default::default()
        };
        let h = harness(config, broker.clone()).await;
        for i in 1..=10 {
            add_follower(&h, "MA", &format!("F{i}"), CopyPolicy::FixedRatio { ratio: dec!(1) })
                .await;
        }
        // Odd-indexed followers 429 once, then succeed.
        for i in (1..=10).step_by(2) {
            broker.fail_transient(&format!("F{i}"), 1);
        }
        let master = master_order(&h, "MA", 10).await;

        let event = h.dispatcher.dispatch(master.id).await.unwrap();
        assert_eq!(event.dispatched, 10);
        assert_eq!(event.broker_errored, 0);
        // One attempt for even, two for odd.
        for i in 1..=10 {
            let expected = if i % 2 == 1 { 2 } else { 1 };
            assert_eq!(
                broker.place_attempts(&format!("F{i}")),
                expected,
                "follower F{i}"
            );
        }
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let broker = Arc::new(MockBroker::new());
        let config = ReplicationConfig {
            retry_base_ms: 5,
            retry_cap_ms: 10,
            max_retries: 3,
            ..Default::default()
        };
        let h = harness(config, broker.clone()).await;
        add_follower(&h, "MA", "F1", CopyPolicy::FixedRatio { ratio: dec!(1) }).await;
        broker.fail_transient("F1", 100);
        let master = master_order(&h, "MA", 10).await;

        let event = h.dispatcher.dispatch(master.id).await.unwrap();
        assert_eq!(event.broker_errored, 1);
        // max_retries + 1 attempts, no more.
        assert_eq!(broker.place_attempts("F1"), 4);

        let child = &h.db.list_by_parent(master.id).await.unwrap()[0];
        assert_eq!(child.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn slow_broker_times_out_and_leaves_order_unknown() {
        let broker = Arc::new(MockBroker::with_latency(Duration::from_millis(5)));
        let config = ReplicationConfig {
            dispatch_timeout_ms: 150,
            ..Default::default()
        };
        let h = harness(config, broker.clone()).await;
        for i in 1..=10 {
            add_follower(&h, "MA", &format!("F{i}"), CopyPolicy::FixedRatio { ratio: dec!(1) })
                .await;
        }
        // One follower's broker call takes far longer than the deadline.
        broker.set_account_latency("F7", Duration::from_millis(600));
        let master = master_order(&h, "MA", 10).await;

        let started = Instant::now();
        let event = h.dispatcher.dispatch(master.id).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(event.dispatched, 9);
        assert_eq!(event.timed_out, 1);

        let timed_out = event.records.iter().find(|r| r.follower == "F7").unwrap();
        let order_id = timed_out.order_id.expect("order persisted before timeout");
        let order = h.db.get_order(order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Unknown);
    }

    #[tokio::test]
    async fn semaphore_bounds_concurrent_broker_calls() {
        let broker = Arc::new(MockBroker::with_latency(Duration::from_millis(20)));
        let config = ReplicationConfig {
            max_in_flight_broker_calls: 3,
            ..Default::default()
        };
        let h = harness(config, broker.clone()).await;
        for i in 1..=12 {
            add_follower(&h, "MA", &format!("F{i}"), CopyPolicy::FixedRatio { ratio: dec!(1) })
                .await;
        }
        let master = master_order(&h, "MA", 10).await;

        let event = h.dispatcher.dispatch(master.id).await.unwrap();
        assert_eq!(event.dispatched, 12);
        assert!(
            h.broker.max_in_flight() <= 3,
            "saw {} concurrent broker calls",
            h.broker.max_in_flight()
        );
    }

    #[tokio::test]
    async fn per_follower_fifo_across_master_orders() {
        let broker = Arc::new(MockBroker::with_latency(Duration::from_millis(80)));
        let h = harness(ReplicationConfig::default(), broker.clone()).await;
        for i in 1..=4 {
            add_follower(&h, "MA", &format!("F{i}"), CopyPolicy::FixedRatio { ratio: dec!(1) })
                .await;
        }
        let m1 = master_order(&h, "MA", 10).await;
        let m2 = master_order(&h, "MA", 20).await;

        let d1 = h.dispatcher.clone();
        let d2 = h.dispatcher.clone();
        let first = tokio::spawn(async move { d1.dispatch(m1.id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = tokio::spawn(async move { d2.dispatch(m2.id).await });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        // For every follower, the m1-derived order reached the broker first.
        for i in 1..=4 {
            let placed = broker.placed_for(&format!("F{i}"));
            assert_eq!(placed.len(), 2);
            assert_eq!(placed[0].quantity, 10, "F{i} saw m2 first");
            assert_eq!(placed[1].quantity, 20);
            assert!(placed[0].seq < placed[1].seq);
        }
    }

    #[tokio::test]
    async fn redispatch_is_idempotent() {
        let h = harness(ReplicationConfig::default(), Arc::new(MockBroker::new())).await;
        for i in 1..=5 {
            add_follower(&h, "MA", &format!("F{i}"), CopyPolicy::FixedRatio { ratio: dec!(1) })
                .await;
        }
        let master = master_order(&h, "MA", 10).await;

        let first = h.dispatcher.dispatch(master.id).await.unwrap();
        let second = h.dispatcher.dispatch(master.id).await.unwrap();
        assert_eq!(first.dispatched, 5);
        assert_eq!(second.dispatched, 5);
        // Still one broker order and one stored order per follower.
        assert_eq!(h.broker.placed().len(), 5);
        assert_eq!(h.db.list_by_parent(master.id).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn empty_follower_set_seals_empty_event() {
        let h = harness(ReplicationConfig::default(), Arc::new(MockBroker::new())).await;
        let master = master_order(&h, "MA", 10).await;
        let event = h.dispatcher.dispatch(master.id).await.unwrap();
        assert_eq!(event.total, 0);
    }

    #[tokio::test]
    async fn pending_master_is_not_replicable() {
        let h = harness(ReplicationConfig::default(), Arc::new(MockBroker::new())).await;
        let order = h
            .db
            .create_order(&OrderDraft {
                owner: "MA".to_string(),
                strategy_id: None,
                parent_id: None,
                side: OrderSide::Buy,
                kind: OrderKind::Market,
                symbol: "RELIANCE".to_string(),
                exchange: Exchange::Nse,
                quantity: 10,
                limit_price: None,
                trigger_price: None,
                product: ProductKind::Intraday,
                validity: Validity::Day,
            })
            .await
            .unwrap();
        let err = h.dispatcher.dispatch(order.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotReplicable(_, _)));
    }

    #[tokio::test]
    async fn permanent_rejection_marks_order_rejected() {
        let broker = Arc::new(MockBroker::new());
        let h = harness(ReplicationConfig::default(), broker.clone()).await;
        add_follower(&h, "MA", "F1", CopyPolicy::FixedRatio { ratio: dec!(1) }).await;
        broker.reject_account("F1", "Insufficient margin");
        let master = master_order(&h, "MA", 10).await;

        let event = h.dispatcher.dispatch(master.id).await.unwrap();
        assert_eq!(event.broker_errored, 1);
        let child = &h.db.list_by_parent(master.id).await.unwrap()[0];
        assert_eq!(child.status, OrderStatus::Rejected);
        assert_eq!(child.message.as_deref(), Some("Insufficient margin"));
    }
}
