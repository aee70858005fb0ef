//! In-memory broker adapter for tests and the local simulator.
//!
//! Scriptable per account: injected latency, transient failures, and RMS
//! rejections. Records every accepted placement with a global sequence
//! number so tests can assert ordering and concurrency bounds.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::{Exchange, OrderStatus};
use crate::session::BrokerSession;

use super::{
    BrokerAdapter, BrokerError, BrokerPosition, MarginSnapshot, OrderDiff, OrderSpec, PlaceAck,
    StatusReport,
};

/// One accepted placement, in broker arrival order.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub account: String,
    pub client_token: String,
    pub broker_order_id: String,
    pub quantity: i64,
    /// Global arrival sequence; the mock's submit timestamp.
    pub seq: i64,
    pub at: Instant,
}

#[derive(Default)]
struct Script {
    /// Per-account latency override.
    latency: ahash::AHashMap<String, Duration>,
    /// Per-account count of remaining transient failures.
    transient_failures: ahash::AHashMap<String, u32>,
    /// Accounts whose placements the RMS rejects outright.
    reject: ahash::AHashMap<String, String>,
    /// place() calls seen per account, successful or not.
    attempts: ahash::AHashMap<String, u32>,
}

/// Scriptable in-memory broker.
pub struct MockBroker {
    base_latency: Duration,
    script: Mutex<Script>,
    placed: Mutex<Vec<PlacedOrder>>,
    seq: AtomicI64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::with_latency(Duration::from_millis(0))
    }

    pub fn with_latency(base_latency: Duration) -> Self {
        Self {
            base_latency,
            script: Mutex::new(Script::default()),
            placed: Mutex::new(Vec::new()),
            seq: AtomicI64::new(1),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay this account's broker calls by `latency` instead of the base.
    pub fn set_account_latency(&self, account: &str, latency: Duration) {
        self.script
            .lock()
            .unwrap()
            .latency
            .insert(account.to_string(), latency);
    }

    /// Fail the next `n` placements for this account with a transient error.
    pub fn fail_transient(&self, account: &str, n: u32) {
        self.script
            .lock()
            .unwrap()
            .transient_failures
            .insert(account.to_string(), n);
    }

    /// Reject every placement for this account with the given RMS message.
    pub fn reject_account(&self, account: &str, message: &str) {
        self.script
            .lock()
            .unwrap()
            .reject
            .insert(account.to_string(), message.to_string());
    }

    /// Everything accepted so far, in arrival order.
    pub fn placed(&self) -> Vec<PlacedOrder> {
        self.placed.lock().unwrap().clone()
    }

    pub fn placed_for(&self, account: &str) -> Vec<PlacedOrder> {
        self.placed
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.account == account)
            .cloned()
            .collect()
    }

    /// High-water mark of concurrent place() calls.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// How many place() calls this account has seen, failures included.
    pub fn place_attempts(&self, account: &str) -> u32 {
        self.script
            .lock()
            .unwrap()
            .attempts
            .get(account)
            .copied()
            .unwrap_or(0)
    }

    fn latency_for(&self, account: &str) -> Duration {
        self.script
            .lock()
            .unwrap()
            .latency
            .get(account)
            .copied()
            .unwrap_or(self.base_latency)
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for MockBroker {
    async fn place(
        &self,
        session: &BrokerSession,
        spec: &OrderSpec,
    ) -> Result<PlaceAck, BrokerError> {
        let account = session.account_id.clone();
        *self
            .script
            .lock()
            .unwrap()
            .attempts
            .entry(account.clone())
            .or_insert(0) += 1;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = self.latency_for(&account);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        // Scripted transient failure, consumed one per attempt.
        {
            let mut script = self.script.lock().unwrap();
            if let Some(remaining) = script.transient_failures.get_mut(&account) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BrokerError::Transient("HTTP 429".to_string()));
                }
            }
            if let Some(message) = script.reject.get(&account) {
                return Ok(PlaceAck {
                    broker_order_id: String::new(),
                    exchange_order_id: None,
                    status: OrderStatus::Rejected,
                    message: Some(message.clone()),
                });
            }
        }

        let mut placed = self.placed.lock().unwrap();
        // Idempotency: a replayed token returns the original acknowledgment.
        if let Some(existing) = placed.iter().find(|p| p.client_token == spec.client_token) {
            return Ok(PlaceAck {
                broker_order_id: existing.broker_order_id.clone(),
                exchange_order_id: Some(format!("X{}", existing.broker_order_id)),
                status: OrderStatus::Submitted,
                message: Some("duplicate order".to_string()),
            });
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let broker_order_id = format!("B{seq:08}");
        placed.push(PlacedOrder {
            account,
            client_token: spec.client_token.clone(),
            broker_order_id: broker_order_id.clone(),
            quantity: spec.quantity,
            seq,
            at: Instant::now(),
        });

        Ok(PlaceAck {
            broker_order_id: broker_order_id.clone(),
            exchange_order_id: Some(format!("X{broker_order_id}")),
            status: OrderStatus::Submitted,
            message: Some("order placed".to_string()),
        })
    }

    async fn status(
        &self,
        _session: &BrokerSession,
        _scrip_code: i64,
        _exchange: Exchange,
        client_token: &str,
    ) -> Result<StatusReport, BrokerError> {
        let placed = self.placed.lock().unwrap();
        match placed.iter().find(|p| p.client_token == client_token) {
            Some(order) => Ok(StatusReport {
                status: OrderStatus::Filled,
                exchange_order_id: Some(format!("X{}", order.broker_order_id)),
                filled_quantity: order.quantity,
                average_price: Some(dec!(100)),
                message: Some("Fully Executed".to_string()),
            }),
            None => Err(BrokerError::Permanent("order not known".to_string())),
        }
    }

    async fn modify(
        &self,
        _session: &BrokerSession,
        broker_order_id: &str,
        _diff: &OrderDiff,
    ) -> Result<OrderStatus, BrokerError> {
        let placed = self.placed.lock().unwrap();
        if placed.iter().any(|p| p.broker_order_id == broker_order_id) {
            Ok(OrderStatus::Submitted)
        } else {
            Err(BrokerError::Permanent("order not known".to_string()))
        }
    }

    async fn cancel(
        &self,
        _session: &BrokerSession,
        broker_order_id: &str,
    ) -> Result<OrderStatus, BrokerError> {
        let placed = self.placed.lock().unwrap();
        if placed.iter().any(|p| p.broker_order_id == broker_order_id) {
            Ok(OrderStatus::Cancelled)
        } else {
            Err(BrokerError::Permanent("order not known".to_string()))
        }
    }

    async fn positions(
        &self,
        _session: &BrokerSession,
    ) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(Vec::new())
    }

    async fn margin(&self, _session: &BrokerSession) -> Result<MarginSnapshot, BrokerError> {
        Ok(MarginSnapshot {
            available: Decimal::MAX,
            utilized: Decimal::ZERO,
        })
    }

    async fn ping(&self) -> Result<Duration, BrokerError> {
        Ok(self.base_latency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderKind, OrderSide, ProductKind, Validity};
    use crate::session::BrokerCredentials;
    use chrono::Utc;

    fn session(account: &str) -> BrokerSession {
        BrokerSession {
            account_id: account.to_string(),
            credentials: BrokerCredentials {
                client_code: account.to_string(),
                user_id: "u".to_string(),
                password: "p".to_string(),
                api_key: "k".to_string(),
                app_name: "copyrelay".to_string(),
                app_version: "1.0.0".to_string(),
                public_ip: "203.0.113.7".to_string(),
            },
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(8),
        }
    }

    fn spec(token: &str) -> OrderSpec {
        OrderSpec {
            exchange: Exchange::Nse,
            segment: "C".to_string(),
            scrip_code: 2885,
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            quantity: 10,
            limit_price: None,
            trigger_price: None,
            product: ProductKind::Intraday,
            validity: Validity::Day,
            client_token: token.to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_token_returns_original_ack() {
        let broker = MockBroker::new();
        let s = session("F1");
        let first = broker.place(&s, &spec("tok")).await.unwrap();
        let second = broker.place(&s, &spec("tok")).await.unwrap();
        assert_eq!(first.broker_order_id, second.broker_order_id);
        assert_eq!(broker.placed().len(), 1);
    }

    #[tokio::test]
    async fn transient_failures_consume_then_succeed() {
        let broker = MockBroker::new();
        broker.fail_transient("F1", 1);
        let s = session("F1");
        let err = broker.place(&s, &spec("t1")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(broker.place(&s, &spec("t1")).await.is_ok());
    }

    #[tokio::test]
    async fn rejected_account_gets_rms_message() {
        let broker = MockBroker::new();
        broker.reject_account("F1", "Insufficient margin");
        let ack = broker.place(&session("F1"), &spec("t1")).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Rejected);
        assert_eq!(ack.message.as_deref(), Some("Insufficient margin"));
    }

    #[tokio::test]
    async fn modify_cancel_and_snapshots() {
        let broker = MockBroker::new();
        let s = session("F1");
        let ack = broker.place(&s, &spec("t1")).await.unwrap();

        assert_eq!(
            broker
                .modify(&s, &ack.broker_order_id, &OrderDiff::default())
                .await
                .unwrap(),
            OrderStatus::Submitted
        );
        assert_eq!(
            broker.cancel(&s, &ack.broker_order_id).await.unwrap(),
            OrderStatus::Cancelled
        );
        assert!(broker.cancel(&s, "nope").await.is_err());

        assert!(broker.positions(&s).await.unwrap().is_empty());
        let margin = broker.margin(&s).await.unwrap();
        assert!(margin.available > margin.utilized);
        assert!(broker.ping().await.is_ok());
    }

    #[tokio::test]
    async fn status_reports_fill_for_placed_orders() {
        let broker = MockBroker::new();
        let s = session("F1");
        broker.place(&s, &spec("t1")).await.unwrap();
        let report = broker.status(&s, 2885, Exchange::Nse, "t1").await.unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.filled_quantity, 10);
        assert!(broker.status(&s, 2885, Exchange::Nse, "zzz").await.is_err());
    }
}
