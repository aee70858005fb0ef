//! Broker adapter contract: one-shot calls against an authenticated
//! session, typed errors, canonical status mapping.
//!
//! The adapter never retries `place` on its own; retry policy and the
//! idempotency token belong to the dispatcher. The only internal recovery
//! is a single re-authentication after an HTTP 401.

pub mod iifl;
pub mod mock;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{Exchange, OrderKind, OrderSide, OrderStatus, ProductKind, Validity};
use crate::session::BrokerSession;

/// Errors surfaced by a broker adapter.
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    /// HTTP 429 or transient 5xx; the dispatcher may retry with backoff.
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Definitive 4xx or broker-level rejection; retrying cannot help.
    #[error("permanent broker error: {0}")]
    Permanent(String),

    /// The call did not complete within its deadline. The order may still
    /// have been accepted upstream.
    #[error("broker call timed out")]
    Timeout,

    /// Authentication failed even after the one allowed refresh.
    #[error("invalid broker credentials")]
    InvalidCredentials,
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

/// Everything the broker needs to place one order. The `client_token` is
/// the follower order id, forwarded so duplicate submissions are
/// recognizable upstream.
#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub exchange: Exchange,
    pub segment: String,
    pub scrip_code: i64,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: i64,
    pub limit_price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub product: ProductKind,
    pub validity: Validity,
    pub client_token: String,
}

/// Broker acknowledgment of a placed order.
#[derive(Debug, Clone)]
pub struct PlaceAck {
    pub broker_order_id: String,
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    pub message: Option<String>,
}

/// Point-in-time status of a broker order.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: OrderStatus,
    pub exchange_order_id: Option<String>,
    pub filled_quantity: i64,
    pub average_price: Option<Decimal>,
    pub message: Option<String>,
}

/// Open position as the broker reports it.
#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub symbol: String,
    pub exchange: Exchange,
    pub quantity: i64,
    pub mark: Decimal,
}

/// Account margin snapshot.
#[derive(Debug, Clone)]
pub struct MarginSnapshot {
    pub available: Decimal,
    pub utilized: Decimal,
}

/// Fields a modify may change on a resting order.
#[derive(Debug, Clone, Default)]
pub struct OrderDiff {
    pub quantity: Option<i64>,
    pub limit_price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
}

/// Capability set over a broker session.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Place an order. One-shot: no internal retry.
    async fn place(&self, session: &BrokerSession, spec: &OrderSpec)
        -> Result<PlaceAck, BrokerError>;

    /// Query status by the client token used at placement.
    async fn status(
        &self,
        session: &BrokerSession,
        scrip_code: i64,
        exchange: Exchange,
        client_token: &str,
    ) -> Result<StatusReport, BrokerError>;

    /// Modify a resting order.
    async fn modify(
        &self,
        session: &BrokerSession,
        broker_order_id: &str,
        diff: &OrderDiff,
    ) -> Result<OrderStatus, BrokerError>;

    /// Cancel a resting order.
    async fn cancel(
        &self,
        session: &BrokerSession,
        broker_order_id: &str,
    ) -> Result<OrderStatus, BrokerError>;

    /// Open positions for the session's account.
    async fn positions(&self, session: &BrokerSession)
        -> Result<Vec<BrokerPosition>, BrokerError>;

    /// Margin available to the session's account.
    async fn margin(&self, session: &BrokerSession) -> Result<MarginSnapshot, BrokerError>;

    /// Round-trip latency probe.
    async fn ping(&self) -> Result<std::time::Duration, BrokerError>;
}
