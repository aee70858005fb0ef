//! Order model: master and follower orders with their status lifecycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopMarket,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
            OrderKind::Stop => "STOP",
            OrderKind::StopMarket => "STOP_MARKET",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "MARKET" => Some(OrderKind::Market),
            "LIMIT" => Some(OrderKind::Limit),
            "STOP" => Some(OrderKind::Stop),
            "STOP_MARKET" => Some(OrderKind::StopMarket),
            _ => None,
        }
    }

    /// Whether this kind carries a trigger price.
    pub fn has_trigger(&self) -> bool {
        matches!(self, OrderKind::Stop | OrderKind::StopMarket)
    }
}

/// Exchange the order is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    Nse,
    Bse,
    Mcx,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Nse => "NSE",
            Exchange::Bse => "BSE",
            Exchange::Mcx => "MCX",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NSE" => Some(Exchange::Nse),
            "BSE" => Some(Exchange::Bse),
            "MCX" => Some(Exchange::Mcx),
            _ => None,
        }
    }

    /// Single-letter exchange code on the broker wire.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Exchange::Nse => "N",
            Exchange::Bse => "B",
            Exchange::Mcx => "M",
        }
    }
}

/// Product type: intraday positions square off the same day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductKind {
    Intraday,
    Delivery,
    Carryforward,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Intraday => "INTRADAY",
            ProductKind::Delivery => "DELIVERY",
            ProductKind::Carryforward => "CARRYFORWARD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "INTRADAY" => Some(ProductKind::Intraday),
            "DELIVERY" => Some(ProductKind::Delivery),
            "CARRYFORWARD" => Some(ProductKind::Carryforward),
            _ => None,
        }
    }
}

/// Time-in-force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Validity {
    Day,
    Ioc,
    GoodTillDate,
}

impl Validity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Validity::Day => "DAY",
            Validity::Ioc => "IOC",
            Validity::GoodTillDate => "GTD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "DAY" => Some(Validity::Day),
            "IOC" => Some(Validity::Ioc),
            "GTD" => Some(Validity::GoodTillDate),
            _ => None,
        }
    }

    /// Integer validity code on the broker wire (0=Day, 1=GTD, 3=IOC).
    pub fn wire_code(&self) -> i32 {
        match self {
            Validity::Day => 0,
            Validity::GoodTillDate => 1,
            Validity::Ioc => 3,
        }
    }
}

/// Order lifecycle status.
///
/// Transitions are monotonic: once an order reaches a terminal state it
/// never moves again. `Unknown` marks an order whose broker call timed out
/// mid-flight; the reconciler resolves it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
    Unknown,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(OrderStatus::Pending),
            "SUBMITTED" => Some(OrderStatus::Submitted),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "UNKNOWN" => Some(OrderStatus::Unknown),
            _ => None,
        }
    }

    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal forward move in the lifecycle.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if *self == next {
            return false;
        }
        match self {
            Pending => matches!(next, Submitted | Rejected | Cancelled | Unknown),
            Submitted => matches!(
                next,
                PartiallyFilled | Filled | Rejected | Cancelled | Unknown
            ),
            PartiallyFilled => matches!(next, Filled | Cancelled),
            // Reconciler resolves Unknown to whatever the broker reports.
            Unknown => matches!(
                next,
                Submitted | PartiallyFilled | Filled | Rejected | Cancelled
            ),
            Filled | Rejected | Cancelled => false,
        }
    }
}

/// A persisted order, master or follower.
///
/// A follower order carries `parent_id` referencing the master order it was
/// derived from and must share its side, symbol and kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub owner: String,
    pub strategy_id: Option<String>,
    pub parent_id: Option<Uuid>,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub symbol: String,
    pub exchange: Exchange,
    pub quantity: i64,
    pub limit_price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub product: ProductKind,
    pub validity: Validity,
    pub status: OrderStatus,
    pub broker_order_id: Option<String>,
    pub exchange_order_id: Option<String>,
    pub message: Option<String>,
    /// Bumped on every accepted status append; used for optimistic writes.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Whether the order is far enough along for followers to copy it.
    pub fn is_replicable(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Submitted | OrderStatus::PartiallyFilled | OrderStatus::Filled
        )
    }
}

/// Fields needed to create an order row; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub owner: String,
    pub strategy_id: Option<String>,
    pub parent_id: Option<Uuid>,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub symbol: String,
    pub exchange: Exchange,
    pub quantity: i64,
    pub limit_price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub product: ProductKind,
    pub validity: Validity,
}

impl OrderDraft {
    /// Derive a follower draft from a master order, preserving everything
    /// but owner and quantity.
    pub fn follower_of(master: &Order, owner: &str, quantity: i64) -> Self {
        Self {
            owner: owner.to_string(),
            strategy_id: master.strategy_id.clone(),
            parent_id: Some(master.id),
            side: master.side,
            kind: master.kind,
            symbol: master.symbol.clone(),
            exchange: master.exchange,
            quantity,
            limit_price: master.limit_price,
            trigger_price: master.trigger_price,
            product: master.product,
            validity: master.validity,
        }
    }
}
