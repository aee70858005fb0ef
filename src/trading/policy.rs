//! Copy-policy transform: derive a follower quantity from a master order.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::{CopyPolicy, FollowerLink, InstrumentCode, Order, SkipReason};

/// Result of applying a link's policy to a master order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Place this many units for the follower.
    Quantity(i64),
    Skip(SkipReason),
}

/// Derive the follower quantity for one link.
///
/// Deterministic in (master, link, reference price, lot size): no clock, no
/// randomness. Quantities floor to the instrument lot size; a zero result
/// short-circuits to a skip, and a notional above the link's per-order cap
/// skips with `LinkNotionalCap`.
///
/// `reference_price` is the master's limit price when set, otherwise the
/// last-known mark; `available_balance` is the follower's spendable balance
/// for the percentage policy.
pub fn derive_quantity(
    master: &Order,
    link: &FollowerLink,
    instrument: &InstrumentCode,
    available_balance: Decimal,
    reference_price: Option<Decimal>,
) -> Transform {
    let raw = match &link.policy {
        CopyPolicy::FixedRatio { ratio } => (Decimal::from(master.quantity) * ratio)
            .round()
            .to_i64()
            .unwrap_or(0),
        CopyPolicy::Percentage { percent } => {
            let Some(price) = reference_price.filter(|p| *p > Decimal::ZERO) else {
                return Transform::Skip(SkipReason::TooSmall);
            };
            let budget = available_balance * percent / Decimal::from(100);
            (budget / price).floor().to_i64().unwrap_or(0)
        }
        CopyPolicy::FixedQuantity { quantity } => *quantity,
    };

    let quantity = instrument.floor_to_lot(raw);
    if quantity <= 0 {
        return Transform::Skip(SkipReason::TooSmall);
    }

    if let (Some(cap), Some(price)) = (link.max_order_notional, reference_price) {
        if Decimal::from(quantity) * price > cap {
            return Transform::Skip(SkipReason::LinkNotionalCap);
        }
    }

    Transform::Quantity(quantity)
}
