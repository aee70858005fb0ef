//! Follower links: who copies whom, and how quantities are derived.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Rule mapping a master order quantity to a follower quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CopyPolicy {
    /// Follower quantity = master quantity x ratio, floored to lot size.
    FixedRatio { ratio: Decimal },
    /// Follower quantity derived from a percentage of the follower's
    /// available balance at the reference price.
    Percentage { percent: Decimal },
    /// Always the same quantity, regardless of the master's.
    FixedQuantity { quantity: i64 },
}

impl CopyPolicy {
    /// Policy parameters must be positive (percent additionally <= 100).
    pub fn validate(&self) -> Result<(), String> {
        match self {
            CopyPolicy::FixedRatio { ratio } => {
                if *ratio <= Decimal::ZERO {
                    return Err(format!("ratio must be positive, got {ratio}"));
                }
            }
            CopyPolicy::Percentage { percent } => {
                if *percent <= Decimal::ZERO || *percent > Decimal::from(100) {
                    return Err(format!("percent must be in (0, 100], got {percent}"));
                }
            }
            CopyPolicy::FixedQuantity { quantity } => {
                if *quantity <= 0 {
                    return Err(format!("quantity must be positive, got {quantity}"));
                }
            }
        }
        Ok(())
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            CopyPolicy::FixedRatio { .. } => "FIXED_RATIO",
            CopyPolicy::Percentage { .. } => "PERCENTAGE",
            CopyPolicy::FixedQuantity { .. } => "FIXED_QUANTITY",
        }
    }
}

/// An active master -> follower relation with its copy policy and per-link
/// risk overrides. At most one active link exists per (master, follower).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerLink {
    pub master: String,
    pub follower: String,
    pub policy: CopyPolicy,
    /// Cap on a single derived order's notional. None = no per-link cap.
    pub max_order_notional: Option<Decimal>,
    /// Per-link narrowing of the account's daily loss limit.
    pub max_daily_loss: Option<Decimal>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}
