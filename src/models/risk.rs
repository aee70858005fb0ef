//! Per-account pre-trade risk limits.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::link::FollowerLink;

/// Why the risk gate denied a proposed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    DailyLossBreached,
    DrawdownBreached,
    PositionCountBreached,
    PositionSizeBreached,
    ExposureBreached,
    InsufficientBalance,
}

/// Pre-trade limits for one account.
///
/// Limits resolve narrowest-wins: a per-link override narrows the account
/// envelope, which narrows the system default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEnvelope {
    /// Max realized loss per trading day before new orders are denied.
    pub max_daily_loss: Decimal,
    /// Max peak-to-trough drawdown fraction of the session balance series.
    pub max_drawdown_pct: Decimal,
    /// Max notional for a single position.
    pub max_position_notional: Decimal,
    /// Max number of simultaneously open positions.
    pub max_open_positions: u32,
    /// Max aggregate exposure across all open positions.
    pub max_exposure: Decimal,
    /// Require a stop-loss leg on every order.
    pub require_stop_loss: bool,
}

impl Default for RiskEnvelope {
    fn default() -> Self {
        Self {
            max_daily_loss: dec!(50000),
            max_drawdown_pct: dec!(0.20),
            max_position_notional: dec!(1000000),
            max_open_positions: 20,
            max_exposure: dec!(5000000),
            require_stop_loss: false,
        }
    }
}

impl RiskEnvelope {
    /// Narrow this envelope with a follower link's overrides.
    pub fn narrowed_by(&self, link: &FollowerLink) -> Self {
        let mut out = self.clone();
        if let Some(loss) = link.max_daily_loss {
            out.max_daily_loss = out.max_daily_loss.min(loss);
        }
        if let Some(notional) = link.max_order_notional {
            out.max_position_notional = out.max_position_notional.min(notional);
        }
        out
    }
}
