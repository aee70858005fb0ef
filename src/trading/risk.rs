//! Pre-trade risk gate consulted for every follower order.

use rust_decimal::Decimal;

use crate::db::{AccountRecord, Database, StoreError};
use crate::models::{DenyReason, FollowerLink, OrderSide, RiskEnvelope};

/// Gate verdict. Denials are recorded outcomes, not alarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

/// The order shape the gate evaluates: enough to price the proposal.
#[derive(Debug, Clone)]
pub struct ProposedOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    /// Limit price, or the last-known mark for market orders.
    pub reference_price: Option<Decimal>,
}

impl ProposedOrder {
    fn notional(&self) -> Option<Decimal> {
        self.reference_price
            .map(|p| p * Decimal::from(self.quantity))
    }
}

/// Computes account state at call time and applies the narrowed envelope.
#[derive(Clone)]
pub struct RiskGate {
    db: Database,
    defaults: RiskEnvelope,
}

impl RiskGate {
    pub fn new(db: Database, defaults: RiskEnvelope) -> Self {
        Self { db, defaults }
    }

    /// Resolve the envelope for an account under a link: system default,
    /// narrowed by account overrides, narrowed by the link.
    pub fn envelope_for(&self, account: &AccountRecord, link: &FollowerLink) -> RiskEnvelope {
        let mut env = self.defaults.clone();
        if let Some(v) = account.max_daily_loss {
            env.max_daily_loss = env.max_daily_loss.min(v);
        }
        if let Some(v) = account.max_drawdown_pct {
            env.max_drawdown_pct = env.max_drawdown_pct.min(v);
        }
        if let Some(v) = account.max_position_notional {
            env.max_position_notional = env.max_position_notional.min(v);
        }
        if let Some(v) = account.max_open_positions {
            env.max_open_positions = env.max_open_positions.min(v);
        }
        if let Some(v) = account.max_exposure {
            env.max_exposure = env.max_exposure.min(v);
        }
        env.narrowed_by(link)
    }

    /// Check a proposed order against the envelope using the account's
    /// state as of now: realized daily PnL, open positions and exposure,
    /// and the session balance drawdown.
    pub async fn check(
        &self,
        account: &AccountRecord,
        proposed: &ProposedOrder,
        envelope: &RiskEnvelope,
    ) -> Result<Decision, StoreError> {
        // Realized daily loss.
        let pnl = self.db.daily_realized_pnl(&account.account_id).await?;
        if pnl < Decimal::ZERO && -pnl >= envelope.max_daily_loss {
            return Ok(Decision::Deny(DenyReason::DailyLossBreached));
        }

        // Peak-to-trough drawdown over today's balance series.
        let series = self.db.balance_series(&account.account_id).await?;
        if let Some(drawdown) = peak_to_trough(&series) {
            if drawdown >= envelope.max_drawdown_pct {
                return Ok(Decision::Deny(DenyReason::DrawdownBreached));
            }
        }

        // Single order notional.
        if let Some(notional) = proposed.notional() {
            if notional > envelope.max_position_notional {
                return Ok(Decision::Deny(DenyReason::PositionSizeBreached));
            }
        }

        // Open position count; adding to an existing position is fine.
        let positions = self.db.open_positions(&account.account_id).await?;
        let holds_symbol = positions.iter().any(|p| p.symbol == proposed.symbol);
        if !holds_symbol && positions.len() as u32 >= envelope.max_open_positions {
            return Ok(Decision::Deny(DenyReason::PositionCountBreached));
        }

        // Aggregate exposure including this order.
        let exposure: Decimal = positions
            .iter()
            .map(|p| Decimal::from(p.quantity.abs()) * p.last_mark)
            .sum();
        let added = proposed.notional().unwrap_or(Decimal::ZERO);
        if exposure + added > envelope.max_exposure {
            return Ok(Decision::Deny(DenyReason::ExposureBreached));
        }

        // Buys need the cash.
        if proposed.side == OrderSide::Buy {
            if let Some(notional) = proposed.notional() {
                if notional > account.balance {
                    return Ok(Decision::Deny(DenyReason::InsufficientBalance));
                }
            }
        }

        Ok(Decision::Allow)
    }
}

/// Largest peak-to-trough decline as a fraction of the peak.
fn peak_to_trough(series: &[Decimal]) -> Option<Decimal> {
    let mut peak = *series.first()?;
    let mut worst = Decimal::ZERO;
    for value in series {
        if *value > peak {
            peak = *value;
        } else if peak > Decimal::ZERO {
            worst = worst.max((peak - *value) / peak);
        }
    }
    Some(worst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StatusUpdate;
    use crate::models::{
        CopyPolicy, Exchange, OrderDraft, OrderKind, OrderStatus, ProductKind, Validity,
    };
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn account(balance: Decimal) -> AccountRecord {
        AccountRecord {
            account_id: "F1".to_string(),
            sealed_credentials: String::new(),
            balance,
            max_daily_loss: None,
            max_drawdown_pct: None,
            max_position_notional: None,
            max_open_positions: None,
            max_exposure: None,
        }
    }

    fn proposed(side: OrderSide, quantity: i64, price: Decimal) -> ProposedOrder {
        ProposedOrder {
            symbol: "RELIANCE".to_string(),
            side,
            quantity,
            reference_price: Some(price),
        }
    }

    async fn seed_loss(db: &Database, account_id: &str, loss: Decimal) {
        // A filled buy with no offsetting sell realizes a daily loss equal
        // to its notional.
        let order = db
            .create_order(&OrderDraft {
                owner: account_id.to_string(),
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
        db.append_status(order.id, StatusUpdate::to(OrderStatus::Submitted))
            .await
            .unwrap();
        db.append_status(
            order.id,
            StatusUpdate {
                status: Some(OrderStatus::Filled),
                filled_quantity: Some(1),
                average_price: Some(loss),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    fn any_link() -> FollowerLink {
        FollowerLink {
            master: "MA".to_string(),
            follower: "F1".to_string(),
            policy: CopyPolicy::FixedRatio { ratio: dec!(1) },
            max_order_notional: None,
            max_daily_loss: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn clean_account_is_allowed() {
        let db = Database::in_memory().await.unwrap();
        db.save_account(&account(dec!(100000))).await.unwrap();
        let gate = RiskGate::new(db, RiskEnvelope::default());
        let decision = gate
            .check(
                &account(dec!(100000)),
                &proposed(OrderSide::Buy, 10, dec!(2500)),
                &RiskEnvelope::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow);
    }

    #[tokio::test]
    async fn daily_loss_breach_denies() {
        let db = Database::in_memory().await.unwrap();
        db.save_account(&account(dec!(10000000))).await.unwrap();
        seed_loss(&db, "F1", dec!(60000)).await;

        let gate = RiskGate::new(db, RiskEnvelope::default());
        // Default max daily loss is 50000; realized loss is 60000.
        let decision = gate
            .check(
                &account(dec!(10000000)),
                &proposed(OrderSide::Buy, 1, dec!(100)),
                &RiskEnvelope::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::DailyLossBreached));
    }

    #[tokio::test]
    async fn oversized_order_denies() {
        let db = Database::in_memory().await.unwrap();
        let gate = RiskGate::new(db, RiskEnvelope::default());
        let envelope = RiskEnvelope {
            max_position_notional: dec!(10000),
            ..RiskEnvelope::default()
        };
        let decision = gate
            .check(
                &account(dec!(10000000)),
                &proposed(OrderSide::Buy, 100, dec!(2500)),
                &envelope,
            )
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::PositionSizeBreached));
    }

    #[tokio::test]
    async fn buy_without_balance_denies() {
        let db = Database::in_memory().await.unwrap();
        let gate = RiskGate::new(db, RiskEnvelope::default());
        let decision = gate
            .check(
                &account(dec!(1000)),
                &proposed(OrderSide::Buy, 10, dec!(2500)),
                &RiskEnvelope::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::InsufficientBalance));

        // Sells do not need cash.
        let decision = gate
            .check(
                &account(dec!(1000)),
                &proposed(OrderSide::Sell, 10, dec!(2500)),
                &RiskEnvelope::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow);
    }

    #[tokio::test]
    async fn envelope_precedence_narrowest_wins() {
        let db = Database::in_memory().await.unwrap();
        let gate = RiskGate::new(db, RiskEnvelope::default());

        let mut acct = account(dec!(100000));
        acct.max_daily_loss = Some(dec!(20000));
        let mut link = any_link();
        link.max_daily_loss = Some(dec!(5000));

        let env = gate.envelope_for(&acct, &link);
        assert_eq!(env.max_daily_loss, dec!(5000));

        // Account narrower than link: account wins.
        let mut link = any_link();
        link.max_daily_loss = Some(dec!(90000));
        let env = gate.envelope_for(&acct, &link);
        assert_eq!(env.max_daily_loss, dec!(20000));
    }

    #[test]
    fn drawdown_math() {
        assert_eq!(peak_to_trough(&[]), None);
        assert_eq!(
            peak_to_trough(&[dec!(100), dec!(110), dec!(120)]),
            Some(dec!(0))
        );
        // 120 -> 90 is a 25% decline.
        assert_eq!(
            peak_to_trough(&[dec!(100), dec!(120), dec!(90), dec!(110)]),
            Some(dec!(0.25))
        );
    }
}
