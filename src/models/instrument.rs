//! Broker instrument codes for tradable securities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::order::Exchange;

/// Mapping of (symbol, exchange) to the broker's numeric scrip code.
///
/// Populated offline from the broker's instrument dump and refreshed out of
/// band; (symbol, exchange) is unique while `active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentCode {
    pub symbol: String,
    pub exchange: Exchange,
    /// Exchange segment on the broker wire: C=Cash, D=Derivative, U=Currency.
    pub segment: String,
    pub scrip_code: i64,
    pub lot_size: i64,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl InstrumentCode {
    /// Floor a quantity to a whole number of lots. Zero when below one lot.
    pub fn floor_to_lot(&self, quantity: i64) -> i64 {
        if self.lot_size <= 1 {
            return quantity.max(0);
        }
        (quantity.max(0) / self.lot_size) * self.lot_size
    }
}
