//! Closed-trade records for the append-only ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One completed round trip, as appended to the trade ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub market: String,
    pub strategy: String,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    /// Realized PnL in quote currency.
    pub pnl: Decimal,
    /// Realized PnL as percent of entry notional.
    pub pnl_pct: Decimal,
    pub entered_at: DateTime<Utc>,
    pub exited_at: DateTime<Utc>,
    /// Why the position was exited (stop loss, take profit, ...).
    pub exit_reason: String,
}

impl TradeRecord {
    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }

    pub fn is_loss(&self) -> bool {
        self.pnl < Decimal::ZERO
    }
}
