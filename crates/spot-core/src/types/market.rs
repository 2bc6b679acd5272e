//! Market data types: order books, candles, balances.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single price level in an order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl OrderBookLevel {
    /// Notional value of this level in quote currency.
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

/// Snapshot of an order book for one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub market: String,
    /// Bids, best (highest) first.
    pub bids: Vec<OrderBookLevel>,
    /// Asks, best (lowest) first.
    pub asks: Vec<OrderBookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<&OrderBookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&OrderBookLevel> {
        self.asks.first()
    }

    /// Bid/ask spread as a percentage of the best ask.
    /// Returns None when either side is empty.
    pub fn spread_pct(&self) -> Option<Decimal> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        if ask <= Decimal::ZERO {
            return None;
        }
        Some((ask - bid) / ask * Decimal::ONE_HUNDRED)
    }

    /// Total quote-currency depth of the top `levels` ask levels.
    pub fn ask_depth(&self, levels: usize) -> Decimal {
        self.asks.iter().take(levels).map(|l| l.notional()).sum()
    }

    /// Total quote-currency depth of the top `levels` bid levels.
    pub fn bid_depth(&self, levels: usize) -> Decimal {
        self.bids.iter().take(levels).map(|l| l.notional()).sum()
    }

    /// Bid depth minus ask depth over their sum, in [-1, 1].
    /// Positive values mean buy-side pressure. Informational only.
    pub fn imbalance(&self, levels: usize) -> Decimal {
        let bid = self.bid_depth(levels);
        let ask = self.ask_depth(levels);
        let total = bid + ask;
        if total <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (bid - ask) / total
    }
}

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub market: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Candle {
    /// High-to-low range as a percentage of the low.
    /// Zero when the low is zero (degenerate data).
    pub fn range_pct(&self) -> Decimal {
        if self.low <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.high - self.low) / self.low * Decimal::ONE_HUNDRED
    }
}

/// Account balance for one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    /// Asset code, e.g. "BTC" or "KRW".
    pub asset: String,
    /// Amount available for new orders.
    pub available: Decimal,
    /// Amount locked in open orders.
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}
