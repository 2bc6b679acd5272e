//! Trading signals and the per-tick market snapshot strategies consume.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::market::Candle;
use super::regime::RegimeSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// A strategy's verdict for one market at one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub action: SignalAction,
    /// 0.0 to 100.0; scales position size for buys.
    pub confidence: f64,
    pub reason: String,
    pub generated_at: DateTime<Utc>,
}

impl TradeSignal {
    pub fn new(action: SignalAction, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            action,
            confidence: confidence.clamp(0.0, 100.0),
            reason: reason.into(),
            generated_at: Utc::now(),
        }
    }

    /// HOLD is the universal "nothing to do / not enough data" answer.
    pub fn hold(reason: impl Into<String>) -> Self {
        Self::new(SignalAction::Hold, 0.0, reason)
    }

    pub fn is_buy(&self) -> bool {
        self.action == SignalAction::Buy
    }

    pub fn is_sell(&self) -> bool {
        self.action == SignalAction::Sell
    }
}

/// Indicator outputs computed by the external indicator library.
///
/// All fields are optional: a missing value means the indicator could not be
/// computed (insufficient history) and strategies must degrade to HOLD.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub bollinger_upper: Option<Decimal>,
    pub bollinger_middle: Option<Decimal>,
    pub bollinger_lower: Option<Decimal>,
    pub atr_pct: Option<f64>,
}

/// Everything a strategy sees for one market on one evaluation tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub market: String,
    pub last_price: Decimal,
    /// Most recent candles, oldest first. The last entry is the live
    /// (1-minute) candle used for short-term volatility checks.
    pub candles: Vec<Candle>,
    pub indicators: IndicatorSet,
    pub regime: RegimeSample,
    pub taken_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// The in-progress 1-minute candle, if the provider supplied any.
    pub fn latest_candle(&self) -> Option<&Candle> {
        self.candles.last()
    }
}
