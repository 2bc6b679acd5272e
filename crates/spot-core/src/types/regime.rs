//! Market regime classification types.
//!
//! Regime classification itself is an external concern; the core only
//! consumes its output.

use serde::{Deserialize, Serialize};

/// Coarse classification of current market behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    BullTrend,
    BearTrend,
    Sideways,
    HighVolatility,
}

impl MarketRegime {
    pub fn name(&self) -> &'static str {
        match self {
            MarketRegime::BullTrend => "bull_trend",
            MarketRegime::BearTrend => "bear_trend",
            MarketRegime::Sideways => "sideways",
            MarketRegime::HighVolatility => "high_volatility",
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One regime classification sample from the indicator provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSample {
    pub regime: MarketRegime,
    /// Trend strength (ADX).
    pub adx: f64,
    /// ATR as a percentage of price.
    pub atr_pct: f64,
    /// Classifier confidence, 0.0 to 1.0.
    pub confidence: f64,
}

impl RegimeSample {
    pub fn new(regime: MarketRegime, adx: f64, atr_pct: f64, confidence: f64) -> Self {
        Self {
            regime,
            adx,
            atr_pct,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}
