//! Trading strategies.
//!
//! Strategies are pure signal generators: they read a `MarketSnapshot`
//! (price, candles, pre-computed indicators, regime) and emit BUY / SELL /
//! HOLD with a confidence score. No sizing, no risk checks, no I/O here.
//! Missing data always degrades to HOLD, never to an error.

use rust_decimal::Decimal;
use std::sync::Arc;

use spot_core::types::{MarketRegime, MarketSnapshot, SignalAction, TradeSignal};

/// A signal generator for one style of market.
pub trait Strategy: Send + Sync {
    /// Stable identifier used in the ledger and persisted selections.
    fn name(&self) -> &'static str;

    fn describe(&self) -> &'static str;

    /// Whether this strategy is designed for the given regime.
    fn is_suitable_for(&self, regime: MarketRegime) -> bool;

    fn analyze(&self, snapshot: &MarketSnapshot) -> TradeSignal;
}

/// All strategies the selector may activate, most aggressive first.
pub fn default_strategies() -> Vec<Arc<dyn Strategy>> {
    vec![
        Arc::new(TrendFollowStrategy::default()),
        Arc::new(MeanReversionStrategy::default()),
        Arc::new(DcaStrategy::default()),
    ]
}

/// Rides confirmed uptrends: MACD above its signal line with RSI in a
/// healthy (not overbought) band.
pub struct TrendFollowStrategy {
    rsi_entry_max: f64,
    rsi_exit: f64,
}

impl Default for TrendFollowStrategy {
    fn default() -> Self {
        Self {
            rsi_entry_max: 70.0,
            rsi_exit: 80.0,
        }
    }
}

impl Strategy for TrendFollowStrategy {
    fn name(&self) -> &'static str {
        "trend_follow"
    }

    fn describe(&self) -> &'static str {
        "MACD crossover trend following for bull trends"
    }

    fn is_suitable_for(&self, regime: MarketRegime) -> bool {
        regime == MarketRegime::BullTrend
    }

    fn analyze(&self, snapshot: &MarketSnapshot) -> TradeSignal {
        let ind = &snapshot.indicators;
        let (Some(rsi), Some(macd), Some(macd_signal)) = (ind.rsi, ind.macd, ind.macd_signal)
        else {
            return TradeSignal::hold("indicators unavailable");
        };

        if rsi >= self.rsi_exit {
            return TradeSignal::new(
                SignalAction::Sell,
                70.0,
                format!("momentum exhausted: RSI {rsi:.1}"),
            );
        }
        if macd < macd_signal {
            return TradeSignal::new(
                SignalAction::Sell,
                55.0,
                "MACD crossed below signal line",
            );
        }

        let histogram = macd - macd_signal;
        if histogram > 0.0 && rsi < self.rsi_entry_max {
            // Wider histogram and cooler RSI score higher.
            let confidence = 50.0 + (self.rsi_entry_max - rsi).min(20.0) + histogram.min(10.0);
            return TradeSignal::new(
                SignalAction::Buy,
                confidence,
                format!("uptrend intact: MACD above signal, RSI {rsi:.1}"),
            );
        }

        TradeSignal::hold("no trend entry setup")
    }
}

/// Fades moves to the Bollinger extremes in a range-bound market.
pub struct MeanReversionStrategy {
    rsi_oversold: f64,
    rsi_overbought: f64,
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self {
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
        }
    }
}

impl Strategy for MeanReversionStrategy {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn describe(&self) -> &'static str {
        "Bollinger band mean reversion for sideways markets"
    }

    fn is_suitable_for(&self, regime: MarketRegime) -> bool {
        regime == MarketRegime::Sideways
    }

    fn analyze(&self, snapshot: &MarketSnapshot) -> TradeSignal {
        let ind = &snapshot.indicators;
        let (Some(rsi), Some(lower), Some(middle), Some(upper)) = (
            ind.rsi,
            ind.bollinger_lower,
            ind.bollinger_middle,
            ind.bollinger_upper,
        ) else {
            return TradeSignal::hold("indicators unavailable");
        };
        let price = snapshot.last_price;
        if upper <= lower {
            return TradeSignal::hold("degenerate bollinger band");
        }

        if price <= lower && rsi <= self.rsi_oversold {
            let confidence = 55.0 + (self.rsi_oversold - rsi).min(25.0);
            return TradeSignal::new(
                SignalAction::Buy,
                confidence,
                format!("at lower band with RSI {rsi:.1}"),
            );
        }
        if price >= upper || rsi >= self.rsi_overbought {
            return TradeSignal::new(
                SignalAction::Sell,
                60.0,
                "reverted to upper band",
            );
        }
        if price >= middle && rsi > 55.0 {
            return TradeSignal::new(SignalAction::Sell, 45.0, "reverted past mid band");
        }

        TradeSignal::hold("inside the band")
    }
}

/// Defensive fallback: small periodic accumulation on dips, never sells on
/// its own signal. Used when regime confidence is too low for a directional
/// strategy.
pub struct DcaStrategy {
    /// Buy only when price sits this far (%) under the rolling candle mean.
    dip_pct: Decimal,
    lookback: usize,
}

impl Default for DcaStrategy {
    fn default() -> Self {
        Self {
            dip_pct: Decimal::ONE,
            lookback: 24,
        }
    }
}

impl Strategy for DcaStrategy {
    fn name(&self) -> &'static str {
        "dca"
    }

    fn describe(&self) -> &'static str {
        "Defensive dollar-cost averaging on dips"
    }

    fn is_suitable_for(&self, _regime: MarketRegime) -> bool {
        // Acceptable everywhere; it is the fallback of last resort.
        true
    }

    fn analyze(&self, snapshot: &MarketSnapshot) -> TradeSignal {
        if snapshot.candles.len() < self.lookback {
            return TradeSignal::hold("not enough candle history");
        }

        let recent = &snapshot.candles[snapshot.candles.len() - self.lookback..];
        let sum: Decimal = recent.iter().map(|c| c.close).sum();
        let mean = sum / Decimal::from(recent.len() as u64);
        if mean <= Decimal::ZERO {
            return TradeSignal::hold("degenerate price history");
        }

        let below_pct = (mean - snapshot.last_price) / mean * Decimal::ONE_HUNDRED;
        if below_pct >= self.dip_pct {
            return TradeSignal::new(
                SignalAction::Buy,
                40.0,
                format!("price {below_pct:.2}% under rolling mean"),
            );
        }

        TradeSignal::hold("no dip")
    }
}
