//! Kelly-criterion position sizing with a performance throttle.
//!
//! Order amounts are derived from realized trade history: Half-Kelly on the
//! observed win rate and payoff ratio, scaled by signal confidence and by a
//! throttle that shrinks (or blocks) sizing when recent performance decays.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use spot_core::db::TradeLedger;
use spot_core::types::TradeRecord;
use spot_core::Result;

#[derive(Debug, Clone)]
pub struct SizerConfig {
    /// Floor on the capital fraction per trade.
    pub min_fraction: Decimal,
    /// Ceiling on the capital fraction per trade.
    pub max_fraction: Decimal,
    /// Fraction used when history is too thin for Kelly.
    pub fixed_fraction: Decimal,
    /// Trades required before Kelly applies.
    pub min_sample_size: usize,
    /// Trades pulled from the ledger per sizing call.
    pub history_limit: u32,
    /// Payoff ratio is capped here to keep thin-history Kelly sane.
    pub payoff_ratio_cap: Decimal,
    /// Exchange minimum order amount in quote currency.
    pub min_order_amount: Decimal,
    /// Decimal places kept on the final quote amount.
    pub amount_precision: u32,
    /// Ledger stats cache TTL.
    pub throttle_ttl_secs: u64,
    /// Consecutive losses that halve sizing.
    pub weak_loss_streak: u32,
    /// Consecutive losses that block new entries outright.
    pub disable_loss_streak: u32,
    /// Win rate below this quarters sizing.
    pub critical_win_rate: Decimal,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            min_fraction: Decimal::new(5, 3),    // 0.5%
            max_fraction: Decimal::new(5, 2),    // 5%
            fixed_fraction: Decimal::new(1, 2),  // 1%
            min_sample_size: 10,
            history_limit: 30,
            payoff_ratio_cap: Decimal::new(10, 0),
            min_order_amount: Decimal::new(5_000, 0),
            amount_precision: 0,
            throttle_ttl_secs: 60,
            weak_loss_streak: 3,
            disable_loss_streak: 5,
            critical_win_rate: Decimal::new(35, 2), // 0.35
        }
    }
}

/// Realized performance over a recent window of closed trades.
#[derive(Debug, Clone, Default)]
pub struct TradeStats {
    pub sample_size: usize,
    /// Wins / sample_size, in [0, 1].
    pub win_rate: Decimal,
    /// Mean pnl_pct across winning trades (positive).
    pub avg_win_pct: Decimal,
    /// Mean |pnl_pct| across losing trades (positive).
    pub avg_loss_pct: Decimal,
    /// Losing streak counted from the most recent trade backwards.
    pub recent_consecutive_losses: u32,
    pub avg_pnl_pct: Decimal,
}

impl TradeStats {
    /// Build stats from ledger records, newest first.
    pub fn from_records(records: &[TradeRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let mut wins = 0usize;
        let mut win_sum = Decimal::ZERO;
        let mut loss_sum = Decimal::ZERO;
        let mut losses = 0usize;
        let mut pnl_sum = Decimal::ZERO;
        for r in records {
            pnl_sum += r.pnl_pct;
            if r.is_win() {
                wins += 1;
                win_sum += r.pnl_pct;
            } else if r.is_loss() {
                losses += 1;
                loss_sum += -r.pnl_pct;
            }
        }

        let mut streak = 0u32;
        for r in records {
            if r.is_loss() {
                streak += 1;
            } else {
                break;
            }
        }

        let n = Decimal::from(records.len() as u64);
        Self {
            sample_size: records.len(),
            win_rate: Decimal::from(wins as u64) / n,
            avg_win_pct: if wins > 0 {
                win_sum / Decimal::from(wins as u64)
            } else {
                Decimal::ZERO
            },
            avg_loss_pct: if losses > 0 {
                loss_sum / Decimal::from(losses as u64)
            } else {
                Decimal::ZERO
            },
            recent_consecutive_losses: streak,
            avg_pnl_pct: pnl_sum / n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleSeverity {
    Normal,
    /// Recent losing streak, size halved.
    Weak,
    /// Win rate collapsed, size quartered.
    Critical,
    /// Not enough history to judge, full size on the fixed fraction.
    InsufficientData,
    /// Losing streak long enough to block new entries.
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThrottleDecision {
    pub multiplier: Decimal,
    pub severity: ThrottleSeverity,
    pub block_new_buys: bool,
    pub sample_size: usize,
    pub recent_consecutive_losses: u32,
    pub win_rate: Decimal,
    pub avg_pnl_pct: Decimal,
}

/// Pure Kelly fraction from win rate `p` and payoff ratio, already clamped
/// to the configured band. Returns zero when the edge is non-positive.
pub fn kelly_fraction(stats: &TradeStats, config: &SizerConfig) -> Decimal {
    let p = stats.win_rate;
    if p < Decimal::new(5, 1) {
        return Decimal::ZERO;
    }

    let b = if stats.avg_loss_pct <= Decimal::ZERO {
        // No observed losses: treat the payoff ratio as the cap.
        config.payoff_ratio_cap
    } else {
        (stats.avg_win_pct / stats.avg_loss_pct).min(config.payoff_ratio_cap)
    };
    if b <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let q = Decimal::ONE - p;
    let full = (b * p - q) / b;
    if full <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    // Half-Kelly, then clamp to the band.
    let half = full / Decimal::TWO;
    half.clamp(config.min_fraction, config.max_fraction)
}

struct CachedStats {
    stats: TradeStats,
    fetched_at: Instant,
}

pub struct PositionSizer {
    ledger: Arc<dyn TradeLedger>,
    config: SizerConfig,
    cache: DashMap<String, CachedStats>,
}

impl PositionSizer {
    pub fn new(ledger: Arc<dyn TradeLedger>, config: SizerConfig) -> Self {
        Self {
            ledger,
            config,
            cache: DashMap::new(),
        }
    }

    /// Quote-currency amount for a new entry. Zero means "do not enter".
    ///
    /// `confidence` is the signal confidence in [0, 100].
    pub async fn size(
        &self,
        market: &str,
        strategy: &str,
        available: Decimal,
        confidence: f64,
    ) -> Result<Decimal> {
        if available <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }

        let stats = self.stats_with_fallback(market, strategy).await?;
        let throttle = self.throttle_for(&stats);
        if throttle.block_new_buys {
            warn!(
                market = %market,
                strategy = %strategy,
                streak = throttle.recent_consecutive_losses,
                "Sizing blocked by performance throttle"
            );
            return Ok(Decimal::ZERO);
        }

        // Kelly only applies with enough history and a positive edge; anything
        // else degrades to the fixed fraction rather than refusing to size.
        let fraction = if stats.sample_size >= self.config.min_sample_size {
            let kelly = kelly_fraction(&stats, &self.config);
            if kelly > Decimal::ZERO {
                kelly
            } else {
                self.config.fixed_fraction
            }
        } else {
            self.config.fixed_fraction
        };

        let conf = Decimal::from_f64(confidence.clamp(0.0, 100.0))
            .unwrap_or(Decimal::ZERO)
            / Decimal::ONE_HUNDRED;
        let raw = available * fraction * conf * throttle.multiplier;
        let amount = raw
            .round_dp_with_strategy(self.config.amount_precision, RoundingStrategy::ToZero)
            .min(available);

        if amount < self.config.min_order_amount {
            debug!(market = %market, amount = %amount, "Sized below exchange minimum, skipping");
            return Ok(Decimal::ZERO);
        }

        debug!(
            market = %market,
            strategy = %strategy,
            fraction = %fraction,
            multiplier = %throttle.multiplier,
            amount = %amount,
            "Position sized"
        );
        Ok(amount)
    }

    /// Current throttle for a market/strategy pair, from cached ledger stats.
    pub async fn throttle(&self, market: &str, strategy: &str) -> Result<ThrottleDecision> {
        let stats = self.stats_with_fallback(market, strategy).await?;
        Ok(self.throttle_for(&stats))
    }

    // Private methods

    fn throttle_for(&self, stats: &TradeStats) -> ThrottleDecision {
        let (multiplier, severity, block) = if stats.sample_size < self.config.min_sample_size {
            (Decimal::ONE, ThrottleSeverity::InsufficientData, false)
        } else if stats.recent_consecutive_losses >= self.config.disable_loss_streak {
            (Decimal::ZERO, ThrottleSeverity::Disabled, true)
        } else if stats.win_rate < self.config.critical_win_rate {
            (Decimal::new(25, 2), ThrottleSeverity::Critical, false)
        } else if stats.recent_consecutive_losses >= self.config.weak_loss_streak {
            (Decimal::new(5, 1), ThrottleSeverity::Weak, false)
        } else {
            (Decimal::ONE, ThrottleSeverity::Normal, false)
        };

        ThrottleDecision {
            multiplier,
            severity,
            block_new_buys: block,
            sample_size: stats.sample_size,
            recent_consecutive_losses: stats.recent_consecutive_losses,
            win_rate: stats.win_rate,
            avg_pnl_pct: stats.avg_pnl_pct,
        }
    }

    /// Stats for the narrowest scope that has enough history: market+strategy,
    /// then strategy alone, then everything.
    async fn stats_with_fallback(&self, market: &str, strategy: &str) -> Result<TradeStats> {
        let scopes: [(Option<&str>, Option<&str>); 3] = [
            (Some(market), Some(strategy)),
            (None, Some(strategy)),
            (None, None),
        ];

        let mut last = TradeStats::default();
        for (m, s) in scopes {
            let stats = self.cached_stats(m, s).await?;
            if stats.sample_size >= self.config.min_sample_size {
                return Ok(stats);
            }
            last = stats;
        }
        Ok(last)
    }

    async fn cached_stats(
        &self,
        market: Option<&str>,
        strategy: Option<&str>,
    ) -> Result<TradeStats> {
        let key = format!(
            "{}|{}",
            market.unwrap_or("*"),
            strategy.unwrap_or("*")
        );
        let ttl = std::time::Duration::from_secs(self.config.throttle_ttl_secs);
        if let Some(cached) = self.cache.get(&key) {
            if cached.fetched_at.elapsed() < ttl {
                return Ok(cached.stats.clone());
            }
        }

        let records = self
            .ledger
            .recent(market, strategy, self.config.history_limit)
            .await?;
        let stats = TradeStats::from_records(&records);
        self.cache.insert(
            key,
            CachedStats {
                stats: stats.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(stats)
    }

    /// Losses booked for a market inside the trailing 24 hours.
    pub async fn losses_last_24h(&self, market: &str) -> Result<u32> {
        self.ledger
            .losses_since(market, Utc::now() - Duration::hours(24))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spot_core::db::MemoryTradeLedger;
    use uuid::Uuid;

    fn record(market: &str, strategy: &str, pnl_pct: i64, minutes_ago: i64) -> TradeRecord {
        let exited = Utc::now() - Duration::minutes(minutes_ago);
        TradeRecord {
            id: Uuid::new_v4(),
            market: market.to_string(),
            strategy: strategy.to_string(),
            entry_price: Decimal::new(100, 0),
            exit_price: Decimal::new(100 + pnl_pct, 0),
            quantity: Decimal::ONE,
            pnl: Decimal::new(pnl_pct * 100, 0),
            pnl_pct: Decimal::new(pnl_pct, 0),
            entered_at: exited - Duration::hours(1),
            exited_at: exited,
            exit_reason: "take_profit".to_string(),
        }
    }

    async fn seeded_sizer(outcomes: &[i64]) -> PositionSizer {
        let ledger = Arc::new(MemoryTradeLedger::new());
        // Oldest first so index 0 of `outcomes` is the oldest trade.
        for (i, pnl) in outcomes.iter().enumerate() {
            let minutes_ago = (outcomes.len() - i) as i64;
            ledger
                .append(&record("KRW-BTC", "trend", *pnl, minutes_ago))
                .await
                .unwrap();
        }
        PositionSizer::new(ledger, SizerConfig::default())
    }

    #[test]
    fn test_kelly_zero_without_edge() {
        let config = SizerConfig::default();
        let stats = TradeStats {
            sample_size: 20,
            win_rate: Decimal::new(4, 1), // 40%
            avg_win_pct: Decimal::new(2, 0),
            avg_loss_pct: Decimal::new(2, 0),
            ..TradeStats::default()
        };
        assert_eq!(kelly_fraction(&stats, &config), Decimal::ZERO);
    }

    #[test]
    fn test_kelly_clamped_to_band() {
        let config = SizerConfig::default();

        // Huge edge clamps at max_fraction.
        let strong = TradeStats {
            sample_size: 20,
            win_rate: Decimal::new(9, 1),
            avg_win_pct: Decimal::new(5, 0),
            avg_loss_pct: Decimal::new(1, 0),
            ..TradeStats::default()
        };
        assert_eq!(kelly_fraction(&strong, &config), config.max_fraction);

        // Marginal edge clamps up to min_fraction.
        let weak = TradeStats {
            sample_size: 20,
            win_rate: Decimal::new(51, 2),
            avg_win_pct: Decimal::new(1, 0),
            avg_loss_pct: Decimal::new(1, 0),
            ..TradeStats::default()
        };
        let f = kelly_fraction(&weak, &config);
        assert!(f >= config.min_fraction && f <= config.max_fraction);
    }

    #[test]
    fn test_kelly_no_losses_uses_payoff_cap() {
        let config = SizerConfig::default();
        let stats = TradeStats {
            sample_size: 12,
            win_rate: Decimal::ONE,
            avg_win_pct: Decimal::new(3, 0),
            avg_loss_pct: Decimal::ZERO,
            ..TradeStats::default()
        };
        // p = 1 means full Kelly is 1.0; clamped to max.
        assert_eq!(kelly_fraction(&stats, &config), config.max_fraction);
    }

    #[test]
    fn test_stats_from_records() {
        let records: Vec<TradeRecord> = vec![
            record("KRW-BTC", "trend", -1, 1), // newest
            record("KRW-BTC", "trend", -2, 2),
            record("KRW-BTC", "trend", 4, 3),
            record("KRW-BTC", "trend", 2, 4),
        ];
        let stats = TradeStats::from_records(&records);
        assert_eq!(stats.sample_size, 4);
        assert_eq!(stats.win_rate, Decimal::new(5, 1));
        assert_eq!(stats.recent_consecutive_losses, 2);
        assert_eq!(stats.avg_win_pct, Decimal::new(3, 0));
        assert_eq!(stats.avg_loss_pct, Decimal::new(15, 1));
    }

    #[tokio::test]
    async fn test_insufficient_history_uses_fixed_fraction() {
        let sizer = seeded_sizer(&[2, -1, 3]).await;
        let amount = sizer
            .size("KRW-BTC", "trend", Decimal::new(1_000_000, 0), 100.0)
            .await
            .unwrap();
        // 1% fixed fraction at full confidence.
        assert_eq!(amount, Decimal::new(10_000, 0));
    }

    #[tokio::test]
    async fn test_five_loss_streak_blocks_buys() {
        let sizer = seeded_sizer(&[2, 3, 1, 2, 4, 2, -1, -1, -2, -1, -3]).await;
        let throttle = sizer.throttle("KRW-BTC", "trend").await.unwrap();
        assert_eq!(throttle.severity, ThrottleSeverity::Disabled);
        assert!(throttle.block_new_buys);

        let amount = sizer
            .size("KRW-BTC", "trend", Decimal::new(1_000_000, 0), 100.0)
            .await
            .unwrap();
        assert_eq!(amount, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_three_loss_streak_halves_size() {
        let sizer = seeded_sizer(&[2, 3, 1, 2, 4, 2, 3, -1, -2, -1]).await;
        let throttle = sizer.throttle("KRW-BTC", "trend").await.unwrap();
        assert_eq!(throttle.severity, ThrottleSeverity::Weak);
        assert_eq!(throttle.multiplier, Decimal::new(5, 1));
    }

    #[tokio::test]
    async fn test_collapsed_win_rate_is_critical() {
        let sizer = seeded_sizer(&[-1, -2, -1, -2, 5, -1, -2, 4, -1, -2, 3, -1]).await;
        let throttle = sizer.throttle("KRW-BTC", "trend").await.unwrap();
        assert_eq!(throttle.severity, ThrottleSeverity::Critical);
        assert_eq!(throttle.multiplier, Decimal::new(25, 2));
    }

    #[tokio::test]
    async fn test_below_minimum_order_sizes_to_zero() {
        let sizer = seeded_sizer(&[]).await;
        // 1% of 300k at full confidence is 3,000 KRW, under the 5,000 minimum.
        let amount = sizer
            .size("KRW-BTC", "trend", Decimal::new(300_000, 0), 100.0)
            .await
            .unwrap();
        assert_eq!(amount, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_amount_never_exceeds_available() {
        let ledger = Arc::new(MemoryTradeLedger::new());
        let sizer = PositionSizer::new(
            ledger,
            SizerConfig {
                fixed_fraction: Decimal::ONE, // pathological 100%
                ..SizerConfig::default()
            },
        );
        let available = Decimal::new(50_000, 0);
        let amount = sizer
            .size("KRW-BTC", "trend", available, 100.0)
            .await
            .unwrap();
        assert!(amount <= available);
    }

    #[tokio::test]
    async fn test_strategy_fallback_when_market_history_thin() {
        let ledger = Arc::new(MemoryTradeLedger::new());
        // Deep strategy history on another market.
        for i in 0..15 {
            ledger
                .append(&record("KRW-ETH", "trend", if i % 3 == 0 { -1 } else { 2 }, i + 1))
                .await
                .unwrap();
        }
        let sizer = PositionSizer::new(ledger, SizerConfig::default());
        let throttle = sizer.throttle("KRW-BTC", "trend").await.unwrap();
        // Falls back to strategy-wide stats rather than InsufficientData.
        assert_eq!(throttle.sample_size, 15);
    }
}
