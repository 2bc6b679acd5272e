//! Risk Manager
//!
//! Circuit breakers (per-market and global), daily-loss and drawdown
//! tracking, the pre-trade market-condition gate, and Kelly position sizing.

pub mod circuit_breaker;
pub mod daily_loss;
pub mod global_breaker;
pub mod market_gate;
pub mod position_sizer;

pub use circuit_breaker::{
    BreakerConfig, BreakerDecision, MarketBreakerBook, MarketBreakerState, MarketTripReason,
};
pub use daily_loss::{
    CorrelationWarning, DailyLossConfig, DailyLossState, DailyLossTracker, DrawdownState,
};
pub use global_breaker::{GlobalBreaker, GlobalBreakerConfig, GlobalBreakerState, GlobalTripReason};
pub use market_gate::{GateConfig, GateIssue, GateMetrics, GateReport, MarketConditionGate};
pub use position_sizer::{
    PositionSizer, SizerConfig, ThrottleDecision, ThrottleSeverity, TradeStats,
};
