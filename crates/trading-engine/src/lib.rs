//! Trading Engine
//!
//! Strategies and the regime-aware selector, the position lifecycle state
//! machine, and the per-market evaluation engine that wires them to the
//! risk layer.

pub mod engine;
pub mod lifecycle;
pub mod selector;
pub mod strategy;

pub use engine::{
    EngineConfig, EngineStatus, MarketStatus, PositionView, SnapshotProvider, TickOutcome,
    TradingEngine,
};
pub use lifecycle::{ExitReason, LifecycleConfig, PositionLifecycleManager, TickAction};
pub use selector::{ActiveSelection, SelectorConfig, StrategySelector};
pub use strategy::{
    default_strategies, DcaStrategy, MeanReversionStrategy, Strategy, TrendFollowStrategy,
};
