//! Shared domain types for the spot trading system.

pub mod market;
pub mod order;
pub mod position;
pub mod regime;
pub mod signal;
pub mod trade;

pub use market::{Balance, Candle, OrderBook, OrderBookLevel};
pub use order::{OrderDetail, OrderRequest, OrderSide, OrderStatus, OrderType, SubmittedOrder};
pub use position::{Position, PositionStatus};
pub use regime::{MarketRegime, RegimeSample};
pub use signal::{IndicatorSet, MarketSnapshot, SignalAction, TradeSignal};
pub use trade::TradeRecord;
