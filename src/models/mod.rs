pub mod market;
pub mod position;
pub mod signal;

pub use market::{Bar, IndicatorMap, MarketFrame, MarketSnapshot};
pub use position::{Position, PositionSide};
pub use signal::{SignalAction, TradingSignal};
