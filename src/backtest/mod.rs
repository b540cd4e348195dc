//! Offline replay of a strategy over historical bars.

pub mod engine;
pub mod metrics;

pub use engine::{
    BacktestConfig, BacktestEngine, BacktestResult, EquityPoint, IndicatorSource, NoIndicators,
    Trade,
};
pub use metrics::{max_drawdown_pct, BacktestMetrics};
