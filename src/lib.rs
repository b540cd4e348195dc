pub mod backtest;
pub mod clock;
pub mod config;
pub mod error;
pub mod exits;
pub mod logging;
pub mod models;
pub mod monitoring;
pub mod persistence;
pub mod realtime;
pub mod risk;
pub mod traits;
pub mod types;

pub use backtest::{BacktestConfig, BacktestEngine, BacktestMetrics, BacktestResult, Trade};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::SystemConfig;
pub use error::{FaultKind, Result, TradingError};
pub use exits::{ExitConfig, ExitPlan, ExitPlanMonitor, ExitReason, ExitSignal};
pub use logging::{init_logging, LoggingConfig};
pub use models::{
    Bar, IndicatorMap, MarketFrame, MarketSnapshot, Position, PositionSide, SignalAction,
    TradingSignal,
};
pub use monitoring::{HealthMonitor, HealthReport, StatsReporter};
pub use persistence::{StateSnapshot, StateStore};
pub use realtime::{
    DecisionEngine, EngineConfig, EngineSnapshot, ErrorRecoveryManager, RecoveryAction,
    RecoveryConfig, TradingSystem,
};
pub use risk::{RiskConfig, RiskManager};
pub use traits::{MarketDataFeed, OrderIntent, OrderRouter, Strategy};
pub use types::{Price, Size, Symbol};
