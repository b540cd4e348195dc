//! Admission control, position sizing and the account drawdown gate.

pub mod daily;
pub mod drawdown;
pub mod manager;

pub use daily::DailyRiskState;
pub use drawdown::{drawdown_pct, DrawdownEvent, DrawdownGate, DrawdownLevel};
pub use manager::{RiskAdjustment, RiskConfig, RiskManager, RiskState, RiskStatistics};
