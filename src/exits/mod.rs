//! Per-position exit policy: plans and the monitor that evaluates them.

pub mod monitor;
pub mod plan;

pub use monitor::{ExitConfig, ExitPlanMonitor, ExitRecord, ExitStatistics, ProfitTier};
pub use plan::{ExitPlan, ExitReason, ExitSignal, InvalidationRule, TrailingParams};
