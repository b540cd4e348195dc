/// Read-only observers of the decision loop
pub mod health;
pub mod stats;

pub use health::{ComponentHealth, MonitoringConfig, HealthIssue, HealthMonitor, HealthReport, HealthStatus};
pub use stats::{PerformanceSample, StatsReporter};
