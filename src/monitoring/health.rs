use crate::error::{Result, TradingError};
use crate::realtime::EngineSnapshot;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// A single finding of a health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HealthIssue {
    HighDrawdown { drawdown_pct: Decimal },
    TradingHalted,
    HighErrorRate { per_hour: f64 },
    Stalled { idle_secs: i64 },
    UnstableStart { consecutive_errors: u32 },
}

impl HealthIssue {
    pub fn severity(&self) -> HealthStatus {
        match self {
            HealthIssue::HighErrorRate { .. } | HealthIssue::Stalled { .. } => {
                HealthStatus::Unhealthy
            }
            _ => HealthStatus::Degraded,
        }
    }

    /// Issues caused by faults lengthen the recovery cooldown; policy halts do not
    pub fn escalates_cooldown(&self) -> bool {
        matches!(
            self,
            HealthIssue::HighErrorRate { .. }
                | HealthIssue::Stalled { .. }
                | HealthIssue::UnstableStart { .. }
        )
    }

    fn component(&self) -> &'static str {
        match self {
            HealthIssue::HighDrawdown { .. } | HealthIssue::TradingHalted => "risk",
            HealthIssue::HighErrorRate { .. } | HealthIssue::UnstableStart { .. } => "recovery",
            HealthIssue::Stalled { .. } => "engine",
        }
    }
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthIssue::HighDrawdown { drawdown_pct } => {
                write!(f, "High drawdown: {:.1}%", drawdown_pct)
            }
            HealthIssue::TradingHalted => write!(f, "Daily trading limits reached"),
            HealthIssue::HighErrorRate { per_hour } => {
                write!(f, "High error rate: {:.1} errors/hour", per_hour)
            }
            HealthIssue::Stalled { idle_secs } => {
                write!(f, "Decision loop idle for {}s", idle_secs)
            }
            HealthIssue::UnstableStart { consecutive_errors } => write!(
                f,
                "System unstable after recent start ({} consecutive errors)",
                consecutive_errors
            ),
        }
    }
}

/// Component health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub issues: Vec<HealthIssue>,
    pub checks: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub check_interval_secs: u64,
    pub stats_interval_secs: u64,
    /// Current drawdown above this is reported
    pub drawdown_alert_pct: Decimal,
    pub error_rate_alert_per_hour: f64,
    /// Idle time, in loop intervals, before the engine counts as stalled
    pub stall_intervals: u32,
    /// Errors this soon after start are reported as instability
    pub startup_grace_secs: u64,
    /// Performance samples are saved here on shutdown
    pub stats_path: Option<PathBuf>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 300,
            stats_interval_secs: 60,
            drawdown_alert_pct: Decimal::from(20),
            error_rate_alert_per_hour: 5.0,
            stall_intervals: 3,
            startup_grace_secs: 60,
            stats_path: None,
        }
    }
}

impl MonitoringConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 || self.stats_interval_secs == 0 {
            return Err(TradingError::invalid_config(
                "monitoring",
                "intervals must be positive",
            ));
        }
        if self.drawdown_alert_pct <= Decimal::ZERO {
            return Err(TradingError::invalid_config(
                "monitoring.drawdown_alert_pct",
                "must be positive",
            ));
        }
        if self.stall_intervals == 0 {
            return Err(TradingError::invalid_config(
                "monitoring.stall_intervals",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Stateless evaluation of engine snapshots
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: MonitoringConfig,
    loop_interval_secs: u64,
}

impl HealthMonitor {
    pub fn new(config: MonitoringConfig, loop_interval_secs: u64) -> Self {
        Self {
            config,
            loop_interval_secs,
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    pub fn evaluate(&self, snapshot: &EngineSnapshot, now: DateTime<Utc>) -> HealthReport {
        let mut issues = Vec::new();

        if snapshot.risk.current_drawdown_pct > self.config.drawdown_alert_pct {
            issues.push(HealthIssue::HighDrawdown {
                drawdown_pct: snapshot.risk.current_drawdown_pct,
            });
        }
        if !snapshot.risk.can_trade_today {
            issues.push(HealthIssue::TradingHalted);
        }
        if snapshot.recovery.error_rate_per_hour > self.config.error_rate_alert_per_hour {
            issues.push(HealthIssue::HighErrorRate {
                per_hour: snapshot.recovery.error_rate_per_hour,
            });
        }

        // a paused engine is idle on purpose
        let reference = snapshot.last_tick.unwrap_or(snapshot.started_at);
        let idle_secs = (now - reference).num_seconds();
        let stall_after = self.loop_interval_secs as i64 * self.config.stall_intervals as i64;
        if !snapshot.recovery.is_paused && idle_secs > stall_after {
            issues.push(HealthIssue::Stalled { idle_secs });
        }

        let uptime = (now - snapshot.started_at).num_seconds();
        if uptime < self.config.startup_grace_secs as i64
            && snapshot.recovery.consecutive_errors > 0
        {
            issues.push(HealthIssue::UnstableStart {
                consecutive_errors: snapshot.recovery.consecutive_errors,
            });
        }

        let mut checks: Vec<ComponentHealth> = ["engine", "risk", "recovery"]
            .iter()
            .map(|name| ComponentHealth {
                name: name.to_string(),
                status: HealthStatus::Healthy,
                message: "ok".to_string(),
            })
            .collect();
        for issue in &issues {
            if let Some(check) = checks.iter_mut().find(|c| c.name == issue.component()) {
                if issue.severity() > check.status {
                    check.status = issue.severity();
                }
                check.message = if check.message == "ok" {
                    issue.to_string()
                } else {
                    format!("{}; {}", check.message, issue)
                };
            }
        }

        let status = issues
            .iter()
            .map(HealthIssue::severity)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        let message = if issues.is_empty() {
            "All systems operational".to_string()
        } else {
            issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        };

        HealthReport {
            status,
            message,
            timestamp: now,
            issues,
            checks,
        }
    }
}
