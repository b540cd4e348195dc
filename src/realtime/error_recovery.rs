use crate::clock::{Clock, SharedClock};
use crate::error::{FaultKind, Result, TradingError};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::time::Duration;

/// What the scheduler should do after a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Continue,
    Pause,
    Stop,
}

/// Error recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Consecutive faults of any kind that force a pause
    pub max_consecutive_errors: u32,
    /// Consecutive transient faults tolerated before pausing
    pub transient_tolerance: u32,
    /// Base pause length
    pub cooldown_secs: u64,
    /// Upper bound for any pause, including escalated ones
    pub max_cooldown_secs: u64,
    /// Window for the error-rate calculation
    pub error_window_secs: u64,
    /// Error records kept in memory
    pub history_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 5,
            transient_tolerance: 2,
            cooldown_secs: 300,
            max_cooldown_secs: 3600,
            error_window_secs: 3600,
            history_limit: 1000,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_consecutive_errors == 0 {
            return Err(TradingError::invalid_config(
                "recovery.max_consecutive_errors",
                "must be positive",
            ));
        }
        if self.cooldown_secs == 0 || self.cooldown_secs > self.max_cooldown_secs {
            return Err(TradingError::invalid_config(
                "recovery.cooldown_secs",
                "must be positive and not above max_cooldown_secs",
            ));
        }
        if self.error_window_secs == 0 {
            return Err(TradingError::invalid_config(
                "recovery.error_window_secs",
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: FaultKind,
    pub message: String,
    pub context: String,
    pub action: RecoveryAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub total_errors: u64,
    pub consecutive_errors: u32,
    pub total_recoveries: u64,
    pub error_rate_per_hour: f64,
    pub is_paused: bool,
    pub pause_remaining_secs: u64,
    pub cooldown_secs: u64,
    pub last_error_time: Option<DateTime<Utc>>,
    pub recent_by_kind: BTreeMap<String, usize>,
}

/// Persistable counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub total_errors: u64,
    pub total_recoveries: u64,
    pub cooldown_secs: u64,
}

/// Circuit breaker around the scheduler's own execution
pub struct ErrorRecoveryManager {
    config: RecoveryConfig,
    clock: SharedClock,
    cooldown_secs: u64,
    consecutive_errors: u32,
    consecutive_transient: u32,
    consecutive_pauses: u32,
    total_errors: u64,
    total_recoveries: u64,
    history: VecDeque<ErrorRecord>,
    last_error_time: Option<DateTime<Utc>>,
    pause_until: Option<DateTime<Utc>>,
}

impl ErrorRecoveryManager {
    pub fn new(config: RecoveryConfig, clock: SharedClock) -> Self {
        info!(
            "Error recovery initialised: max consecutive={}, cooldown={}s",
            config.max_consecutive_errors, config.cooldown_secs
        );
        Self {
            cooldown_secs: config.cooldown_secs,
            config,
            clock,
            consecutive_errors: 0,
            consecutive_transient: 0,
            consecutive_pauses: 0,
            total_errors: 0,
            total_recoveries: 0,
            history: VecDeque::new(),
            last_error_time: None,
            pause_until: None,
        }
    }

    /// Record a fault and decide how the scheduler proceeds
    ///
    /// Fatal faults stop. Reaching `max_consecutive_errors` pauses with a
    /// cooldown that doubles on every further consecutive pause. Transient
    /// faults pause once they exceed `transient_tolerance` in a row.
    /// Everything else continues.
    pub fn classify(&mut self, fault: &TradingError, context: &str) -> RecoveryAction {
        let now = self.clock.now();
        let kind = fault.fault_kind();
        self.consecutive_errors += 1;
        self.total_errors += 1;
        self.last_error_time = Some(now);
        if kind == FaultKind::Transient {
            self.consecutive_transient += 1;
        } else {
            self.consecutive_transient = 0;
        }

        let action = match kind {
            FaultKind::Fatal => RecoveryAction::Stop,
            _ if self.consecutive_errors >= self.config.max_consecutive_errors => {
                RecoveryAction::Pause
            }
            FaultKind::Transient if self.consecutive_transient > self.config.transient_tolerance => {
                RecoveryAction::Pause
            }
            FaultKind::Transient | FaultKind::Data | FaultKind::Other => RecoveryAction::Continue,
        };

        error!(
            "Error #{} (consecutive: {}) in {}: {} -> {:?}",
            self.total_errors, self.consecutive_errors, context, fault, action
        );

        if action == RecoveryAction::Pause {
            let pause = self.escalated_cooldown();
            self.consecutive_pauses += 1;
            let until = now + chrono::Duration::seconds(pause as i64);
            self.pause_until = Some(until);
            warn!("Trading loop paused until {} ({}s cooldown)", until, pause);
        }

        self.history.push_back(ErrorRecord {
            timestamp: now,
            kind,
            message: fault.to_string(),
            context: context.to_string(),
            action,
        });
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
        action
    }

    fn escalated_cooldown(&self) -> u64 {
        let factor = 1u64.checked_shl(self.consecutive_pauses).unwrap_or(u64::MAX);
        self.cooldown_secs
            .saturating_mul(factor)
            .min(self.config.max_cooldown_secs)
    }

    pub fn record_success(&mut self) {
        if self.consecutive_errors > 0 {
            info!(
                "Operation succeeded after {} consecutive errors",
                self.consecutive_errors
            );
            self.total_recoveries += 1;
        }
        self.consecutive_errors = 0;
        self.consecutive_transient = 0;
        self.consecutive_pauses = 0;
        if self.pause_until.is_some_and(|until| self.clock.now() >= until) {
            self.pause_until = None;
            info!("Cooldown ended, resuming normal operation");
        }
    }

    /// Repeated health-check failures lengthen every future pause
    pub fn record_health_issue(&mut self, issue: &str) {
        let next = self
            .cooldown_secs
            .saturating_mul(2)
            .min(self.config.max_cooldown_secs);
        warn!(
            "Health issue: {} (cooldown {}s -> {}s)",
            issue, self.cooldown_secs, next
        );
        self.cooldown_secs = next;
    }

    pub fn should_pause(&self) -> bool {
        self.pause_until
            .is_some_and(|until| self.clock.now() < until)
    }

    pub fn get_pause_duration(&self) -> Duration {
        match self.pause_until {
            Some(until) => (until - self.clock.now()).to_std().unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn cooldown_secs(&self) -> u64 {
        self.cooldown_secs
    }

    pub fn reset(&mut self) {
        info!("Resetting error counters");
        self.consecutive_errors = 0;
        self.consecutive_transient = 0;
        self.consecutive_pauses = 0;
        self.pause_until = None;
    }

    fn recent(&self) -> impl Iterator<Item = &ErrorRecord> {
        let cutoff = self.clock.now() - chrono::Duration::seconds(self.config.error_window_secs as i64);
        self.history.iter().filter(move |e| e.timestamp >= cutoff)
    }

    pub fn error_rate_per_hour(&self) -> f64 {
        let hours = self.config.error_window_secs as f64 / 3600.0;
        if hours <= 0.0 {
            return 0.0;
        }
        self.recent().count() as f64 / hours
    }

    pub fn history(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.history.iter()
    }

    pub fn statistics(&self) -> RecoveryStatistics {
        let mut recent_by_kind = BTreeMap::new();
        for record in self.recent() {
            let key = serde_json::to_value(record.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{:?}", record.kind));
            *recent_by_kind.entry(key).or_insert(0) += 1;
        }
        RecoveryStatistics {
            total_errors: self.total_errors,
            consecutive_errors: self.consecutive_errors,
            total_recoveries: self.total_recoveries,
            error_rate_per_hour: self.error_rate_per_hour(),
            is_paused: self.should_pause(),
            pause_remaining_secs: self.get_pause_duration().as_secs(),
            cooldown_secs: self.cooldown_secs,
            last_error_time: self.last_error_time,
            recent_by_kind,
        }
    }

    pub fn export_state(&self) -> RecoveryState {
        RecoveryState {
            total_errors: self.total_errors,
            total_recoveries: self.total_recoveries,
            cooldown_secs: self.cooldown_secs,
        }
    }

    pub fn restore_state(&mut self, state: RecoveryState) {
        self.total_errors = state.total_errors;
        self.total_recoveries = state.total_recoveries;
        self.cooldown_secs = state
            .cooldown_secs
            .clamp(self.config.cooldown_secs, self.config.max_cooldown_secs);
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(TradingError::invalid_config("retry.max_attempts", "must be positive"));
        }
        if self.multiplier < 1.0 {
            return Err(TradingError::invalid_config("retry.multiplier", "must be at least 1"));
        }
        Ok(())
    }
}

/// Retry `operation` with exponential backoff while it fails transiently
///
/// Non-transient errors are returned immediately. Sleeping goes through the
/// injected clock so virtual-time runs do not wait.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    clock: &dyn Clock,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_delay = Duration::from_millis(config.max_delay_ms);
    let mut delay = Duration::from_millis(config.initial_delay_ms);
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() || attempt + 1 >= attempts => return Err(e),
            Err(e) => {
                let mut next_delay = delay;
                if config.jitter {
                    use std::collections::hash_map::DefaultHasher;
                    use std::hash::{Hash, Hasher};
                    let mut hasher = DefaultHasher::new();
                    attempt.hash(&mut hasher);
                    next_delay += Duration::from_millis(hasher.finish() % 100);
                }
                next_delay = next_delay.min(max_delay);

                warn!(
                    "{} (attempt {}/{}), retrying in {:?}",
                    e,
                    attempt + 1,
                    attempts,
                    next_delay
                );
                clock.sleep(next_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.multiplier).min(max_delay.as_secs_f64()),
                );
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn manager() -> (ErrorRecoveryManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        (
            ErrorRecoveryManager::new(RecoveryConfig::default(), clock.clone()),
            clock,
        )
    }

    fn timeout() -> TradingError {
        TradingError::FeedTimeout("BTCUSDT".into())
    }

    #[test]
    fn test_fatal_stops() {
        let (mut recovery, _) = manager();
        let action = recovery.classify(&TradingError::ResourceExhausted("oom".into()), "tick");
        assert_eq!(action, RecoveryAction::Stop);
    }

    #[test]
    fn test_transient_tolerates_two_then_pauses() {
        let (mut recovery, _) = manager();
        assert_eq!(recovery.classify(&timeout(), "feed"), RecoveryAction::Continue);
        assert_eq!(recovery.classify(&timeout(), "feed"), RecoveryAction::Continue);
        assert_eq!(recovery.classify(&timeout(), "feed"), RecoveryAction::Pause);
        assert!(recovery.should_pause());
        assert_eq!(recovery.get_pause_duration(), Duration::from_secs(300));
    }

    #[test]
    fn test_consecutive_errors_pause() {
        let (mut recovery, _) = manager();
        let other = TradingError::Execution("rejected".into());
        for _ in 0..4 {
            assert_eq!(recovery.classify(&other, "tick"), RecoveryAction::Continue);
        }
        assert_eq!(recovery.classify(&other, "tick"), RecoveryAction::Pause);
    }

    #[test]
    fn test_pause_escalates_and_caps() {
        let (mut recovery, clock) = manager();
        for _ in 0..3 {
            recovery.classify(&timeout(), "feed");
        }
        assert_eq!(recovery.get_pause_duration().as_secs(), 300);

        clock.advance(Duration::from_secs(300));
        assert!(!recovery.should_pause());
        recovery.classify(&timeout(), "feed");
        assert_eq!(recovery.get_pause_duration().as_secs(), 600);

        for expected in [1200, 2400, 3600, 3600] {
            clock.advance(Duration::from_secs(3600));
            recovery.classify(&timeout(), "feed");
            assert_eq!(recovery.get_pause_duration().as_secs(), expected);
        }
    }

    #[test]
    fn test_success_resets_counters() {
        let (mut recovery, clock) = manager();
        for _ in 0..3 {
            recovery.classify(&timeout(), "feed");
        }
        clock.advance(Duration::from_secs(301));
        recovery.record_success();
        assert_eq!(recovery.consecutive_errors(), 0);
        assert!(!recovery.should_pause());
        assert_eq!(recovery.classify(&timeout(), "feed"), RecoveryAction::Continue);
        assert_eq!(recovery.statistics().total_recoveries, 1);
    }

    #[test]
    fn test_health_issue_doubles_cooldown() {
        let (mut recovery, _) = manager();
        recovery.record_health_issue("High error rate");
        assert_eq!(recovery.cooldown_secs(), 600);
        for _ in 0..5 {
            recovery.record_health_issue("High error rate");
        }
        assert_eq!(recovery.cooldown_secs(), 3600);
    }

    #[test]
    fn test_error_rate_window() {
        let (mut recovery, clock) = manager();
        recovery.classify(&TradingError::Execution("x".into()), "tick");
        recovery.classify(&TradingError::Execution("y".into()), "tick");
        assert_eq!(recovery.error_rate_per_hour(), 2.0);
        clock.advance(Duration::from_secs(3601));
        assert_eq!(recovery.error_rate_per_hour(), 0.0);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryConfig::default(), &clock, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TradingError::FeedTimeout("slow".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_non_transient() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&RetryConfig::default(), &clock, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TradingError::MissingData("price".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_lifts_pause() {
        let (mut recovery, _) = manager();
        for _ in 0..3 {
            recovery.classify(&timeout(), "feed");
        }
        assert!(recovery.should_pause());

        recovery.reset();
        assert!(!recovery.should_pause());
        assert_eq!(recovery.consecutive_errors(), 0);
        assert_eq!(recovery.classify(&timeout(), "feed"), RecoveryAction::Continue);
        // history survives a reset
        assert_eq!(recovery.statistics().total_errors, 4);
    }

    #[test]
    fn test_retry_exhausts_on_virtual_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let calls = AtomicU32::new(0);
        let result: Result<()> = tokio_test::block_on(retry_with_backoff(
            &RetryConfig::default(),
            &clock,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TradingError::RateLimited("429".into())) }
            },
        ));

        assert!(matches!(result, Err(TradingError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 500ms then 1000ms, each with under 100ms of jitter
        let waited = (clock.now() - start).num_milliseconds();
        assert!((1500..1700).contains(&waited), "waited {waited}ms");
    }
}
