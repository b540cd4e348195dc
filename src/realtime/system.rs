use super::decision_engine::{DecisionEngine, EngineSnapshot};
use super::error_recovery::ErrorRecoveryManager;
use crate::clock::SharedClock;
use crate::config::SystemConfig;
use crate::error::Result;
use crate::exits::ExitPlanMonitor;
use crate::monitoring::{HealthIssue, HealthMonitor, HealthStatus, MonitoringConfig, StatsReporter};
use crate::persistence::StateStore;
use crate::risk::RiskManager;
use crate::traits::{MarketDataFeed, OrderRouter};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

const ISSUE_CHANNEL_CAPACITY: usize = 64;
const STATS_CAPACITY: usize = 10_000;

/// Requests a graceful stop; the loop exits after the current tick
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Decision loop plus its read-only monitor tasks
pub struct TradingSystem {
    engine: DecisionEngine,
    monitoring: MonitoringConfig,
    loop_interval_secs: u64,
    initial_capital: Decimal,
    clock: SharedClock,
    shutdown_tx: Arc<watch::Sender<bool>>,
    handle_ctrl_c: bool,
}

impl TradingSystem {
    pub fn new(engine: DecisionEngine, monitoring: MonitoringConfig, clock: SharedClock) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            loop_interval_secs: engine.config().loop_interval_secs,
            initial_capital: engine.risk().config().initial_capital,
            engine,
            monitoring,
            clock,
            shutdown_tx: Arc::new(shutdown_tx),
            handle_ctrl_c: false,
        }
    }

    /// Build every component from configuration
    ///
    /// A saved state file, if present, is restored before the first tick.
    pub fn from_config(
        config: &SystemConfig,
        feed: Arc<dyn MarketDataFeed>,
        router: Option<Arc<dyn OrderRouter>>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;
        let mut engine = DecisionEngine::new(
            config.engine.clone(),
            RiskManager::new(config.risk.clone(), clock.clone()),
            ExitPlanMonitor::new(config.exits.clone(), clock.clone()),
            ErrorRecoveryManager::new(config.recovery.clone(), clock.clone()),
            feed,
            clock.clone(),
        )
        .with_retry(config.retry.clone());
        if let Some(router) = router {
            engine = engine.with_router(router);
        }

        if let Some(path) = &config.engine.state_path {
            match StateStore::new(path.clone()).load() {
                Ok(Some(snapshot)) => engine.restore(snapshot),
                Ok(None) => debug!("No saved state at {}", path.display()),
                Err(e) => warn!("Ignoring saved state, starting fresh: {}", e),
            }
        }

        Ok(Self::new(engine, config.monitoring.clone(), clock))
    }

    /// Also stop on ctrl-c
    pub fn with_ctrl_c(mut self) -> Self {
        self.handle_ctrl_c = true;
        self
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut DecisionEngine {
        &mut self.engine
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run until shutdown or a fatal fault, then hand the engine back
    pub async fn run(mut self) -> (DecisionEngine, Result<()>) {
        info!(
            "Starting trading system ({})",
            if self.engine.snapshot().live {
                "LIVE"
            } else {
                "simulation mode"
            }
        );

        let (issue_tx, issue_rx) = mpsc::channel(ISSUE_CHANNEL_CAPACITY);
        let shutdown_rx = self.shutdown_tx.subscribe();

        let stats = tokio::spawn(run_stats(
            StatsReporter::new(self.initial_capital, STATS_CAPACITY),
            self.engine.subscribe(),
            Duration::from_secs(self.monitoring.stats_interval_secs),
            self.shutdown_tx.subscribe(),
        ));
        let health = tokio::spawn(run_health(
            HealthMonitor::new(self.monitoring.clone(), self.loop_interval_secs),
            self.engine.subscribe(),
            issue_tx,
            self.clock.clone(),
            self.shutdown_tx.subscribe(),
        ));
        let ctrl_c = self.handle_ctrl_c.then(|| {
            let handle = self.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.shutdown();
                }
            })
        });

        let result = self.engine.run(shutdown_rx, Some(issue_rx)).await;

        // stop the monitors
        self.shutdown_tx.send_replace(true);
        if let Some(task) = ctrl_c {
            task.abort();
        }
        if let Err(e) = health.await {
            error!("Health monitor task failed: {}", e);
        }
        match stats.await {
            Ok(reporter) => {
                reporter.log_summary();
                if let Some(path) = &self.monitoring.stats_path {
                    if let Err(e) = reporter.save(path) {
                        error!("Failed to save performance samples: {}", e);
                    }
                }
            }
            Err(e) => error!("Stats task failed: {}", e),
        }

        info!("Trading system stopped");
        (self.engine, result)
    }
}

/// Monitors pace themselves on wall time; only the engine advances its clock
fn wall_ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run_stats(
    mut reporter: StatsReporter,
    mut snapshots: watch::Receiver<EngineSnapshot>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> StatsReporter {
    let mut ticker = wall_ticker(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = snapshots.borrow_and_update().clone();
                reporter.record(&snapshot);
                reporter.log_summary();
            }
            _ = shutdown.changed() => break,
        }
    }
    let snapshot = snapshots.borrow().clone();
    reporter.record(&snapshot);
    reporter
}

async fn run_health(
    monitor: HealthMonitor,
    snapshots: watch::Receiver<EngineSnapshot>,
    issues: mpsc::Sender<HealthIssue>,
    clock: SharedClock,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = wall_ticker(Duration::from_secs(monitor.config().check_interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let snapshot = snapshots.borrow().clone();
        let report = monitor.evaluate(&snapshot, clock.now());
        if report.status == HealthStatus::Healthy {
            debug!("Health check passed");
            continue;
        }
        warn!("Health check {:?}: {}", report.status, report.message);
        for issue in report.issues {
            // a full channel means the loop has not drained the last batch yet
            if issues.try_send(issue).is_err() {
                break;
            }
        }
    }
}
