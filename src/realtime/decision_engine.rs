use super::decision_log::{DecisionKind, DecisionLog, DecisionRecord};
use super::error_recovery::{
    retry_with_backoff, ErrorRecoveryManager, RecoveryAction, RecoveryStatistics, RetryConfig,
};
use crate::clock::SharedClock;
use crate::error::{Result, TradingError};
use crate::exits::{ExitPlan, ExitPlanMonitor, ExitReason, ExitSignal, ExitStatistics};
use crate::models::{MarketFrame, Position, TradingSignal};
use crate::monitoring::HealthIssue;
use crate::persistence::{StateSnapshot, StateStore};
use crate::risk::{RiskManager, RiskStatistics};
use crate::traits::{MarketDataFeed, OrderIntent, OrderRouter, Strategy};
use crate::types::{Price, Symbol};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Decision loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between ticks
    pub loop_interval_secs: u64,
    /// No new entries while this many positions are open
    pub max_open_positions: usize,
    /// Signals below this confidence are ignored
    pub min_confidence: f64,
    /// Live mode routes orders; otherwise trades are simulated
    pub enable_trading: bool,
    /// Decision records kept in memory
    pub decision_log_capacity: usize,
    /// JSON-lines file the decision log is flushed to
    pub decision_log_path: Option<PathBuf>,
    /// Where state snapshots are written
    pub state_path: Option<PathBuf>,
    /// Timeframe used for positions whose strategy is no longer registered
    pub default_timeframe: String,
    /// Stop after this many ticks (unbounded when unset)
    pub max_loops: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            loop_interval_secs: 180,
            max_open_positions: 5,
            min_confidence: 0.7,
            enable_trading: false,
            decision_log_capacity: 10_000,
            decision_log_path: None,
            state_path: None,
            default_timeframe: "1h".to_string(),
            max_loops: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.loop_interval_secs == 0 {
            return Err(TradingError::invalid_config(
                "engine.loop_interval_secs",
                "must be positive",
            ));
        }
        if self.max_open_positions == 0 {
            return Err(TradingError::invalid_config(
                "engine.max_open_positions",
                "must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(TradingError::invalid_config(
                "engine.min_confidence",
                "must be within [0, 1]",
            ));
        }
        if self.decision_log_capacity == 0 {
            return Err(TradingError::invalid_config(
                "engine.decision_log_capacity",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Immutable view published after every tick for read-only monitors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub last_tick: Option<DateTime<Utc>>,
    pub live: bool,
    pub total_loops: u64,
    pub total_decisions: u64,
    pub positions: Vec<Position>,
    pub risk: RiskStatistics,
    pub exits: ExitStatistics,
    pub recovery: RecoveryStatistics,
}

impl EngineSnapshot {
    pub fn open_positions(&self) -> usize {
        self.positions.len()
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub halted: bool,
    pub exits: usize,
    pub entries: usize,
    pub skipped: usize,
}

struct RegisteredStrategy {
    strategy: Box<dyn Strategy>,
    symbol: Symbol,
    timeframe: String,
}

struct Candidate {
    strategy: String,
    signal: TradingSignal,
    market_price: Price,
}

type FrameCache = HashMap<(Symbol, String), MarketFrame>;

/// Single-task control loop owning every position, plan and ledger
pub struct DecisionEngine {
    config: EngineConfig,
    clock: SharedClock,
    feed: Arc<dyn MarketDataFeed>,
    router: Option<Arc<dyn OrderRouter>>,
    retry: RetryConfig,
    risk: RiskManager,
    exits: ExitPlanMonitor,
    recovery: ErrorRecoveryManager,
    strategies: Vec<RegisteredStrategy>,
    positions: Vec<Position>,
    decisions: DecisionLog,
    total_loops: u64,
    started_at: DateTime<Utc>,
    last_tick: Option<DateTime<Utc>>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
}

impl DecisionEngine {
    pub fn new(
        config: EngineConfig,
        risk: RiskManager,
        exits: ExitPlanMonitor,
        recovery: ErrorRecoveryManager,
        feed: Arc<dyn MarketDataFeed>,
        clock: SharedClock,
    ) -> Self {
        let started_at = clock.now();
        let initial = EngineSnapshot {
            timestamp: started_at,
            started_at,
            last_tick: None,
            live: config.enable_trading,
            total_loops: 0,
            total_decisions: 0,
            positions: Vec::new(),
            risk: risk.statistics(),
            exits: exits.get_exit_statistics(),
            recovery: recovery.statistics(),
        };
        let (snapshot_tx, _) = watch::channel(initial);
        info!(
            "Decision engine created: interval={}s, max positions={}, min confidence={}, mode={}",
            config.loop_interval_secs,
            config.max_open_positions,
            config.min_confidence,
            if config.enable_trading { "LIVE" } else { "DRY RUN" }
        );
        Self {
            decisions: DecisionLog::new(config.decision_log_capacity),
            config,
            clock,
            feed,
            router: None,
            retry: RetryConfig::default(),
            risk,
            exits,
            recovery,
            strategies: Vec::new(),
            positions: Vec::new(),
            total_loops: 0,
            started_at,
            last_tick: None,
            snapshot_tx,
        }
    }

    pub fn with_router(mut self, router: Arc<dyn OrderRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Strategies are polled, and ties broken, in registration order
    pub fn register_strategy(
        &mut self,
        strategy: Box<dyn Strategy>,
        symbol: Symbol,
        timeframe: impl Into<String>,
    ) {
        let timeframe = timeframe.into();
        info!(
            "Registered strategy {} on {} ({})",
            strategy.name(),
            symbol,
            timeframe
        );
        self.strategies.push(RegisteredStrategy {
            strategy,
            symbol,
            timeframe,
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn risk_mut(&mut self) -> &mut RiskManager {
        &mut self.risk
    }

    pub fn exits(&self) -> &ExitPlanMonitor {
        &self.exits
    }

    pub fn recovery(&self) -> &ErrorRecoveryManager {
        &self.recovery
    }

    pub fn decisions(&self) -> &DecisionLog {
        &self.decisions
    }

    pub fn total_loops(&self) -> u64 {
        self.total_loops
    }

    fn log_decision(&mut self, record: DecisionRecord) {
        self.decisions.push(record);
        if !self.decisions.needs_flush() {
            return;
        }
        if let Some(path) = self.config.decision_log_path.as_deref() {
            if let Err(e) = self.decisions.flush_to(path) {
                error!("Failed to flush decision log to {}: {}", path.display(), e);
            }
        }
    }

    async fn fetch_frame(&self, symbol: &Symbol, timeframe: &str) -> Result<MarketFrame> {
        let frame = retry_with_backoff(&self.retry, self.clock.as_ref(), || {
            self.feed.fetch(symbol, timeframe)
        })
        .await?;
        if !frame.snapshot.price.is_valid() {
            return Err(TradingError::MissingData(format!(
                "{} {}: price {}",
                symbol, timeframe, frame.snapshot.price
            )));
        }
        Ok(frame)
    }

    /// Fetch each (symbol, timeframe) once per tick
    ///
    /// Data faults are logged and leave the key out of the cache; any other
    /// failure is kept in `fault` for the scheduler.
    async fn load_frames(
        &self,
        keys: Vec<(Symbol, String)>,
        cache: &mut FrameCache,
        fault: &mut Option<TradingError>,
    ) {
        for key in keys {
            if cache.contains_key(&key) {
                continue;
            }
            match self.fetch_frame(&key.0, &key.1).await {
                Ok(frame) => {
                    cache.insert(key, frame);
                }
                Err(e) if e.is_data_fault() => {
                    warn!("Skipping {} ({}) this tick: {}", key.0, key.1, e);
                }
                Err(e) => {
                    warn!("Market data for {} ({}) unavailable: {}", key.0, key.1, e);
                    fault.get_or_insert(e);
                }
            }
        }
    }

    fn timeframe_for(&self, position: &Position) -> String {
        self.strategies
            .iter()
            .find(|r| r.symbol == position.symbol && r.strategy.name() == position.strategy)
            .map(|r| r.timeframe.clone())
            .unwrap_or_else(|| self.config.default_timeframe.clone())
    }

    /// Run one iteration of the control loop
    ///
    /// Exits always settle before any entry is considered. A feed or
    /// execution failure does not abort the tick; the first one is returned
    /// after bookkeeping completes so the scheduler can classify it.
    pub async fn tick(&mut self) -> Result<TickSummary> {
        let now = self.clock.now();
        self.risk.roll_day(now.date_naive());
        self.total_loops += 1;
        self.last_tick = Some(now);
        debug!("Decision loop #{} at {}", self.total_loops, now);

        let mut summary = TickSummary::default();
        let mut fault: Option<TradingError> = None;
        let mut cache = FrameCache::new();

        if let Some(reason) = self.risk.halt_reason() {
            summary.halted = true;
            warn!("Trading halted: {}", reason);
            self.log_decision(
                DecisionRecord::new(now, DecisionKind::Skip, format!("trading halted: {reason}"))
                    .action("HOLD")
                    .strategy("RiskManager"),
            );
        }

        self.evaluate_exits(&mut cache, &mut summary, &mut fault).await;

        // strategy closes are exits too: they are honoured while halted or full
        let candidates = self.poll_strategies(&mut cache, &mut summary, &mut fault).await;
        if summary.halted {
            debug!("Entries suppressed while halted");
        } else if self.positions.len() >= self.config.max_open_positions {
            info!(
                "Max positions reached ({}/{})",
                self.positions.len(),
                self.config.max_open_positions
            );
        } else {
            self.enter_best(candidates, &mut summary, &mut fault).await;
        }

        self.publish();
        match fault {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn evaluate_exits(
        &mut self,
        cache: &mut FrameCache,
        summary: &mut TickSummary,
        fault: &mut Option<TradingError>,
    ) {
        if self.positions.is_empty() {
            return;
        }
        let keys: Vec<(Symbol, String)> = self
            .positions
            .iter()
            .map(|p| (p.symbol.clone(), self.timeframe_for(p)))
            .collect();
        self.load_frames(keys.clone(), cache, fault).await;

        let ids: Vec<String> = self.positions.iter().map(|p| p.id.clone()).collect();
        for (id, key) in ids.iter().zip(keys) {
            let Some(frame) = cache.get(&key) else {
                continue;
            };
            let signal = self.exits.check_exit_conditions(
                id,
                frame.snapshot.price,
                &frame.snapshot,
                &frame.indicators,
            );
            if let Some(signal) = signal.filter(|s| s.should_exit) {
                match self.close_position(id, signal).await {
                    Ok(true) => summary.exits += 1,
                    Ok(false) => {}
                    Err(e) => {
                        fault.get_or_insert(e);
                    }
                }
            }
        }
    }

    /// Settle a closing position; returns false if it was not open
    async fn close_position(&mut self, position_id: &str, signal: ExitSignal) -> Result<bool> {
        let Some(index) = self.positions.iter().position(|p| p.id == position_id) else {
            return Ok(false);
        };
        let position = self.positions[index].clone();

        if self.config.enable_trading {
            if let Some(router) = &self.router {
                let intent = OrderIntent {
                    position_id: position.id.clone(),
                    symbol: position.symbol.clone(),
                    side: position.side,
                    quantity: position.quantity,
                    price: signal.price,
                    leverage: position.leverage,
                    reduce_only: true,
                };
                router.submit(&intent).await?;
            }
        }

        let pnl = position.pnl_at(signal.price);
        let pnl_pct = position.pnl_pct_at(signal.price);

        self.positions.remove(index);
        self.exits
            .record_exit(&position.id, position.symbol.clone(), &signal, pnl, pnl_pct);
        self.exits.remove_exit_plan(&position.id);
        self.risk.record_trade_result(pnl, pnl_pct);
        self.risk
            .record_position_closed(&position.symbol, position.entry_value);

        let now = self.clock.now();
        self.log_decision(
            DecisionRecord::new(now, DecisionKind::Exit, signal.details.clone())
                .symbol(position.symbol.clone())
                .action(signal.reason.as_str())
                .confidence(1.0)
                .strategy(position.strategy.clone())
                .price(signal.price)
                .meta("position_id", &position.id)
                .meta("pnl", pnl.round_dp(8))
                .meta("pnl_pct", pnl_pct.round_dp(4))
                .meta("holding_minutes", position.holding_minutes(now)),
        );
        Ok(true)
    }

    async fn poll_strategies(
        &mut self,
        cache: &mut FrameCache,
        summary: &mut TickSummary,
        fault: &mut Option<TradingError>,
    ) -> Vec<Candidate> {
        let keys: Vec<(Symbol, String)> = self
            .strategies
            .iter()
            .map(|r| (r.symbol.clone(), r.timeframe.clone()))
            .collect();
        self.load_frames(keys, cache, fault).await;

        let min_confidence = self.config.min_confidence;
        let mut candidates = Vec::new();
        let mut closes: Vec<(String, ExitSignal)> = Vec::new();

        for registered in self.strategies.iter_mut() {
            let key = (registered.symbol.clone(), registered.timeframe.clone());
            let Some(frame) = cache.get(&key) else {
                continue;
            };
            let name = registered.strategy.name().to_string();
            let position = self
                .positions
                .iter()
                .find(|p| p.symbol == registered.symbol && p.strategy == name);

            let signal = match registered
                .strategy
                .generate_signal(&frame.snapshot, &frame.indicators, position)
            {
                Ok(Some(signal)) => signal,
                Ok(None) => continue,
                Err(e) if e.is_data_fault() => {
                    warn!("Strategy {} skipped on {}: {}", name, registered.symbol, e);
                    continue;
                }
                Err(e) => {
                    error!("Strategy {} failed on {}: {}", name, registered.symbol, e);
                    fault.get_or_insert(e);
                    continue;
                }
            };

            if let Some(side) = signal.action.closes_side() {
                let target = self
                    .positions
                    .iter()
                    .find(|p| p.symbol == signal.symbol && p.side == side);
                if let Some(target) = target {
                    let details = if signal.reasoning.is_empty() {
                        format!("{} requested {}", name, signal.action)
                    } else {
                        signal.reasoning.clone()
                    };
                    closes.push((
                        target.id.clone(),
                        ExitSignal::exit(ExitReason::Signal, frame.snapshot.price, details),
                    ));
                }
                continue;
            }

            if signal.action.entry_side().is_none() {
                continue;
            }
            if signal.confidence < min_confidence {
                debug!(
                    "{} {} below confidence floor ({:.2} < {:.2})",
                    name, signal.action, signal.confidence, min_confidence
                );
                continue;
            }
            info!(
                "{}: {} {} confidence={:.2} @ {}",
                name, signal.action, signal.symbol, signal.confidence, signal.price
            );
            candidates.push(Candidate {
                strategy: name,
                market_price: frame.snapshot.price,
                signal,
            });
        }

        for (position_id, signal) in closes {
            match self.close_position(&position_id, signal).await {
                Ok(true) => summary.exits += 1,
                Ok(false) => {}
                Err(e) => {
                    fault.get_or_insert(e);
                }
            }
        }
        candidates
    }

    async fn enter_best(
        &mut self,
        mut candidates: Vec<Candidate>,
        summary: &mut TickSummary,
        fault: &mut Option<TradingError>,
    ) {
        let now = self.clock.now();
        // stable: equal confidence keeps registration order
        candidates.sort_by(|a, b| {
            b.signal
                .confidence
                .partial_cmp(&a.signal.confidence)
                .unwrap_or(Ordering::Equal)
        });

        let Some(best) = candidates.into_iter().next() else {
            self.log_decision(
                DecisionRecord::new(now, DecisionKind::Hold, "no signal met entry criteria")
                    .action("HOLD"),
            );
            return;
        };

        match self.open_position(best, now).await {
            Ok(true) => summary.entries += 1,
            Ok(false) => summary.skipped += 1,
            Err(e) => {
                summary.skipped += 1;
                fault.get_or_insert(e);
            }
        }
    }

    /// Returns false when risk or sizing rejected the signal
    async fn open_position(&mut self, candidate: Candidate, now: DateTime<Utc>) -> Result<bool> {
        let Candidate {
            strategy,
            signal,
            market_price,
        } = candidate;
        let symbol = signal.symbol.clone();
        let skip = |why: String| {
            DecisionRecord::new(now, DecisionKind::Skip, why)
                .symbol(symbol.clone())
                .action(signal.action.to_string())
                .confidence(signal.confidence)
                .strategy(strategy.clone())
                .price(signal.price)
                .metadata(signal.metadata.clone())
        };

        if let Some(reason) = self.risk.entry_rejection(&symbol) {
            info!("Entry in {} rejected: {}", symbol, reason);
            let record = skip(format!("risk rejected: {reason}"));
            self.log_decision(record);
            return Ok(false);
        }

        let Some(side) = signal.action.entry_side() else {
            return Ok(false);
        };
        let entry_price = if signal.price.is_valid() {
            signal.price
        } else {
            market_price
        };
        let quantity = self
            .risk
            .calculate_position_size(signal.confidence, entry_price, Some(&symbol));
        if quantity.is_zero() {
            let record = skip("position size is zero".to_string());
            self.log_decision(record);
            return Ok(false);
        }

        let position = Position::open(
            symbol.clone(),
            side,
            entry_price,
            quantity,
            signal.effective_leverage(),
            now,
            strategy.clone(),
            signal.confidence,
        );
        let (stop_loss, take_profit) = signal.exit_levels(side, entry_price);
        let plan = ExitPlan::for_position(&position, stop_loss, take_profit)
            .with_trailing(signal.trailing)
            .with_invalidations(signal.invalidations.clone())
            .with_tiered_trailing(self.exits.config().tiered_trailing_enabled);

        let mode = if self.config.enable_trading {
            match &self.router {
                Some(router) => {
                    let intent = OrderIntent {
                        position_id: position.id.clone(),
                        symbol: symbol.clone(),
                        side,
                        quantity,
                        price: entry_price,
                        leverage: position.leverage,
                        reduce_only: false,
                    };
                    if let Err(e) = router.submit(&intent).await {
                        let record = skip(format!("order routing failed: {e}"));
                        self.log_decision(record);
                        return Err(e);
                    }
                }
                None => warn!("Live mode without an order router; recording {} locally", position.id),
            }
            "execute"
        } else {
            "simulate"
        };

        self.exits.add_exit_plan(plan)?;
        self.risk.record_position_opened(&symbol, position.entry_value);
        info!(
            "{} {} {} @ {} qty={} leverage={}x confidence={:.2}",
            if mode == "execute" { "EXECUTED" } else { "SIMULATED" },
            side,
            symbol,
            entry_price,
            quantity,
            position.leverage,
            signal.confidence
        );

        let justification = if signal.reasoning.is_empty() {
            format!("{} {} at confidence {:.2}", strategy, signal.action, signal.confidence)
        } else {
            signal.reasoning.clone()
        };
        self.log_decision(
            DecisionRecord::new(now, DecisionKind::Entry, justification)
                .symbol(symbol)
                .action(signal.action.to_string())
                .confidence(signal.confidence)
                .strategy(strategy)
                .price(entry_price)
                .metadata(signal.metadata.clone())
                .meta("position_id", &position.id)
                .meta("quantity", quantity)
                .meta("stop_loss", stop_loss)
                .meta("take_profit", take_profit)
                .meta("leverage", position.leverage)
                .meta("mode", mode),
        );
        self.positions.push(position);
        Ok(true)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            timestamp: self.clock.now(),
            started_at: self.started_at,
            last_tick: self.last_tick,
            live: self.config.enable_trading,
            total_loops: self.total_loops,
            total_decisions: self.decisions.total(),
            positions: self.positions.clone(),
            risk: self.risk.statistics(),
            exits: self.exits.get_exit_statistics(),
            recovery: self.recovery.statistics(),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        info!(
            "Loop #{}: open={}/{}, capital={}, pnl={}, win rate={:.1}%, drawdown={:.2}%, exits={:?}",
            snapshot.total_loops,
            snapshot.positions.len(),
            self.config.max_open_positions,
            snapshot.risk.capital.round_dp(2),
            snapshot.risk.total_pnl.round_dp(2),
            snapshot.risk.win_rate,
            snapshot.risk.current_drawdown_pct.round_dp(2),
            snapshot.exits.by_reason
        );
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Apply a health finding reported by a monitor task
    pub fn apply_health_issue(&mut self, issue: &HealthIssue) {
        warn!("Health issue reported: {}", issue);
        if issue.escalates_cooldown() {
            self.recovery.record_health_issue(&issue.to_string());
        }
    }

    /// Run ticks until shutdown, a fatal fault or `max_loops`
    ///
    /// Shutdown is observed between ticks only, so a tick's bookkeeping
    /// always completes. The decision log and state are flushed on every
    /// exit path.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        mut health: Option<mpsc::Receiver<HealthIssue>>,
    ) -> Result<()> {
        info!("Decision loop started");
        let interval = Duration::from_secs(self.config.loop_interval_secs);

        let outcome = loop {
            if *shutdown.borrow() {
                info!("Shutdown requested");
                break Ok(());
            }
            if let Some(rx) = health.as_mut() {
                while let Ok(issue) = rx.try_recv() {
                    self.apply_health_issue(&issue);
                }
            }
            if self
                .config
                .max_loops
                .is_some_and(|max| self.total_loops >= max)
            {
                info!("Reached {} loops", self.total_loops);
                break Ok(());
            }

            if self.recovery.should_pause() {
                let pause = self.recovery.get_pause_duration();
                info!("Paused for {}s after repeated errors", pause.as_secs());
                if self.sleep_or_shutdown(pause, &mut shutdown).await {
                    break Ok(());
                }
                continue;
            }

            match self.tick().await {
                Ok(summary) => {
                    debug!("Tick complete: {:?}", summary);
                    self.recovery.record_success();
                }
                Err(e) => {
                    let action = self.recovery.classify(&e, "decision loop");
                    // monitors must see the pause before the loop goes quiet
                    self.publish();
                    if action == RecoveryAction::Stop {
                        error!("Fatal error, stopping decision loop: {}", e);
                        break Err(e);
                    }
                }
            }

            if self.sleep_or_shutdown(interval, &mut shutdown).await {
                break Ok(());
            }
        };

        self.flush();
        info!(
            "Decision loop stopped after {} loops, {} decisions",
            self.total_loops,
            self.decisions.total()
        );
        outcome
    }

    /// Returns true if shutdown was signalled while sleeping
    async fn sleep_or_shutdown(
        &self,
        duration: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let clock = self.clock.clone();
        tokio::select! {
            _ = clock.sleep(duration) => false,
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }

    /// Best-effort flush of the decision log and persisted state
    pub fn flush(&mut self) {
        if let Some(path) = self.config.decision_log_path.clone() {
            if let Err(e) = self.decisions.flush_to(&path) {
                error!("Failed to flush decision log to {}: {}", path.display(), e);
            }
        }
        if let Some(path) = self.config.state_path.clone() {
            if let Err(e) = StateStore::new(path).save(&self.export_state()) {
                error!("Failed to persist state: {}", e);
            }
        }
    }

    pub fn export_state(&self) -> StateSnapshot {
        StateSnapshot {
            saved_at: self.clock.now(),
            total_loops: self.total_loops,
            positions: self.positions.clone(),
            exit_plans: self.exits.plans().cloned().collect(),
            risk: self.risk.export_state(),
            recovery: self.recovery.export_state(),
        }
    }

    /// Reload positions, plans and ledgers from a snapshot
    ///
    /// Invalidation predicates are code and do not survive a restart.
    pub fn restore(&mut self, snapshot: StateSnapshot) {
        info!(
            "Restoring {} positions saved at {}",
            snapshot.positions.len(),
            snapshot.saved_at
        );
        self.total_loops = snapshot.total_loops;
        self.risk.restore_state(snapshot.risk);
        self.recovery.restore_state(snapshot.recovery);
        let mut plans = snapshot.exit_plans;
        plans.retain(|plan| {
            snapshot
                .positions
                .iter()
                .any(|p| p.id == plan.position_id)
        });
        self.exits.restore(plans);
        for position in snapshot.positions {
            if self.exits.get_exit_plan(&position.id).is_none() {
                warn!(
                    "Restored position {} has no exit plan; using default levels",
                    position.id
                );
                let (stop, take) = TradingSignal::hold(position.symbol.clone(), position.entry_price)
                    .exit_levels(position.side, position.entry_price);
                let plan = ExitPlan::for_position(&position, stop, take)
                    .with_tiered_trailing(self.exits.config().tiered_trailing_enabled);
                self.exits.restore(vec![plan]);
            }
            self.positions.push(position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::exits::ExitConfig;
    use crate::models::{IndicatorMap, MarketSnapshot, SignalAction};
    use crate::realtime::RecoveryConfig;
    use crate::risk::RiskConfig;
    use crate::traits::MockOrderRouter;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct FixedFeed {
        prices: Mutex<HashMap<Symbol, Price>>,
        now: DateTime<Utc>,
    }

    impl FixedFeed {
        fn new(prices: &[(&str, i64)]) -> Self {
            Self {
                prices: Mutex::new(
                    prices
                        .iter()
                        .map(|(s, p)| (Symbol::new(*s), Price::from(*p)))
                        .collect(),
                ),
                now: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            }
        }

        fn set(&self, symbol: &str, price: i64) {
            self.prices
                .lock()
                .unwrap()
                .insert(Symbol::new(symbol), Price::from(price));
        }
    }

    #[async_trait]
    impl MarketDataFeed for FixedFeed {
        async fn fetch(&self, symbol: &Symbol, timeframe: &str) -> Result<MarketFrame> {
            let price = self
                .prices
                .lock()
                .unwrap()
                .get(symbol)
                .copied()
                .ok_or_else(|| TradingError::MissingData(symbol.to_string()))?;
            let mut snapshot = MarketSnapshot::at_price(symbol.clone(), price, self.now);
            snapshot.timeframe = timeframe.to_string();
            Ok(MarketFrame {
                snapshot,
                indicators: IndicatorMap::new(),
            })
        }
    }

    struct Fixed {
        name: String,
        action: SignalAction,
        confidence: f64,
    }

    impl Strategy for Fixed {
        fn name(&self) -> &str {
            &self.name
        }

        fn generate_signal(
            &mut self,
            snapshot: &MarketSnapshot,
            _indicators: &IndicatorMap,
            position: Option<&Position>,
        ) -> Result<Option<TradingSignal>> {
            if position.is_some() {
                return Ok(None);
            }
            Ok(Some(TradingSignal::new(
                snapshot.symbol.clone(),
                self.action,
                self.confidence,
                snapshot.price,
            )))
        }
    }

    fn fixed(name: &str, action: SignalAction, confidence: f64) -> Box<dyn Strategy> {
        Box::new(Fixed {
            name: name.to_string(),
            action,
            confidence,
        })
    }

    fn engine(feed: Arc<FixedFeed>, config: EngineConfig) -> (DecisionEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let shared: SharedClock = clock.clone();
        let engine = DecisionEngine::new(
            config,
            RiskManager::new(RiskConfig::default(), shared.clone()),
            ExitPlanMonitor::new(ExitConfig::default(), shared.clone()),
            ErrorRecoveryManager::new(RecoveryConfig::default(), shared.clone()),
            feed,
            shared,
        );
        (engine, clock)
    }

    #[tokio::test]
    async fn test_highest_confidence_wins() {
        let feed = Arc::new(FixedFeed::new(&[("BTCUSDT", 50000), ("ETHUSDT", 3000)]));
        let (mut engine, _) = engine(feed, EngineConfig::default());
        engine.register_strategy(fixed("a", SignalAction::Buy, 0.75), Symbol::new("BTCUSDT"), "1h");
        engine.register_strategy(fixed("b", SignalAction::Sell, 0.85), Symbol::new("ETHUSDT"), "1h");

        let summary = engine.tick().await.unwrap();
        assert_eq!(summary.entries, 1);
        assert_eq!(engine.positions().len(), 1);
        assert_eq!(engine.positions()[0].strategy, "b");
        assert_eq!(engine.exits().active_plans(), 1);
    }

    #[tokio::test]
    async fn test_tie_goes_to_first_registered() {
        let feed = Arc::new(FixedFeed::new(&[("BTCUSDT", 50000), ("ETHUSDT", 3000)]));
        let (mut engine, _) = engine(feed, EngineConfig::default());
        engine.register_strategy(fixed("first", SignalAction::Buy, 0.8), Symbol::new("ETHUSDT"), "1h");
        engine.register_strategy(fixed("second", SignalAction::Buy, 0.8), Symbol::new("BTCUSDT"), "1h");

        engine.tick().await.unwrap();
        assert_eq!(engine.positions()[0].strategy, "first");
    }

    #[tokio::test]
    async fn test_low_confidence_and_hold_are_ignored() {
        let feed = Arc::new(FixedFeed::new(&[("BTCUSDT", 50000)]));
        let (mut engine, _) = engine(feed, EngineConfig::default());
        engine.register_strategy(fixed("weak", SignalAction::Buy, 0.6), Symbol::new("BTCUSDT"), "1h");
        engine.register_strategy(fixed("idle", SignalAction::Hold, 0.99), Symbol::new("BTCUSDT"), "1h");

        let summary = engine.tick().await.unwrap();
        assert_eq!(summary.entries, 0);
        assert!(engine.positions().is_empty());
        assert_eq!(engine.decisions().count(DecisionKind::Hold), 1);
    }

    #[tokio::test]
    async fn test_decisions_reach_disk_before_eviction() {
        let dir = std::env::temp_dir().join(format!("engine-decisions-{}", uuid::Uuid::new_v4()));
        let path = dir.join("decisions.jsonl");
        let config = EngineConfig {
            decision_log_capacity: 2,
            decision_log_path: Some(path.clone()),
            ..EngineConfig::default()
        };
        let (mut engine, _) = engine(Arc::new(FixedFeed::new(&[])), config);

        for _ in 0..5 {
            engine.tick().await.unwrap();
        }
        assert_eq!(engine.decisions().len(), 2);
        engine.flush();

        let lines = std::fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(lines as u64, engine.decisions().total());
        assert_eq!(lines, 5);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_exit_settles_before_entry() {
        let feed = Arc::new(FixedFeed::new(&[("BTCUSDT", 50000)]));
        let (mut engine, clock) = engine(feed.clone(), EngineConfig::default());
        engine.register_strategy(fixed("a", SignalAction::Buy, 0.9), Symbol::new("BTCUSDT"), "1h");

        engine.tick().await.unwrap();
        let entry_value = engine.positions()[0].entry_value;
        assert_eq!(engine.risk().symbol_exposure(&Symbol::new("BTCUSDT")), entry_value);

        // default stop is 5% below entry
        feed.set("BTCUSDT", 47000);
        clock.advance(Duration::from_secs(180));
        let summary = engine.tick().await.unwrap();
        assert_eq!(summary.exits, 1);
        assert_eq!(summary.entries, 0); // cooldown still active
        assert!(engine.positions().is_empty());
        assert_eq!(engine.exits().active_plans(), 0);
        assert_eq!(
            engine.risk().symbol_exposure(&Symbol::new("BTCUSDT")),
            rust_decimal::Decimal::ZERO
        );
        assert!(engine.risk().capital() < RiskConfig::default().initial_capital);
        assert_eq!(engine.decisions().count(DecisionKind::Exit), 1);
        assert_eq!(engine.decisions().count(DecisionKind::Skip), 1);
    }

    #[tokio::test]
    async fn test_missing_price_is_skipped_without_fault() {
        let feed = Arc::new(FixedFeed::new(&[]));
        let (mut engine, _) = engine(feed, EngineConfig::default());
        engine.register_strategy(fixed("a", SignalAction::Buy, 0.9), Symbol::new("BTCUSDT"), "1h");
        let summary = engine.tick().await.unwrap();
        assert_eq!(summary.entries, 0);
    }

    #[tokio::test]
    async fn test_live_mode_routes_orders() {
        let feed = Arc::new(FixedFeed::new(&[("BTCUSDT", 50000)]));
        let config = EngineConfig {
            enable_trading: true,
            ..Default::default()
        };
        let mut router = MockOrderRouter::new();
        router
            .expect_submit()
            .times(1)
            .withf(|intent| !intent.reduce_only)
            .returning(|_| Ok(()));
        let (engine, _) = engine(feed, config);
        let mut engine = engine.with_router(Arc::new(router));
        engine.register_strategy(fixed("a", SignalAction::Buy, 0.9), Symbol::new("BTCUSDT"), "1h");

        engine.tick().await.unwrap();
        assert_eq!(engine.positions().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_order_is_not_tracked() {
        let feed = Arc::new(FixedFeed::new(&[("BTCUSDT", 50000)]));
        let config = EngineConfig {
            enable_trading: true,
            ..Default::default()
        };
        let mut router = MockOrderRouter::new();
        router
            .expect_submit()
            .returning(|_| Err(TradingError::Execution("insufficient margin".into())));
        let (engine, _) = engine(feed, config);
        let mut engine = engine.with_router(Arc::new(router));
        engine.register_strategy(fixed("a", SignalAction::Buy, 0.9), Symbol::new("BTCUSDT"), "1h");

        assert!(matches!(engine.tick().await, Err(TradingError::Execution(_))));
        assert!(engine.positions().is_empty());
        assert_eq!(engine.risk().symbol_exposure(&Symbol::new("BTCUSDT")), rust_decimal::Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_snapshot_published_each_tick() {
        let feed = Arc::new(FixedFeed::new(&[("BTCUSDT", 50000)]));
        let (mut engine, _) = engine(feed, EngineConfig::default());
        let rx = engine.subscribe();
        engine.register_strategy(fixed("a", SignalAction::Buy, 0.9), Symbol::new("BTCUSDT"), "1h");
        engine.tick().await.unwrap();
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.total_loops, 1);
        assert_eq!(snapshot.open_positions(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_after_max_loops() {
        let feed = Arc::new(FixedFeed::new(&[("BTCUSDT", 50000)]));
        let config = EngineConfig {
            max_loops: Some(3),
            ..Default::default()
        };
        let (mut engine, clock) = engine(feed, config);
        let start = clock.now();
        let (_tx, rx) = watch::channel(false);
        engine.run(rx, None).await.unwrap();
        assert_eq!(engine.total_loops(), 3);
        assert_eq!((clock.now() - start).num_seconds(), 3 * 180);
    }
}
