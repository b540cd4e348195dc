use super::daily::DailyRiskState;
use super::drawdown::{drawdown_pct, DrawdownEvent, DrawdownGate, DrawdownLevel};
use crate::clock::SharedClock;
use crate::error::{Result, TradingError};
use crate::types::{Price, Size, Symbol};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Risk manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Starting capital in quote currency
    pub initial_capital: Decimal,
    /// Daily loss (percent of capital) that halts trading for the day
    pub max_daily_loss_pct: Decimal,
    /// Settled trades allowed per day
    pub max_daily_trades: u32,
    /// Position size at full confidence, percent of capital
    pub max_position_size_pct: Decimal,
    /// Position size at the confidence floor, percent of capital
    pub min_position_size_pct: Decimal,
    /// Cap on open notional per symbol, percent of capital
    pub max_symbol_exposure_pct: Decimal,
    /// Scale size with confidence; otherwise always use the max size
    pub confidence_scaling: bool,
    /// Confidence where scaling starts from the minimum size
    pub confidence_floor: f64,
    /// Confidence at and above which the max size is used
    pub full_size_confidence: f64,
    /// Per-symbol cooldown between entries
    pub min_trade_interval_secs: u64,
    /// Drawdown (percent from peak) that blocks new entries
    pub drawdown_warn_pct: Decimal,
    /// Drawdown (percent from peak) that blocks all trading
    pub drawdown_stop_pct: Decimal,
    /// Days of daily state retained
    pub history_days: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::from(10_000),
            max_daily_loss_pct: Decimal::from(5),
            max_daily_trades: 20,
            max_position_size_pct: Decimal::from(10),
            min_position_size_pct: Decimal::from(1),
            max_symbol_exposure_pct: Decimal::from(20),
            confidence_scaling: true,
            confidence_floor: 0.7,
            full_size_confidence: 0.9,
            min_trade_interval_secs: 1800,
            drawdown_warn_pct: Decimal::from(30),
            drawdown_stop_pct: Decimal::from(50),
            history_days: 30,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        let pct = |field: &str, value: Decimal| -> Result<()> {
            if value <= Decimal::ZERO || value > Decimal::ONE_HUNDRED {
                return Err(TradingError::invalid_config(field, "must be within (0, 100]"));
            }
            Ok(())
        };
        if self.initial_capital <= Decimal::ZERO {
            return Err(TradingError::invalid_config("risk.initial_capital", "must be positive"));
        }
        pct("risk.max_daily_loss_pct", self.max_daily_loss_pct)?;
        pct("risk.max_position_size_pct", self.max_position_size_pct)?;
        pct("risk.min_position_size_pct", self.min_position_size_pct)?;
        pct("risk.max_symbol_exposure_pct", self.max_symbol_exposure_pct)?;
        pct("risk.drawdown_warn_pct", self.drawdown_warn_pct)?;
        pct("risk.drawdown_stop_pct", self.drawdown_stop_pct)?;
        if self.min_position_size_pct > self.max_position_size_pct {
            return Err(TradingError::invalid_config(
                "risk.min_position_size_pct",
                "exceeds max_position_size_pct",
            ));
        }
        if self.max_daily_trades == 0 {
            return Err(TradingError::invalid_config("risk.max_daily_trades", "must be positive"));
        }
        if !(0.0..1.0).contains(&self.confidence_floor)
            || self.full_size_confidence <= self.confidence_floor
            || self.full_size_confidence > 1.0
        {
            return Err(TradingError::invalid_config(
                "risk.full_size_confidence",
                "requires 0 <= confidence_floor < full_size_confidence <= 1",
            ));
        }
        if self.drawdown_warn_pct >= self.drawdown_stop_pct {
            return Err(TradingError::invalid_config(
                "risk.drawdown_warn_pct",
                "must be below drawdown_stop_pct",
            ));
        }
        Ok(())
    }
}

/// Live parameter changes; `None` leaves a value untouched
#[derive(Debug, Clone, Default)]
pub struct RiskAdjustment {
    pub max_daily_loss_pct: Option<Decimal>,
    pub max_daily_trades: Option<u32>,
    pub max_position_size_pct: Option<Decimal>,
    pub min_trade_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskStatistics {
    pub capital: Decimal,
    pub initial_capital: Decimal,
    pub peak_capital: Decimal,
    pub total_pnl: Decimal,
    pub total_return_pct: Decimal,
    pub current_drawdown_pct: Decimal,
    pub max_drawdown_pct: Decimal,
    pub total_trades: u64,
    pub win_rate: f64,
    pub drawdown_level: DrawdownLevel,
    pub can_trade_today: bool,
    pub today: Option<DailyRiskState>,
    pub symbol_exposure: BTreeMap<Symbol, Decimal>,
}

/// Persistable ledger state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub capital: Decimal,
    pub peak_capital: Decimal,
    pub max_drawdown_pct: Decimal,
    pub total_pnl: Decimal,
    pub total_trades: u64,
    pub total_wins: u64,
    pub daily: Vec<DailyRiskState>,
    pub symbol_exposure: BTreeMap<Symbol, Decimal>,
    pub last_trade_time: BTreeMap<Symbol, DateTime<Utc>>,
}

/// Admission control and position sizing
///
/// Composes four breakers: the daily loss cap, the daily trade cap, the
/// per-symbol cooldown and the account drawdown gate. Every check is an
/// in-memory predicate against the injected clock.
pub struct RiskManager {
    config: RiskConfig,
    clock: SharedClock,
    capital: Decimal,
    peak_capital: Decimal,
    max_drawdown_pct: Decimal,
    total_pnl: Decimal,
    total_trades: u64,
    total_wins: u64,
    current_day: NaiveDate,
    daily: BTreeMap<NaiveDate, DailyRiskState>,
    symbol_exposure: HashMap<Symbol, Decimal>,
    last_trade_time: HashMap<Symbol, DateTime<Utc>>,
    drawdown: DrawdownGate,
    halted: bool,
}

impl RiskManager {
    pub fn new(config: RiskConfig, clock: SharedClock) -> Self {
        let today = clock.now().date_naive();
        let mut daily = BTreeMap::new();
        daily.insert(today, DailyRiskState::new(today));
        info!(
            "Risk manager initialised: capital={}, max daily loss={}%, max daily trades={}, cooldown={}s",
            config.initial_capital,
            config.max_daily_loss_pct,
            config.max_daily_trades,
            config.min_trade_interval_secs
        );
        Self {
            capital: config.initial_capital,
            peak_capital: config.initial_capital,
            drawdown: DrawdownGate::new(config.drawdown_warn_pct, config.drawdown_stop_pct),
            config,
            clock,
            max_drawdown_pct: Decimal::ZERO,
            total_pnl: Decimal::ZERO,
            total_trades: 0,
            total_wins: 0,
            current_day: today,
            daily,
            symbol_exposure: HashMap::new(),
            last_trade_time: HashMap::new(),
            halted: false,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn capital(&self) -> Decimal {
        self.capital
    }

    pub fn peak_capital(&self) -> Decimal {
        self.peak_capital
    }

    pub fn current_drawdown_pct(&self) -> Decimal {
        drawdown_pct(self.peak_capital, self.capital)
    }

    pub fn drawdown_level(&self) -> DrawdownLevel {
        self.drawdown.level()
    }

    pub fn drawdown_events(&self) -> impl Iterator<Item = &DrawdownEvent> {
        self.drawdown.events()
    }

    pub fn symbol_exposure(&self, symbol: &Symbol) -> Decimal {
        self.symbol_exposure
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn max_symbol_exposure(&self) -> Decimal {
        self.capital * self.config.max_symbol_exposure_pct / Decimal::ONE_HUNDRED
    }

    /// Start a new trading day; a no-op when `today` is already current
    ///
    /// Returns true if the day actually rolled.
    pub fn roll_day(&mut self, today: NaiveDate) -> bool {
        if today <= self.current_day {
            return false;
        }
        let previous = self
            .daily
            .get(&self.current_day)
            .map(|s| s.pnl)
            .unwrap_or(Decimal::ZERO);
        info!(
            "New trading day {}: previous day ({}) pnl {}",
            today,
            self.current_day,
            previous.round_dp(2)
        );
        self.current_day = today;
        self.daily
            .entry(today)
            .or_insert_with(|| DailyRiskState::new(today));
        while self.daily.len() > self.config.history_days.max(1) {
            self.daily.pop_first();
        }
        self.halted = self.halt_reason().is_some();
        true
    }

    fn sync_day(&mut self) {
        let today = self.clock.now().date_naive();
        self.roll_day(today);
    }

    fn today_mut(&mut self) -> &mut DailyRiskState {
        self.sync_day();
        let day = self.current_day;
        self.daily
            .entry(day)
            .or_insert_with(|| DailyRiskState::new(day))
    }

    /// Today's aggregates as seen by the clock; `None` before any activity after a rollover
    pub fn today(&self) -> Option<&DailyRiskState> {
        self.daily.get(&self.clock.now().date_naive())
    }

    /// Why trading is halted for today, if it is
    pub fn halt_reason(&self) -> Option<String> {
        if self.drawdown.blocks_trading() {
            return Some(format!(
                "drawdown {:.2}% reached stop level {}%",
                self.current_drawdown_pct().round_dp(2),
                self.config.drawdown_stop_pct
            ));
        }
        let (pnl, trades) = self
            .today()
            .map(|s| (s.pnl, s.trades))
            .unwrap_or((Decimal::ZERO, 0));

        let max_loss = self.capital * self.config.max_daily_loss_pct / Decimal::ONE_HUNDRED;
        if pnl <= -max_loss {
            return Some(format!(
                "daily loss limit reached: {} <= -{}",
                pnl.round_dp(2),
                max_loss.round_dp(2)
            ));
        }
        if trades >= self.config.max_daily_trades {
            return Some(format!(
                "daily trade limit reached: {} >= {}",
                trades, self.config.max_daily_trades
            ));
        }
        None
    }

    pub fn can_trade_today(&self) -> bool {
        self.halt_reason().is_none()
    }

    pub fn cooldown_remaining(&self, symbol: &Symbol) -> Option<chrono::Duration> {
        let last = self.last_trade_time.get(symbol)?;
        let interval = chrono::Duration::seconds(self.config.min_trade_interval_secs as i64);
        let elapsed = self.clock.now() - *last;
        if elapsed < interval {
            Some(interval - elapsed)
        } else {
            None
        }
    }

    pub fn can_trade_symbol(&self, symbol: &Symbol) -> bool {
        match self.cooldown_remaining(symbol) {
            Some(remaining) => {
                debug!(
                    "Symbol cooldown active for {}: {}s remaining",
                    symbol,
                    remaining.num_seconds()
                );
                false
            }
            None => true,
        }
    }

    /// Why a new position in `symbol` would be refused, if it would
    pub fn entry_rejection(&self, symbol: &Symbol) -> Option<String> {
        if let Some(reason) = self.halt_reason() {
            return Some(reason);
        }
        if self.drawdown.blocks_new_entries() {
            return Some(format!(
                "drawdown {:.2}% at warn level {}%, new entries blocked",
                self.current_drawdown_pct().round_dp(2),
                self.config.drawdown_warn_pct
            ));
        }
        if let Some(remaining) = self.cooldown_remaining(symbol) {
            return Some(format!(
                "cooldown active for {}: {}s remaining",
                symbol,
                remaining.num_seconds()
            ));
        }
        let exposure = self.symbol_exposure(symbol);
        let max_exposure = self.max_symbol_exposure();
        if exposure >= max_exposure {
            return Some(format!(
                "symbol exposure limit reached for {}: {} >= {}",
                symbol,
                exposure.round_dp(2),
                max_exposure.round_dp(2)
            ));
        }
        None
    }

    pub fn can_open_position(&self, symbol: &Symbol) -> bool {
        match self.entry_rejection(symbol) {
            Some(reason) => {
                warn!("Cannot open position in {}: {}", symbol, reason);
                false
            }
            None => true,
        }
    }

    /// Percent of capital to commit at `confidence`
    pub fn position_size_pct(&self, confidence: f64) -> Decimal {
        let cfg = &self.config;
        if !cfg.confidence_scaling || confidence >= cfg.full_size_confidence {
            return cfg.max_position_size_pct;
        }
        let range = cfg.full_size_confidence - cfg.confidence_floor;
        let scale = if range > 0.0 {
            ((confidence - cfg.confidence_floor).max(0.0) / range).min(1.0)
        } else {
            0.0
        };
        let scale = Decimal::from_f64(scale).unwrap_or(Decimal::ZERO);
        cfg.min_position_size_pct + (cfg.max_position_size_pct - cfg.min_position_size_pct) * scale
    }

    /// Quantity to trade, clamped to the symbol's remaining exposure headroom
    pub fn calculate_position_size(
        &self,
        confidence: f64,
        price: Price,
        symbol: Option<&Symbol>,
    ) -> Size {
        let size_pct = self.position_size_pct(confidence);
        let mut value = self.capital * size_pct / Decimal::ONE_HUNDRED;

        if let Some(symbol) = symbol {
            let headroom = (self.max_symbol_exposure() - self.symbol_exposure(symbol))
                .max(Decimal::ZERO);
            if value > headroom {
                info!(
                    "Position size for {} reduced to {} by exposure limit",
                    symbol,
                    headroom.round_dp(2)
                );
                value = headroom;
            }
        }

        let quantity = Size::from_value(value, price);
        debug!(
            "Position size: confidence={:.2}, size={}% ({}), qty={}",
            confidence,
            size_pct.round_dp(2),
            value.round_dp(2),
            quantity.value().round_dp(6)
        );
        quantity
    }

    pub fn record_position_opened(&mut self, symbol: &Symbol, value: Decimal) {
        let now = self.clock.now();
        self.today_mut().record_open(symbol);
        let exposure = self
            .symbol_exposure
            .entry(symbol.clone())
            .or_insert(Decimal::ZERO);
        *exposure += value;
        let exposure = *exposure;
        self.last_trade_time.insert(symbol.clone(), now);
        info!(
            "Position opened: {} value={} exposure={} cooldown={}s",
            symbol,
            value.round_dp(2),
            exposure.round_dp(2),
            self.config.min_trade_interval_secs
        );
    }

    pub fn record_position_closed(&mut self, symbol: &Symbol, value: Decimal) {
        self.sync_day();
        let exposure = self
            .symbol_exposure
            .entry(symbol.clone())
            .or_insert(Decimal::ZERO);
        *exposure = (*exposure - value).max(Decimal::ZERO);
        info!(
            "Position closed: {} remaining exposure={}",
            symbol,
            exposure.round_dp(2)
        );
    }

    /// Settle one closed trade; capital moves exactly once per call
    pub fn record_trade_result(&mut self, pnl: Decimal, pnl_pct: Decimal) {
        let now = self.clock.now();
        self.today_mut().record_trade(pnl);

        self.capital += pnl;
        self.total_pnl += pnl;
        self.total_trades += 1;
        if pnl > Decimal::ZERO {
            self.total_wins += 1;
        }
        if self.capital > self.peak_capital {
            self.peak_capital = self.capital;
        }
        let drawdown = self.current_drawdown_pct();
        if drawdown > self.max_drawdown_pct {
            self.max_drawdown_pct = drawdown;
        }
        self.drawdown.evaluate(self.peak_capital, self.capital, now);

        info!(
            "Trade settled: pnl={} ({:.2}%), capital={}, drawdown={:.2}%",
            pnl.round_dp(2),
            pnl_pct.round_dp(2),
            self.capital.round_dp(2),
            drawdown.round_dp(2)
        );

        let reason = self.halt_reason();
        match (&reason, self.halted) {
            (Some(reason), false) => warn!("Trading halted for today: {}", reason),
            (None, true) => info!("Trading limits cleared"),
            _ => {}
        }
        self.halted = reason.is_some();
    }

    pub fn statistics(&self) -> RiskStatistics {
        let total_return_pct = if self.config.initial_capital > Decimal::ZERO {
            (self.capital - self.config.initial_capital) / self.config.initial_capital
                * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        RiskStatistics {
            capital: self.capital,
            initial_capital: self.config.initial_capital,
            peak_capital: self.peak_capital,
            total_pnl: self.total_pnl,
            total_return_pct,
            current_drawdown_pct: self.current_drawdown_pct(),
            max_drawdown_pct: self.max_drawdown_pct,
            total_trades: self.total_trades,
            win_rate: if self.total_trades > 0 {
                self.total_wins as f64 / self.total_trades as f64 * 100.0
            } else {
                0.0
            },
            drawdown_level: self.drawdown.level(),
            can_trade_today: self.can_trade_today(),
            today: self.today().cloned(),
            symbol_exposure: self
                .symbol_exposure
                .iter()
                .map(|(s, v)| (s.clone(), *v))
                .collect(),
        }
    }

    /// Most recent `days` daily states, newest first
    pub fn daily_history(&self, days: usize) -> Vec<DailyRiskState> {
        self.daily.values().rev().take(days).cloned().collect()
    }

    /// Manual override: wipe today's counters
    pub fn reset_daily_limits(&mut self) {
        warn!("Manually resetting daily limits");
        self.sync_day();
        let day = self.current_day;
        self.daily.insert(day, DailyRiskState::new(day));
        self.halted = self.halt_reason().is_some();
    }

    pub fn adjust_parameters(&mut self, adjustment: RiskAdjustment) -> Result<()> {
        let mut next = self.config.clone();
        if let Some(v) = adjustment.max_daily_loss_pct {
            next.max_daily_loss_pct = v;
        }
        if let Some(v) = adjustment.max_daily_trades {
            next.max_daily_trades = v;
        }
        if let Some(v) = adjustment.max_position_size_pct {
            next.max_position_size_pct = v;
        }
        if let Some(v) = adjustment.min_trade_interval_secs {
            next.min_trade_interval_secs = v;
        }
        next.validate()?;
        info!(
            "Risk parameters adjusted: daily loss {}% -> {}%, daily trades {} -> {}, max size {}% -> {}%",
            self.config.max_daily_loss_pct,
            next.max_daily_loss_pct,
            self.config.max_daily_trades,
            next.max_daily_trades,
            self.config.max_position_size_pct,
            next.max_position_size_pct
        );
        self.config = next;
        Ok(())
    }

    pub fn export_state(&self) -> RiskState {
        RiskState {
            capital: self.capital,
            peak_capital: self.peak_capital,
            max_drawdown_pct: self.max_drawdown_pct,
            total_pnl: self.total_pnl,
            total_trades: self.total_trades,
            total_wins: self.total_wins,
            daily: self.daily.values().cloned().collect(),
            symbol_exposure: self
                .symbol_exposure
                .iter()
                .map(|(s, v)| (s.clone(), *v))
                .collect(),
            last_trade_time: self
                .last_trade_time
                .iter()
                .map(|(s, t)| (s.clone(), *t))
                .collect(),
        }
    }

    pub fn restore_state(&mut self, state: RiskState) {
        let now = self.clock.now();
        self.capital = state.capital;
        self.peak_capital = state.peak_capital;
        self.max_drawdown_pct = state.max_drawdown_pct;
        self.total_pnl = state.total_pnl;
        self.total_trades = state.total_trades;
        self.total_wins = state.total_wins;
        self.daily = state.daily.into_iter().map(|s| (s.date, s)).collect();
        self.symbol_exposure = state.symbol_exposure.into_iter().collect();
        self.last_trade_time = state.last_trade_time.into_iter().collect();
        if let Some(latest) = self.daily.keys().next_back().copied() {
            self.current_day = self.current_day.max(latest);
        }
        self.sync_day();
        self.drawdown.evaluate(self.peak_capital, self.capital, now);
        self.halted = self.halt_reason().is_some();
        info!(
            "Risk state restored: capital={}, peak={}, {} days of history",
            self.capital,
            self.peak_capital,
            self.daily.len()
        );
    }
}
