use super::metrics::BacktestMetrics;
use crate::error::{Result, TradingError};
use crate::exits::ExitReason;
use crate::models::{Bar, IndicatorMap, MarketSnapshot, Position, PositionSide};
use crate::traits::Strategy;
use crate::types::{Price, Size, Symbol};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Replay parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub initial_capital: Decimal,
    /// Fee rate charged on leveraged notional at entry and exit
    pub taker_fee: Decimal,
    /// Fractional slippage, always applied against the trader
    pub slippage_pct: Decimal,
    pub max_positions: usize,
    /// Capital fraction used when a signal carries none
    pub default_size_fraction: Decimal,
    /// Allow stacking another position on a symbol already held
    pub allow_pyramiding: bool,
    /// An entry is skipped if its fee exceeds this share of capital
    pub max_fee_share: Decimal,
    pub timeframe: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::from(10_000),
            taker_fee: Decimal::new(5, 4),
            slippage_pct: Decimal::new(5, 4),
            max_positions: 3,
            default_size_fraction: Decimal::new(1, 1),
            allow_pyramiding: false,
            max_fee_share: Decimal::new(5, 1),
            timeframe: "1h".to_string(),
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_capital <= Decimal::ZERO {
            return Err(TradingError::invalid_config(
                "backtest.initial_capital",
                "must be positive",
            ));
        }
        if self.taker_fee < Decimal::ZERO || self.slippage_pct < Decimal::ZERO {
            return Err(TradingError::invalid_config(
                "backtest",
                "fees and slippage must not be negative",
            ));
        }
        if self.max_positions == 0 {
            return Err(TradingError::invalid_config(
                "backtest.max_positions",
                "must be positive",
            ));
        }
        if self.default_size_fraction <= Decimal::ZERO || self.default_size_fraction > Decimal::ONE
        {
            return Err(TradingError::invalid_config(
                "backtest.default_size_fraction",
                "must be within (0, 1]",
            ));
        }
        Ok(())
    }
}

/// Supplies indicators computed from the bars seen so far
///
/// `history` always ends at the bar being replayed; nothing later is visible.
pub trait IndicatorSource {
    fn compute(&mut self, history: &[Bar]) -> IndicatorMap;
}

impl<F> IndicatorSource for F
where
    F: FnMut(&[Bar]) -> IndicatorMap,
{
    fn compute(&mut self, history: &[Bar]) -> IndicatorMap {
        self(history)
    }
}

/// Only the close price is provided
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIndicators;

impl IndicatorSource for NoIndicators {
    fn compute(&mut self, _history: &[Bar]) -> IndicatorMap {
        IndicatorMap::new()
    }
}

/// A completed round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: Price,
    pub exit_price: Price,
    pub quantity: Size,
    pub leverage: Decimal,
    /// Net of entry and exit fees
    pub pnl: Decimal,
    /// Percent of committed margin
    pub pnl_pct: Decimal,
    pub fees: Decimal,
    pub duration_minutes: i64,
    pub exit_reason: ExitReason,
    pub strategy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub symbol: Symbol,
    pub bars: usize,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub metrics: BacktestMetrics,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
}

struct OpenPosition {
    position: Position,
    stop_loss: Option<Price>,
    take_profit: Option<Price>,
    entry_fee: Decimal,
}

/// Mutable state of one replay
struct Replay<'a> {
    config: &'a BacktestConfig,
    capital: Decimal,
    open: Vec<OpenPosition>,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
    opened: u64,
}

impl<'a> Replay<'a> {
    fn new(config: &'a BacktestConfig) -> Self {
        Self {
            config,
            capital: config.initial_capital,
            open: Vec::new(),
            trades: Vec::new(),
            equity_curve: Vec::new(),
            opened: 0,
        }
    }

    /// Close positions whose stop or target the close has crossed
    fn settle_levels(&mut self, bar: &Bar) {
        let price = bar.close;
        let mut i = 0;
        while i < self.open.len() {
            let entry = &self.open[i];
            let short = entry.position.side.is_short();
            let stop_hit = entry
                .stop_loss
                .filter(|stop| if short { price >= *stop } else { price <= *stop });
            let target_hit = entry
                .take_profit
                .filter(|take| if short { price <= *take } else { price >= *take });

            let exit = match (stop_hit, target_hit) {
                (Some(stop), _) => Some((stop, ExitReason::StopLoss)),
                (None, Some(take)) => Some((take, ExitReason::TakeProfit)),
                (None, None) => None,
            };
            match exit {
                Some((level, reason)) => self.close(i, bar.timestamp, level, reason),
                None => i += 1,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn open_position(
        &mut self,
        symbol: &Symbol,
        side: PositionSide,
        bar: &Bar,
        fraction: Option<Decimal>,
        leverage: Decimal,
        strategy: &str,
        confidence: f64,
        levels: (Option<Price>, Option<Price>),
    ) {
        let cfg = self.config;
        let entry_price = bar.close.adjust_by_rate(cfg.slippage_pct, !side.is_short());
        let fraction = fraction
            .filter(|f| *f > Decimal::ZERO)
            .unwrap_or(cfg.default_size_fraction)
            .min(Decimal::ONE);
        let margin = self.capital * fraction;
        let quantity = Size::from_value(margin, entry_price);
        let fee = margin * leverage * cfg.taker_fee;

        if quantity.is_zero() {
            debug!("Skipping {} entry on {}: zero quantity", side, symbol);
            return;
        }
        if fee > self.capital * cfg.max_fee_share {
            warn!("Insufficient capital for {} position on {}, skipping", side, symbol);
            return;
        }

        self.capital -= fee;
        self.opened += 1;
        let mut position = Position::open(
            symbol.clone(),
            side,
            entry_price,
            quantity,
            leverage,
            bar.timestamp,
            strategy,
            confidence,
        );
        position.id = format!("bt-{}", self.opened);
        debug!(
            "Opened {} {}: {} @ {}, leverage={}x, fee={}",
            side,
            symbol,
            quantity,
            entry_price,
            leverage,
            fee.round_dp(4)
        );
        self.open.push(OpenPosition {
            position,
            stop_loss: levels.0,
            take_profit: levels.1,
            entry_fee: fee,
        });
    }

    fn close(&mut self, index: usize, timestamp: DateTime<Utc>, level: Price, reason: ExitReason) {
        let entry = self.open.remove(index);
        let position = entry.position;
        let exit_price = level.adjust_by_rate(self.config.slippage_pct, position.side.is_short());

        let gross = position.pnl_at(exit_price);
        let exit_fee = position.quantity.notional(exit_price) * position.leverage * self.config.taker_fee;
        self.capital += gross - exit_fee;

        let pnl = gross - entry.entry_fee - exit_fee;
        let margin = position.entry_value;
        let pnl_pct = if margin.is_zero() {
            Decimal::ZERO
        } else {
            pnl / margin * Decimal::ONE_HUNDRED
        };
        debug!(
            "Closed {} {}: pnl={} ({}%), reason={}",
            position.side,
            position.symbol,
            pnl.round_dp(4),
            pnl_pct.round_dp(2),
            reason
        );

        self.trades.push(Trade {
            duration_minutes: position.holding_minutes(timestamp),
            symbol: position.symbol,
            side: position.side,
            entry_time: position.entry_time,
            exit_time: timestamp,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            leverage: position.leverage,
            pnl,
            pnl_pct,
            fees: entry.entry_fee + exit_fee,
            exit_reason: reason,
            strategy: position.strategy,
        });
    }

    fn mark_to_market(&mut self, bar: &Bar) {
        let unrealized: Decimal = self.open.iter().map(|o| o.position.pnl_at(bar.close)).sum();
        self.equity_curve.push(EquityPoint {
            timestamp: bar.timestamp,
            equity: self.capital + unrealized,
        });
    }
}

/// Deterministic bar-by-bar replay of one strategy on one symbol
#[derive(Debug, Clone, Default)]
pub struct BacktestEngine {
    config: BacktestConfig,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Replay `bars` in order
    ///
    /// At bar `i` the strategy and indicator source see `bars[..=i]` only.
    /// Open positions settle before a new signal is requested, and anything
    /// still open after the last bar is closed at its close. The strategy is
    /// asked on every bar so close signals land even with no room to enter.
    pub fn run(
        &self,
        strategy: &mut dyn Strategy,
        indicators: &mut dyn IndicatorSource,
        symbol: &Symbol,
        bars: &[Bar],
    ) -> Result<BacktestResult> {
        self.config.validate()?;
        let name = strategy.name().to_string();
        info!(
            "Starting backtest for {} on {} ({} bars)",
            name,
            symbol,
            bars.len()
        );
        let mut replay = Replay::new(&self.config);

        for (i, bar) in bars.iter().enumerate() {
            let history = &bars[..=i];
            let snapshot = MarketSnapshot::from_bar(symbol.clone(), &self.config.timeframe, bar);
            let mut map = indicators.compute(history);
            if let Some(close) = bar.close.value().to_f64() {
                map.insert("price", close);
            }

            replay.settle_levels(bar);

            let held = replay
                .open
                .iter()
                .find(|o| &o.position.symbol == symbol)
                .map(|o| &o.position);
            let signal = match strategy.generate_signal(&snapshot, &map, held) {
                Ok(signal) => signal,
                Err(e) if e.is_data_fault() => {
                    debug!("Bar {} skipped: {}", i, e);
                    None
                }
                Err(e) => return Err(e),
            };

            if let Some(signal) = signal {
                if let Some(side) = signal.action.closes_side() {
                    while let Some(index) = replay
                        .open
                        .iter()
                        .position(|o| &o.position.symbol == symbol && o.position.side == side)
                    {
                        replay.close(index, bar.timestamp, bar.close, ExitReason::Signal);
                    }
                } else if let Some(side) = signal.action.entry_side() {
                    let holding = replay.open.iter().any(|o| &o.position.symbol == symbol);
                    let has_room = replay.open.len() < self.config.max_positions;
                    if has_room && (self.config.allow_pyramiding || !holding) {
                        replay.open_position(
                            symbol,
                            side,
                            bar,
                            signal.size_fraction,
                            signal.effective_leverage(),
                            &name,
                            signal.confidence,
                            (signal.stop_loss, signal.take_profit),
                        );
                    }
                }
            }

            replay.mark_to_market(bar);
        }

        if let Some(last) = bars.last() {
            while !replay.open.is_empty() {
                replay.close(0, last.timestamp, last.close, ExitReason::BacktestEnd);
            }
            // the curve ends on realized equity
            if let Some(point) = replay.equity_curve.last_mut() {
                point.equity = replay.capital;
            }
        }

        let metrics = BacktestMetrics::calculate(
            &replay.trades,
            &replay.equity_curve,
            self.config.initial_capital,
        );
        info!(
            "Backtest complete: {} trades, final equity {}, return {}%",
            replay.trades.len(),
            replay.capital.round_dp(2),
            metrics.total_return_pct.round_dp(2)
        );

        Ok(BacktestResult {
            strategy: name,
            symbol: symbol.clone(),
            bars: bars.len(),
            initial_capital: self.config.initial_capital,
            final_equity: replay.capital,
            metrics,
            trades: replay.trades,
            equity_curve: replay.equity_curve,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SignalAction, TradingSignal};
    use chrono::{Duration, TimeZone};

    struct ScriptedStrategy {
        actions: Vec<SignalAction>,
        cursor: usize,
        stops: Option<(Price, Price)>,
    }

    impl Strategy for ScriptedStrategy {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate_signal(
            &mut self,
            snapshot: &MarketSnapshot,
            _indicators: &IndicatorMap,
            _position: Option<&Position>,
        ) -> Result<Option<TradingSignal>> {
            let action = self.actions.get(self.cursor).copied().unwrap_or(SignalAction::Hold);
            self.cursor += 1;
            let mut signal = TradingSignal::new(snapshot.symbol.clone(), action, 0.8, snapshot.price);
            if let Some((stop, take)) = self.stops {
                signal = signal.with_stops(stop, take);
            }
            Ok(Some(signal))
        }
    }

    fn bars(closes: &[i64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar::flat(start + Duration::hours(i as i64), Price::from(*c)))
            .collect()
    }

    fn frictionless() -> BacktestConfig {
        BacktestConfig {
            taker_fee: Decimal::ZERO,
            slippage_pct: Decimal::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_long_stop_loss_settles_at_level() {
        let mut strategy = ScriptedStrategy {
            actions: vec![SignalAction::Buy],
            cursor: 0,
            stops: Some((Price::from(95), Price::from(120))),
        };
        let result = BacktestEngine::new(frictionless())
            .run(&mut strategy, &mut NoIndicators, &Symbol::new("BTCUSDT"), &bars(&[100, 97, 94, 90]))
            .unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.exit_price, Price::from(95));
        // 10% of 10000 at 100 is 10 units, losing 5 each
        assert_eq!(trade.pnl, Decimal::from(-50));
        assert_eq!(result.final_equity, Decimal::from(9950));
    }

    #[test]
    fn test_fees_and_slippage_work_against_the_trader() {
        let mut strategy = ScriptedStrategy {
            actions: vec![SignalAction::Sell],
            cursor: 0,
            stops: None,
        };
        let result = BacktestEngine::new(BacktestConfig::default())
            .run(&mut strategy, &mut NoIndicators, &Symbol::new("ETHUSDT"), &bars(&[100, 100]))
            .unwrap();

        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::BacktestEnd);
        assert!(trade.entry_price < Price::from(100));
        assert!(trade.exit_price > Price::from(100));
        assert!(trade.pnl < Decimal::ZERO);
        assert!(trade.fees > Decimal::ZERO);
        assert_eq!(result.final_equity, Decimal::from(10_000) + trade.pnl);
    }

    #[test]
    fn test_leverage_scales_pnl() {
        let run = |leverage: i64| {
            let mut strategy = LeveragedBuy(Decimal::from(leverage));
            BacktestEngine::new(frictionless())
                .run(&mut strategy, &mut NoIndicators, &Symbol::new("BTCUSDT"), &bars(&[100, 110]))
                .unwrap()
        };
        assert_eq!(run(1).trades[0].pnl, Decimal::from(100));
        assert_eq!(run(5).trades[0].pnl, Decimal::from(500));
        assert_eq!(run(5).trades[0].pnl_pct, Decimal::from(50));
    }

    struct LeveragedBuy(Decimal);

    impl Strategy for LeveragedBuy {
        fn name(&self) -> &str {
            "leveraged"
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
            Ok(Some(
                TradingSignal::new(snapshot.symbol.clone(), SignalAction::Buy, 0.9, snapshot.price)
                    .with_leverage(self.0),
            ))
        }
    }

    #[test]
    fn test_close_signal_exits_position() {
        let mut strategy = ScriptedStrategy {
            actions: vec![SignalAction::Buy, SignalAction::Hold, SignalAction::CloseLong],
            cursor: 0,
            stops: None,
        };
        let result = BacktestEngine::new(frictionless())
            .run(&mut strategy, &mut NoIndicators, &Symbol::new("BTCUSDT"), &bars(&[100, 101, 102, 103]))
            .unwrap();
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_reason, ExitReason::Signal);
        assert_eq!(result.trades[0].exit_price, Price::from(102));
    }

    #[test]
    fn test_empty_series() {
        let mut strategy = ScriptedStrategy {
            actions: vec![],
            cursor: 0,
            stops: None,
        };
        let result = BacktestEngine::default()
            .run(&mut strategy, &mut NoIndicators, &Symbol::new("BTCUSDT"), &[])
            .unwrap();
        assert!(result.trades.is_empty());
        assert_eq!(result.final_equity, Decimal::from(10_000));
    }

    #[test]
    fn test_indicators_see_only_history() {
        let series = bars(&[1, 2, 3, 4, 5]);
        let mut seen = Vec::new();
        let mut source = |history: &[Bar]| {
            seen.push(history.len());
            IndicatorMap::new().with("last_close", history[history.len() - 1].close.value().to_f64().unwrap_or(0.0))
        };
        let mut strategy = ScriptedStrategy {
            actions: vec![],
            cursor: 0,
            stops: None,
        };
        BacktestEngine::default()
            .run(&mut strategy, &mut source, &Symbol::new("BTCUSDT"), &series)
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_close_signal_lands_with_the_book_full() {
        let mut strategy = ScriptedStrategy {
            actions: vec![SignalAction::Buy, SignalAction::Buy, SignalAction::CloseLong, SignalAction::Buy],
            cursor: 0,
            stops: None,
        };
        let config = BacktestConfig {
            max_positions: 1,
            ..frictionless()
        };
        let result = BacktestEngine::new(config)
            .run(&mut strategy, &mut NoIndicators, &Symbol::new("BTCUSDT"), &bars(&[100, 101, 102, 103, 104]))
            .unwrap();

        // every bar reached the strategy, so the close arrived on bar 2
        assert_eq!(strategy.cursor, 5);
        assert_eq!(result.trades.len(), 2);
        assert_eq!(result.trades[0].exit_reason, ExitReason::Signal);
        assert_eq!(result.trades[0].exit_price, Price::from(102));
        assert_eq!(result.trades[1].entry_price, Price::from(103));
        assert_eq!(result.trades[1].exit_reason, ExitReason::BacktestEnd);
    }
}
