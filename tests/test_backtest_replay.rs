//! Replay properties of the backtester: no look-ahead and determinism.

mod common;

use autotrader::backtest::{BacktestConfig, BacktestEngine, BacktestResult};
use autotrader::error::Result;
use autotrader::exits::ExitReason;
use autotrader::models::{Bar, IndicatorMap, MarketSnapshot, Position, SignalAction, TradingSignal};
use autotrader::traits::Strategy;
use autotrader::types::{Price, Symbol};
use common::random_walk;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Long above a short moving average, flat below it
struct MovingAverageTrend;

impl Strategy for MovingAverageTrend {
    fn name(&self) -> &str {
        "ma_trend"
    }

    fn generate_signal(
        &mut self,
        snapshot: &MarketSnapshot,
        indicators: &IndicatorMap,
        position: Option<&Position>,
    ) -> Result<Option<TradingSignal>> {
        let (Some(price), Some(sma)) = (indicators.get("price"), indicators.get("sma_5")) else {
            return Ok(None);
        };
        let signal = match position {
            Some(_) if price < sma => {
                TradingSignal::new(snapshot.symbol.clone(), SignalAction::CloseLong, 0.8, snapshot.price)
            }
            None if price > sma => {
                let stop = snapshot.price.offset_by_pct(Decimal::from(-3));
                let take = snapshot.price.offset_by_pct(Decimal::from(6));
                TradingSignal::new(snapshot.symbol.clone(), SignalAction::Buy, 0.8, snapshot.price)
                    .with_stops(stop, take)
                    .with_leverage(Decimal::from(3))
            }
            _ => return Ok(None),
        };
        Ok(Some(signal))
    }
}

fn sma_5(history: &[Bar]) -> IndicatorMap {
    if history.len() < 5 {
        return IndicatorMap::new();
    }
    let window = &history[history.len() - 5..];
    let sum: Decimal = window.iter().map(|b| b.close.value()).sum();
    let sma = (sum / Decimal::from(5)).to_f64().unwrap_or(f64::NAN);
    IndicatorMap::new().with("sma_5", sma)
}

fn replay(bars: &[Bar]) -> BacktestResult {
    let engine = BacktestEngine::new(BacktestConfig::default());
    let mut indicators = sma_5;
    engine
        .run(
            &mut MovingAverageTrend,
            &mut indicators,
            &Symbol::new("BTCUSDT"),
            bars,
        )
        .unwrap()
}

#[test]
fn test_walk_produces_trades() {
    let result = replay(&random_walk(300, 100.0));
    assert!(result.trades.len() > 3);
    assert!(result
        .trades
        .iter()
        .any(|t| t.exit_reason != ExitReason::BacktestEnd));
}

/// Truncating the tail never changes what already happened
#[test]
fn test_prefix_replay_matches_full_history() {
    let bars = random_walk(300, 100.0);
    let full = replay(&bars);

    for cut in [20, 75, 150, 299] {
        let prefix = replay(&bars[..cut]);
        let settled: Vec<_> = prefix
            .trades
            .iter()
            .filter(|t| t.exit_reason != ExitReason::BacktestEnd)
            .cloned()
            .collect();
        assert_eq!(
            settled.as_slice(),
            &full.trades[..settled.len()],
            "trades diverged with {cut} bars"
        );
        // every mark before the forced close is shared
        assert_eq!(
            &prefix.equity_curve[..cut - 1],
            &full.equity_curve[..cut - 1],
            "equity diverged with {cut} bars"
        );
    }
}

#[test]
fn test_identical_input_gives_identical_bytes() {
    let bars = random_walk(250, 50.0);
    let first = serde_json::to_string(&replay(&bars)).unwrap();
    let second = serde_json::to_string(&replay(&bars)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_indicator_source_never_sees_future_bars() {
    let bars = random_walk(60, 100.0);
    let last_seen = std::cell::RefCell::new(Vec::new());
    let mut spy = |history: &[Bar]| {
        last_seen.borrow_mut().push(history.len());
        IndicatorMap::new()
    };
    let engine = BacktestEngine::new(BacktestConfig::default());
    engine
        .run(
            &mut MovingAverageTrend,
            &mut spy,
            &Symbol::new("BTCUSDT"),
            &bars,
        )
        .unwrap();
    let seen = last_seen.into_inner();
    assert_eq!(seen, (1..=60).collect::<Vec<_>>());
}

#[test]
fn test_leverage_scales_pnl_not_fees() {
    let bars = common::bars(&[100.0, 100.0, 110.0]);

    struct BuyOnce(Decimal);
    impl Strategy for BuyOnce {
        fn name(&self) -> &str {
            "buy_once"
        }
        fn generate_signal(
            &mut self,
            snapshot: &MarketSnapshot,
            _indicators: &IndicatorMap,
            position: Option<&Position>,
        ) -> Result<Option<TradingSignal>> {
            if position.is_some() || snapshot.timestamp != common::start_time() {
                return Ok(None);
            }
            Ok(Some(
                TradingSignal::new(snapshot.symbol.clone(), SignalAction::Buy, 0.9, snapshot.price)
                    .with_leverage(self.0),
            ))
        }
    }

    let config = BacktestConfig {
        slippage_pct: Decimal::ZERO,
        ..BacktestConfig::default()
    };
    let engine = BacktestEngine::new(config);
    let run = |leverage: i64| {
        engine
            .run(
                &mut BuyOnce(Decimal::from(leverage)),
                &mut autotrader::backtest::NoIndicators,
                &Symbol::new("BTCUSDT"),
                &bars,
            )
            .unwrap()
    };

    let plain = run(1);
    let levered = run(5);
    let (plain, levered) = (&plain.trades[0], &levered.trades[0]);
    // margin 1000 buys 10 units; a 10% move is 100 gross, 500 at 5x
    assert_eq!(plain.pnl + plain.fees, Decimal::from(100));
    assert_eq!(levered.pnl + levered.fees, Decimal::from(500));
    // fees follow leveraged notional: 0.05% of 1000 in, of 1100 out
    assert_eq!(plain.fees, Decimal::new(105, 2));
    assert_eq!(levered.fees, Decimal::new(525, 2));
    assert_eq!(plain.entry_price, Price::from(100));
}
