//! Shared fixtures: a scripted in-memory feed, scripted strategies and a
//! manual clock wired into a ready-to-tick engine.
#![allow(dead_code)]

use async_trait::async_trait;
use autotrader::clock::{ManualClock, SharedClock};
use autotrader::error::{Result, TradingError};
use autotrader::exits::{ExitConfig, ExitPlanMonitor};
use autotrader::models::{
    Bar, IndicatorMap, MarketFrame, MarketSnapshot, Position, SignalAction, TradingSignal,
};
use autotrader::realtime::{DecisionEngine, EngineConfig, ErrorRecoveryManager, RecoveryConfig};
use autotrader::risk::{RiskConfig, RiskManager};
use autotrader::traits::{MarketDataFeed, Strategy};
use autotrader::types::{Price, Symbol};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

/// Flat hourly bars at the given closes
pub fn bars(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let price: Price = format!("{c}").parse().unwrap();
            Bar::flat(start_time() + Duration::hours(i as i64), price)
        })
        .collect()
}

/// Deterministic pseudo-random walk, same LCG for every run
pub fn random_walk(n: usize, start: f64) -> Vec<Bar> {
    let mut price = start;
    let mut closes = Vec::with_capacity(n);
    for i in 0..n {
        let seed = (i as u64).wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let change = ((seed >> 33) % 200) as f64 / 100.0 - 1.0;
        price = (price * (1.0 + change / 50.0)).max(1.0);
        closes.push((price * 100.0).round() / 100.0);
    }
    bars(&closes)
}

/// Feed serving whatever price was last set per symbol
///
/// Queued errors are returned (one per fetch) before any price.
#[derive(Default)]
pub struct ScriptedFeed {
    prices: Mutex<HashMap<Symbol, Price>>,
    indicators: Mutex<HashMap<Symbol, IndicatorMap>>,
    failures: Mutex<VecDeque<TradingError>>,
    fetches: Mutex<usize>,
}

impl ScriptedFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        let price: Price = format!("{price}").parse().unwrap();
        self.prices.lock().unwrap().insert(Symbol::new(symbol), price);
    }

    pub fn set_indicators(&self, symbol: &str, indicators: IndicatorMap) {
        self.indicators
            .lock()
            .unwrap()
            .insert(Symbol::new(symbol), indicators);
    }

    pub fn fail_next(&self, error: TradingError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn fetches(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl MarketDataFeed for ScriptedFeed {
    async fn fetch(&self, symbol: &Symbol, timeframe: &str) -> Result<MarketFrame> {
        *self.fetches.lock().unwrap() += 1;
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let price = self
            .prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| TradingError::MissingData(format!("no price for {symbol}")))?;
        let mut snapshot = MarketSnapshot::at_price(symbol.clone(), price, start_time());
        snapshot.timeframe = timeframe.to_string();
        let indicators = self
            .indicators
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .unwrap_or_default();
        Ok(MarketFrame {
            snapshot,
            indicators,
        })
    }
}

/// Emits the same action every tick while flat
pub struct AlwaysSignal {
    pub name: String,
    pub action: SignalAction,
    pub confidence: f64,
    pub leverage: i64,
    pub stops: Option<(Price, Price)>,
    pub while_holding: bool,
}

impl AlwaysSignal {
    pub fn new(name: &str, action: SignalAction, confidence: f64) -> Self {
        Self {
            name: name.to_string(),
            action,
            confidence,
            leverage: 1,
            stops: None,
            while_holding: false,
        }
    }

    pub fn leverage(mut self, leverage: i64) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn stops(mut self, stop: Price, take: Price) -> Self {
        self.stops = Some((stop, take));
        self
    }

    /// Keep signalling even with a position open
    pub fn while_holding(mut self) -> Self {
        self.while_holding = true;
        self
    }

    pub fn boxed(self) -> Box<dyn Strategy> {
        Box::new(self)
    }
}

impl Strategy for AlwaysSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_signal(
        &mut self,
        snapshot: &MarketSnapshot,
        _indicators: &IndicatorMap,
        position: Option<&Position>,
    ) -> Result<Option<TradingSignal>> {
        if position.is_some() && !self.while_holding {
            return Ok(None);
        }
        let mut signal =
            TradingSignal::new(snapshot.symbol.clone(), self.action, self.confidence, snapshot.price)
                .with_leverage(self.leverage.into());
        if let Some((stop, take)) = self.stops {
            signal = signal.with_stops(stop, take);
        }
        Ok(Some(signal))
    }
}

pub struct Harness {
    pub engine: DecisionEngine,
    pub clock: Arc<ManualClock>,
    pub feed: Arc<ScriptedFeed>,
}

pub fn harness(engine: EngineConfig, risk: RiskConfig, exits: ExitConfig) -> Harness {
    let clock = manual_clock();
    let feed = ScriptedFeed::new();
    let shared: SharedClock = clock.clone();
    let engine = DecisionEngine::new(
        engine,
        RiskManager::new(risk, shared.clone()),
        ExitPlanMonitor::new(exits, shared.clone()),
        ErrorRecoveryManager::new(RecoveryConfig::default(), shared.clone()),
        feed.clone(),
        shared,
    );
    Harness {
        engine,
        clock,
        feed,
    }
}

pub fn default_harness() -> Harness {
    harness(
        EngineConfig::default(),
        RiskConfig::default(),
        ExitConfig::default(),
    )
}
