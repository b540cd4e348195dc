use crate::models::{IndicatorMap, MarketSnapshot, Position};
use crate::types::{Price, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Invalidation,
    TrailingStop,
    Manual,
    Timeout,
    /// Strategy emitted an explicit close action
    Signal,
    /// Forced close when a replay runs out of bars
    BacktestEnd,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::Invalidation => "invalidation",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::Manual => "manual",
            ExitReason::Timeout => "timeout",
            ExitReason::Signal => "signal",
            ExitReason::BacktestEnd => "backtest_end",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classic percent trailing stop
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingParams {
    /// Distance of the stop behind the watermark, in percent of price
    pub trailing_stop_pct: Decimal,
    /// Minimum favourable move from entry (percent) before trailing engages
    pub trailing_offset_pct: Decimal,
}

type InvalidationFn = dyn Fn(&MarketSnapshot, &IndicatorMap) -> bool + Send + Sync;

/// Strategy-supplied condition that voids the trade thesis
#[derive(Clone)]
pub struct InvalidationRule {
    name: String,
    predicate: Arc<InvalidationFn>,
}

impl InvalidationRule {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&MarketSnapshot, &IndicatorMap) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Fires when `indicator` rises above `threshold`; a missing indicator never fires
    pub fn indicator_above(indicator: impl Into<String>, threshold: f64) -> Self {
        let indicator = indicator.into();
        let name = format!("{indicator} > {threshold}");
        Self::new(name, move |_, indicators| {
            indicators.get(&indicator).is_some_and(|v| v > threshold)
        })
    }

    pub fn indicator_below(indicator: impl Into<String>, threshold: f64) -> Self {
        let indicator = indicator.into();
        let name = format!("{indicator} < {threshold}");
        Self::new(name, move |_, indicators| {
            indicators.get(&indicator).is_some_and(|v| v < threshold)
        })
    }

    pub fn price_below(level: Price) -> Self {
        Self::new(format!("price < {level}"), move |snapshot, _| {
            snapshot.price < level
        })
    }

    pub fn price_above(level: Price) -> Self {
        Self::new(format!("price > {level}"), move |snapshot, _| {
            snapshot.price > level
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_triggered(&self, snapshot: &MarketSnapshot, indicators: &IndicatorMap) -> bool {
        (self.predicate)(snapshot, indicators)
    }
}

impl fmt::Debug for InvalidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRule")
            .field("name", &self.name)
            .finish()
    }
}

/// Exit policy attached to exactly one open position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitPlan {
    pub position_id: String,
    pub symbol: Symbol,
    pub entry_price: Price,
    pub stop_loss: Price,
    pub take_profit: Price,
    /// Predicates are code and are not persisted
    #[serde(skip)]
    pub invalidations: Vec<InvalidationRule>,
    pub trailing: Option<TrailingParams>,
    pub highest_price: Price,
    pub lowest_price: Price,
    pub leverage: Decimal,
    pub peak_pnl_pct: Decimal,
    pub is_short: bool,
    pub created_at: DateTime<Utc>,
    pub tiered_trailing_enabled: bool,
    /// Index of the highest profit tier locked so far
    #[serde(default)]
    pub locked_tier: Option<usize>,
    #[serde(default)]
    pub holding_warned: bool,
}

impl ExitPlan {
    pub fn for_position(position: &Position, stop_loss: Price, take_profit: Price) -> Self {
        Self {
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            entry_price: position.entry_price,
            stop_loss,
            take_profit,
            invalidations: Vec::new(),
            trailing: None,
            highest_price: position.entry_price,
            lowest_price: position.entry_price,
            leverage: position.leverage,
            peak_pnl_pct: Decimal::ZERO,
            is_short: position.side.is_short(),
            created_at: position.entry_time,
            tiered_trailing_enabled: true,
            locked_tier: None,
            holding_warned: false,
        }
    }

    pub fn with_trailing(mut self, trailing: Option<TrailingParams>) -> Self {
        self.trailing = trailing;
        self
    }

    pub fn with_invalidations(mut self, rules: Vec<InvalidationRule>) -> Self {
        self.invalidations = rules;
        self
    }

    pub fn with_tiered_trailing(mut self, enabled: bool) -> Self {
        self.tiered_trailing_enabled = enabled;
        self
    }

    /// Leverage-adjusted pnl percentage at `price`
    pub fn pnl_pct_at(&self, price: Price) -> Decimal {
        let raw = price.pct_change_from(self.entry_price);
        let directional = if self.is_short { -raw } else { raw };
        directional * self.leverage
    }

    /// Unleveraged favourable move from entry, in percent
    pub fn favourable_move_pct(&self, price: Price) -> Decimal {
        let raw = price.pct_change_from(self.entry_price);
        if self.is_short {
            -raw
        } else {
            raw
        }
    }

    /// Move the stop toward `candidate` only if that tightens it
    ///
    /// Returns true when the stop changed.
    pub fn tighten_stop(&mut self, candidate: Price) -> bool {
        let tighter = if self.is_short {
            candidate < self.stop_loss
        } else {
            candidate > self.stop_loss
        };
        if tighter {
            self.stop_loss = candidate;
        }
        tighter
    }

    pub fn update_watermarks(&mut self, price: Price) {
        if price > self.highest_price {
            self.highest_price = price;
        }
        if price < self.lowest_price {
            self.lowest_price = price;
        }
    }

    pub fn stop_hit(&self, price: Price) -> bool {
        if self.is_short {
            price >= self.stop_loss
        } else {
            price <= self.stop_loss
        }
    }

    pub fn target_hit(&self, price: Price) -> bool {
        if self.is_short {
            price <= self.take_profit
        } else {
            price >= self.take_profit
        }
    }
}

/// Verdict returned when a plan wants its position closed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub should_exit: bool,
    pub reason: ExitReason,
    pub price: Price,
    pub details: String,
}

impl ExitSignal {
    pub fn exit(reason: ExitReason, price: Price, details: impl Into<String>) -> Self {
        Self {
            should_exit: true,
            reason,
            price,
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSide;
    use chrono::TimeZone;

    fn plan(side: PositionSide) -> ExitPlan {
        let position = Position::open(
            Symbol::new("ETHUSDT"),
            side,
            Price::from(2000),
            "1".parse().unwrap(),
            Decimal::from(5),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            "test",
            0.8,
        );
        ExitPlan::for_position(&position, Price::from(1900), Price::from(2200))
    }

    #[test]
    fn test_tighten_stop_long_only_moves_up() {
        let mut p = plan(PositionSide::Long);
        assert!(p.tighten_stop(Price::from(1950)));
        assert!(!p.tighten_stop(Price::from(1920)));
        assert_eq!(p.stop_loss, Price::from(1950));
    }

    #[test]
    fn test_tighten_stop_short_only_moves_down() {
        let mut p = plan(PositionSide::Short);
        p.stop_loss = Price::from(2100);
        assert!(p.tighten_stop(Price::from(2050)));
        assert!(!p.tighten_stop(Price::from(2080)));
        assert_eq!(p.stop_loss, Price::from(2050));
    }

    #[test]
    fn test_leveraged_pnl_pct() {
        let p = plan(PositionSide::Long);
        assert_eq!(p.pnl_pct_at(Price::from(2040)), Decimal::from(10));

        let s = plan(PositionSide::Short);
        assert_eq!(s.pnl_pct_at(Price::from(2040)), Decimal::from(-10));
    }

    #[test]
    fn test_indicator_invalidation_rule() {
        let rule = InvalidationRule::indicator_above("rsi", 80.0);
        let snapshot = MarketSnapshot::at_price(
            Symbol::new("ETHUSDT"),
            Price::from(2000),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        assert!(!rule.is_triggered(&snapshot, &IndicatorMap::new()));
        assert!(!rule.is_triggered(&snapshot, &IndicatorMap::new().with("rsi", 75.0)));
        assert!(rule.is_triggered(&snapshot, &IndicatorMap::new().with("rsi", 85.0)));
        assert_eq!(rule.name(), "rsi > 80");
    }

    #[test]
    fn test_exit_reason_wire_names() {
        let json = serde_json::to_string(&ExitReason::BacktestEnd).unwrap();
        assert_eq!(json, "\"backtest_end\"");
        assert_eq!(ExitReason::TrailingStop.to_string(), "trailing_stop");
    }

    #[test]
    fn test_price_invalidation_rules() {
        let at = |price: i64| {
            MarketSnapshot::at_price(
                Symbol::new("ETHUSDT"),
                Price::from(price),
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            )
        };
        let below = InvalidationRule::price_below(Price::from(1950));
        let above = InvalidationRule::price_above(Price::from(2050));
        let none = IndicatorMap::new();

        assert!(below.is_triggered(&at(1949), &none));
        assert!(!below.is_triggered(&at(1950), &none));
        assert!(above.is_triggered(&at(2051), &none));
        assert!(!above.is_triggered(&at(2050), &none));
    }
}
