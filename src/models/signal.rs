use super::PositionSide;
use crate::exits::{InvalidationRule, TrailingParams};
use crate::types::{Price, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
    CloseLong,
    CloseShort,
}

impl SignalAction {
    /// Side of the position this action would open, if any
    pub fn entry_side(&self) -> Option<PositionSide> {
        match self {
            SignalAction::Buy => Some(PositionSide::Long),
            SignalAction::Sell => Some(PositionSide::Short),
            SignalAction::Hold | SignalAction::CloseLong | SignalAction::CloseShort => None,
        }
    }

    /// Side of the position this action would close, if any
    pub fn closes_side(&self) -> Option<PositionSide> {
        match self {
            SignalAction::CloseLong => Some(PositionSide::Long),
            SignalAction::CloseShort => Some(PositionSide::Short),
            SignalAction::Buy | SignalAction::Sell | SignalAction::Hold => None,
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Hold => "HOLD",
            SignalAction::CloseLong => "CLOSE_LONG",
            SignalAction::CloseShort => "CLOSE_SHORT",
        };
        f.write_str(s)
    }
}

/// Immutable output of a strategy for one symbol
#[derive(Debug, Clone)]
pub struct TradingSignal {
    pub symbol: Symbol,
    pub action: SignalAction,
    /// In [0, 1]
    pub confidence: f64,
    pub price: Price,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    /// Fraction of capital to commit; backtests fall back to 0.1
    pub size_fraction: Option<Decimal>,
    pub leverage: Decimal,
    pub trailing: Option<TrailingParams>,
    pub invalidations: Vec<InvalidationRule>,
    pub reasoning: String,
    /// Audit-only extras carried into the decision log
    pub metadata: BTreeMap<String, String>,
}

impl TradingSignal {
    pub fn new(symbol: Symbol, action: SignalAction, confidence: f64, price: Price) -> Self {
        Self {
            symbol,
            action,
            confidence: confidence.clamp(0.0, 1.0),
            price,
            stop_loss: None,
            take_profit: None,
            size_fraction: None,
            leverage: Decimal::ONE,
            trailing: None,
            invalidations: Vec::new(),
            reasoning: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn hold(symbol: Symbol, price: Price) -> Self {
        Self::new(symbol, SignalAction::Hold, 0.0, price)
    }

    pub fn with_stops(mut self, stop_loss: Price, take_profit: Price) -> Self {
        self.stop_loss = Some(stop_loss);
        self.take_profit = Some(take_profit);
        self
    }

    pub fn with_leverage(mut self, leverage: Decimal) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn with_size_fraction(mut self, fraction: Decimal) -> Self {
        self.size_fraction = Some(fraction);
        self
    }

    pub fn with_trailing(mut self, trailing: TrailingParams) -> Self {
        self.trailing = Some(trailing);
        self
    }

    pub fn with_invalidation(mut self, rule: InvalidationRule) -> Self {
        self.invalidations.push(rule);
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_actionable(&self) -> bool {
        self.action != SignalAction::Hold
    }

    /// Leverage below 1 is treated as unleveraged
    pub fn effective_leverage(&self) -> Decimal {
        self.leverage.max(Decimal::ONE)
    }

    /// Stop and target for a fresh entry, defaulting to 5% either side
    pub fn exit_levels(&self, side: PositionSide, entry: Price) -> (Price, Price) {
        let five = Decimal::from(5);
        let (default_stop, default_target) = match side {
            PositionSide::Long => (entry.offset_by_pct(-five), entry.offset_by_pct(five)),
            PositionSide::Short => (entry.offset_by_pct(five), entry.offset_by_pct(-five)),
        };
        (
            self.stop_loss.unwrap_or(default_stop),
            self.take_profit.unwrap_or(default_target),
        )
    }
}
