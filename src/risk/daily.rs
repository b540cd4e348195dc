use crate::types::Symbol;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Aggregates for one trading day
///
/// Counters only grow during the day; once the date rolls the state is
/// kept as history and never touched again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRiskState {
    pub date: NaiveDate,
    pub pnl: Decimal,
    /// Settled trades
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub positions_opened: u32,
    pub symbols_traded: BTreeSet<Symbol>,
}

impl DailyRiskState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            pnl: Decimal::ZERO,
            trades: 0,
            wins: 0,
            losses: 0,
            largest_win: Decimal::ZERO,
            largest_loss: Decimal::ZERO,
            positions_opened: 0,
            symbols_traded: BTreeSet::new(),
        }
    }

    pub fn record_open(&mut self, symbol: &Symbol) {
        self.positions_opened += 1;
        self.symbols_traded.insert(symbol.clone());
    }

    pub fn record_trade(&mut self, pnl: Decimal) {
        self.pnl += pnl;
        self.trades += 1;
        if pnl > Decimal::ZERO {
            self.wins += 1;
            self.largest_win = self.largest_win.max(pnl);
        } else if pnl < Decimal::ZERO {
            self.losses += 1;
            self.largest_loss = self.largest_loss.min(pnl);
        }
    }

    /// Percentage of settled trades that were profitable
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            return 0.0;
        }
        self.wins as f64 / self.trades as f64 * 100.0
    }
}
