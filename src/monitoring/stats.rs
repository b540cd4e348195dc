use crate::error::Result;
use crate::realtime::EngineSnapshot;
use chrono::{DateTime, Utc};
use log::info;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

/// One periodic performance sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub timestamp: DateTime<Utc>,
    pub capital: Decimal,
    pub open_positions: usize,
    pub daily_pnl: Decimal,
    pub total_pnl: Decimal,
    pub total_trades: u64,
    pub daily_trades: u32,
    pub win_rate: f64,
    pub max_drawdown_pct: Decimal,
    pub decisions: u64,
    pub loops: u64,
}

impl PerformanceSample {
    pub fn from_snapshot(snapshot: &EngineSnapshot) -> Self {
        let today = snapshot.risk.today.as_ref();
        Self {
            timestamp: snapshot.timestamp,
            capital: snapshot.risk.capital,
            open_positions: snapshot.open_positions(),
            daily_pnl: today.map(|d| d.pnl).unwrap_or(Decimal::ZERO),
            total_pnl: snapshot.risk.total_pnl,
            total_trades: snapshot.risk.total_trades,
            daily_trades: today.map(|d| d.trades).unwrap_or(0),
            win_rate: snapshot.risk.win_rate,
            max_drawdown_pct: snapshot.risk.max_drawdown_pct,
            decisions: snapshot.total_decisions,
            loops: snapshot.total_loops,
        }
    }
}

/// Keeps a bounded series of samples and logs summaries
#[derive(Debug)]
pub struct StatsReporter {
    samples: VecDeque<PerformanceSample>,
    capacity: usize,
    initial_capital: Decimal,
}

impl StatsReporter {
    pub fn new(initial_capital: Decimal, capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
            initial_capital,
        }
    }

    pub fn record(&mut self, snapshot: &EngineSnapshot) -> &PerformanceSample {
        self.samples
            .push_back(PerformanceSample::from_snapshot(snapshot));
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        // just pushed
        &self.samples[self.samples.len() - 1]
    }

    pub fn latest(&self) -> Option<&PerformanceSample> {
        self.samples.back()
    }

    pub fn samples(&self) -> impl Iterator<Item = &PerformanceSample> {
        self.samples.iter()
    }

    pub fn total_return_pct(&self) -> Decimal {
        match self.latest() {
            Some(s) if !self.initial_capital.is_zero() => {
                (s.capital - self.initial_capital) / self.initial_capital * Decimal::ONE_HUNDRED
            }
            _ => Decimal::ZERO,
        }
    }

    pub fn log_summary(&self) {
        let Some(s) = self.latest() else {
            return;
        };
        info!(
            "Performance: capital={} ({:+.2}%), pnl today={}, total={}, trades={} ({} today), win rate={:.1}%, max drawdown={:.2}%, open={}, loops={}, decisions={}",
            s.capital.round_dp(2),
            self.total_return_pct(),
            s.daily_pnl.round_dp(2),
            s.total_pnl.round_dp(2),
            s.total_trades,
            s.daily_trades,
            s.win_rate,
            s.max_drawdown_pct.round_dp(2),
            s.open_positions,
            s.loops,
            s.decisions
        );
    }

    /// Write every retained sample as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let samples: Vec<&PerformanceSample> = self.samples.iter().collect();
        std::fs::write(path, serde_json::to_string_pretty(&samples)?)?;
        info!("Saved {} performance samples to {}", samples.len(), path.display());
        Ok(())
    }
}
