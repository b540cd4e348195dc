use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

const EVENT_LIMIT: usize = 100;

/// Account-level drawdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawdownLevel {
    Normal,
    /// New entries blocked, exits still allowed
    Warn,
    /// All trading blocked
    Stopped,
}

impl fmt::Display for DrawdownLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrawdownLevel::Normal => write!(f, "normal"),
            DrawdownLevel::Warn => write!(f, "warn"),
            DrawdownLevel::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownEvent {
    pub timestamp: DateTime<Utc>,
    pub from: DrawdownLevel,
    pub to: DrawdownLevel,
    pub peak_capital: Decimal,
    pub current_capital: Decimal,
    pub drawdown_pct: Decimal,
}

/// Percentage decline from `peak` to `current`, never negative
pub fn drawdown_pct(peak: Decimal, current: Decimal) -> Decimal {
    if peak <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((peak - current) / peak * Decimal::ONE_HUNDRED).max(Decimal::ZERO)
}

/// Three-state gate driven only by drawdown from peak capital
#[derive(Debug, Clone)]
pub struct DrawdownGate {
    warn_pct: Decimal,
    stop_pct: Decimal,
    level: DrawdownLevel,
    events: VecDeque<DrawdownEvent>,
}

impl DrawdownGate {
    pub fn new(warn_pct: Decimal, stop_pct: Decimal) -> Self {
        Self {
            warn_pct,
            stop_pct,
            level: DrawdownLevel::Normal,
            events: VecDeque::new(),
        }
    }

    pub fn level(&self) -> DrawdownLevel {
        self.level
    }

    pub fn blocks_new_entries(&self) -> bool {
        self.level != DrawdownLevel::Normal
    }

    pub fn blocks_trading(&self) -> bool {
        self.level == DrawdownLevel::Stopped
    }

    pub fn level_for(&self, drawdown: Decimal) -> DrawdownLevel {
        if drawdown >= self.stop_pct {
            DrawdownLevel::Stopped
        } else if drawdown >= self.warn_pct {
            DrawdownLevel::Warn
        } else {
            DrawdownLevel::Normal
        }
    }

    /// Recompute the level; returns the transition if it changed
    pub fn evaluate(
        &mut self,
        peak: Decimal,
        current: Decimal,
        now: DateTime<Utc>,
    ) -> Option<DrawdownEvent> {
        let drawdown = drawdown_pct(peak, current);
        let next = self.level_for(drawdown);
        if next == self.level {
            return None;
        }

        let event = DrawdownEvent {
            timestamp: now,
            from: self.level,
            to: next,
            peak_capital: peak,
            current_capital: current,
            drawdown_pct: drawdown,
        };
        match next {
            DrawdownLevel::Stopped => error!(
                "Drawdown gate {} -> {}: {:.2}% from peak {}, all trading blocked",
                self.level,
                next,
                drawdown.round_dp(2),
                peak.round_dp(2)
            ),
            DrawdownLevel::Warn => warn!(
                "Drawdown gate {} -> {}: {:.2}% from peak {}, new entries blocked",
                self.level,
                next,
                drawdown.round_dp(2),
                peak.round_dp(2)
            ),
            DrawdownLevel::Normal => info!(
                "Drawdown gate {} -> {}: recovered to {:.2}%",
                self.level,
                next,
                drawdown.round_dp(2)
            ),
        }

        self.level = next;
        self.events.push_back(event.clone());
        while self.events.len() > EVENT_LIMIT {
            self.events.pop_front();
        }
        Some(event)
    }

    pub fn events(&self) -> impl Iterator<Item = &DrawdownEvent> {
        self.events.iter()
    }
}
