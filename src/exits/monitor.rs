use super::plan::{ExitPlan, ExitReason, ExitSignal};
use crate::clock::SharedClock;
use crate::error::{Result, TradingError};
use crate::models::{IndicatorMap, MarketSnapshot};
use crate::types::{Price, Symbol};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// One rung of the tiered trailing profit ladder
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitTier {
    /// Leverage-adjusted peak pnl (percent) that activates the tier
    pub trigger_pct: Decimal,
    /// Leverage-adjusted pnl (percent) the stop is moved to lock in
    pub lock_pct: Decimal,
}

/// Exit monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Close any position held this long
    pub max_holding_hours: u64,
    /// Warn this many hours before the holding limit
    pub holding_warning_hours: u64,
    /// Ascending by trigger
    pub profit_tiers: Vec<ProfitTier>,
    /// Retrace from peak pnl (percent of the peak) that forces an exit
    pub pullback_exit_pct: Decimal,
    /// Peak pnl (percent) the pullback check needs before it arms; zero arms on any gain
    pub pullback_min_peak_pct: Decimal,
    /// Default for new plans
    pub tiered_trailing_enabled: bool,
    /// Exit audit records kept in memory
    pub history_limit: usize,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            max_holding_hours: 36,
            holding_warning_hours: 2,
            profit_tiers: vec![
                ProfitTier {
                    trigger_pct: Decimal::from(8),
                    lock_pct: Decimal::from(3),
                },
                ProfitTier {
                    trigger_pct: Decimal::from(15),
                    lock_pct: Decimal::from(8),
                },
                ProfitTier {
                    trigger_pct: Decimal::from(25),
                    lock_pct: Decimal::from(15),
                },
            ],
            pullback_exit_pct: Decimal::from(30),
            pullback_min_peak_pct: Decimal::ZERO,
            tiered_trailing_enabled: true,
            history_limit: 1000,
        }
    }
}

impl ExitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_holding_hours == 0 {
            return Err(TradingError::invalid_config(
                "exits.max_holding_hours",
                "must be positive",
            ));
        }
        if self
            .profit_tiers
            .windows(2)
            .any(|w| w[0].trigger_pct >= w[1].trigger_pct || w[0].lock_pct > w[1].lock_pct)
        {
            return Err(TradingError::invalid_config(
                "exits.profit_tiers",
                "tiers must be ascending",
            ));
        }
        if self.pullback_exit_pct <= Decimal::ZERO || self.pullback_exit_pct > Decimal::ONE_HUNDRED {
            return Err(TradingError::invalid_config(
                "exits.pullback_exit_pct",
                "must be within (0, 100]",
            ));
        }
        if self.pullback_min_peak_pct < Decimal::ZERO {
            return Err(TradingError::invalid_config(
                "exits.pullback_min_peak_pct",
                "must not be negative",
            ));
        }
        Ok(())
    }
}

/// Audit entry for a closed position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub position_id: String,
    pub symbol: Symbol,
    pub reason: ExitReason,
    pub exit_price: Price,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitStatistics {
    pub total_exits: usize,
    pub by_reason: BTreeMap<ExitReason, usize>,
    pub average_pnl: Decimal,
    pub average_pnl_pct: Decimal,
    pub stop_loss_rate: f64,
    pub take_profit_rate: f64,
    pub trailing_stop_rate: f64,
    pub active_plans: usize,
}

/// Owns the exit plan of every open position
pub struct ExitPlanMonitor {
    config: ExitConfig,
    clock: SharedClock,
    plans: HashMap<String, ExitPlan>,
    history: VecDeque<ExitRecord>,
}

impl ExitPlanMonitor {
    pub fn new(config: ExitConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            plans: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    pub fn add_exit_plan(&mut self, plan: ExitPlan) -> Result<()> {
        if self.plans.contains_key(&plan.position_id) {
            return Err(TradingError::DuplicateExitPlan(plan.position_id));
        }
        info!(
            "Exit plan added for {} ({}): stop={}, target={}, tiered={}",
            plan.position_id, plan.symbol, plan.stop_loss, plan.take_profit, plan.tiered_trailing_enabled
        );
        self.plans.insert(plan.position_id.clone(), plan);
        Ok(())
    }

    pub fn remove_exit_plan(&mut self, position_id: &str) -> Option<ExitPlan> {
        let removed = self.plans.remove(position_id);
        if removed.is_some() {
            debug!("Exit plan removed for {}", position_id);
        }
        removed
    }

    pub fn get_exit_plan(&self, position_id: &str) -> Option<&ExitPlan> {
        self.plans.get(position_id)
    }

    pub fn plans(&self) -> impl Iterator<Item = &ExitPlan> {
        self.plans.values()
    }

    pub fn active_plans(&self) -> usize {
        self.plans.len()
    }

    /// Decide whether the position behind `position_id` must close at `price`
    ///
    /// Checks run in fixed priority: holding timeout, tiered trailing
    /// pullback, stop-loss, take-profit, then invalidation rules. The only
    /// state this mutates is the plan's watermarks and ratcheted stop.
    pub fn check_exit_conditions(
        &mut self,
        position_id: &str,
        price: Price,
        snapshot: &MarketSnapshot,
        indicators: &IndicatorMap,
    ) -> Option<ExitSignal> {
        let now = self.clock.now();
        let config = &self.config;
        let plan = match self.plans.get_mut(position_id) {
            Some(plan) => plan,
            None => {
                debug!("No exit plan for position {}", position_id);
                return None;
            }
        };

        if !price.is_valid() {
            warn!(
                "Skipping exit check for {}: invalid price {}",
                position_id, price
            );
            return None;
        }

        let pnl_pct = plan.pnl_pct_at(price);

        // 1. holding time
        let age = now - plan.created_at;
        let limit = ChronoDuration::hours(config.max_holding_hours as i64);
        if age >= limit {
            let hours = age.num_minutes() as f64 / 60.0;
            return Some(ExitSignal::exit(
                ExitReason::Timeout,
                price,
                format!(
                    "held {:.1}h (limit {}h), pnl {:.2}%",
                    hours,
                    config.max_holding_hours,
                    pnl_pct.round_dp(2)
                ),
            ));
        }
        let warn_at = limit - ChronoDuration::hours(config.holding_warning_hours as i64);
        if age >= warn_at && !plan.holding_warned {
            plan.holding_warned = true;
            warn!(
                "Position {} ({}) approaching holding limit: {}h of {}h, pnl {:.2}%",
                position_id,
                plan.symbol,
                age.num_hours(),
                config.max_holding_hours,
                pnl_pct.round_dp(2)
            );
        }

        plan.update_watermarks(price);

        // 2. tiered trailing profit
        if plan.tiered_trailing_enabled {
            if pnl_pct > plan.peak_pnl_pct {
                plan.peak_pnl_pct = pnl_pct;
            }
            ratchet_profit_tier(plan, &config.profit_tiers);

            if plan.peak_pnl_pct > config.pullback_min_peak_pct.max(Decimal::ZERO) {
                let pullback =
                    (plan.peak_pnl_pct - pnl_pct) / plan.peak_pnl_pct * Decimal::ONE_HUNDRED;
                if pullback > config.pullback_exit_pct {
                    return Some(ExitSignal::exit(
                        ExitReason::TrailingStop,
                        price,
                        format!(
                            "pnl {:.2}% retraced {:.1}% from peak {:.2}%",
                            pnl_pct.round_dp(2),
                            pullback.round_dp(1),
                            plan.peak_pnl_pct.round_dp(2)
                        ),
                    ));
                }
            }
        }

        // classic percent trailing
        if let Some(trailing) = plan.trailing {
            if plan.favourable_move_pct(price) >= trailing.trailing_offset_pct {
                let candidate = if plan.is_short {
                    plan.lowest_price.offset_by_pct(trailing.trailing_stop_pct)
                } else {
                    plan.highest_price.offset_by_pct(-trailing.trailing_stop_pct)
                };
                if plan.tighten_stop(candidate) {
                    debug!("Trailing stop for {} moved to {}", position_id, candidate);
                }
            }
        }

        // 3. stop / target
        if plan.stop_hit(price) {
            // a stop ratcheted past entry is a trailing exit, not a loss cut
            let reason = if stop_in_profit(plan) {
                ExitReason::TrailingStop
            } else {
                ExitReason::StopLoss
            };
            return Some(ExitSignal::exit(
                reason,
                price,
                format!(
                    "price {} crossed stop {} (entry {}), pnl {:.2}%",
                    price,
                    plan.stop_loss,
                    plan.entry_price,
                    pnl_pct.round_dp(2)
                ),
            ));
        }
        if plan.target_hit(price) {
            return Some(ExitSignal::exit(
                ExitReason::TakeProfit,
                price,
                format!(
                    "price {} reached target {}, pnl {:.2}%",
                    price,
                    plan.take_profit,
                    pnl_pct.round_dp(2)
                ),
            ));
        }

        // 4. thesis invalidation
        if let Some(rule) = plan
            .invalidations
            .iter()
            .find(|rule| rule.is_triggered(snapshot, indicators))
        {
            return Some(ExitSignal::exit(
                ExitReason::Invalidation,
                price,
                format!("invalidation triggered: {}", rule.name()),
            ));
        }

        None
    }

    pub fn record_exit(
        &mut self,
        position_id: &str,
        symbol: Symbol,
        signal: &ExitSignal,
        pnl: Decimal,
        pnl_pct: Decimal,
    ) {
        info!(
            "Position {} ({}) closed: {} at {}, pnl {} ({:.2}%) - {}",
            position_id,
            symbol,
            signal.reason,
            signal.price,
            pnl.round_dp(2),
            pnl_pct.round_dp(2),
            signal.details
        );
        self.history.push_back(ExitRecord {
            position_id: position_id.to_string(),
            symbol,
            reason: signal.reason,
            exit_price: signal.price,
            pnl,
            pnl_pct,
            details: signal.details.clone(),
            timestamp: self.clock.now(),
        });
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }

    pub fn exit_history(&self) -> impl Iterator<Item = &ExitRecord> {
        self.history.iter()
    }

    pub fn get_exit_statistics(&self) -> ExitStatistics {
        let total = self.history.len();
        let mut stats = ExitStatistics {
            total_exits: total,
            active_plans: self.plans.len(),
            ..Default::default()
        };
        if total == 0 {
            return stats;
        }

        let mut pnl_sum = Decimal::ZERO;
        let mut pnl_pct_sum = Decimal::ZERO;
        for record in &self.history {
            *stats.by_reason.entry(record.reason).or_insert(0) += 1;
            pnl_sum += record.pnl;
            pnl_pct_sum += record.pnl_pct;
        }
        let count = Decimal::from(total);
        stats.average_pnl = pnl_sum / count;
        stats.average_pnl_pct = pnl_pct_sum / count;

        let rate = |reason: ExitReason| {
            stats.by_reason.get(&reason).copied().unwrap_or(0) as f64 / total as f64 * 100.0
        };
        stats.stop_loss_rate = rate(ExitReason::StopLoss);
        stats.take_profit_rate = rate(ExitReason::TakeProfit);
        stats.trailing_stop_rate = rate(ExitReason::TrailingStop);
        stats
    }

    /// Re-register plans restored from a persisted snapshot
    pub fn restore(&mut self, plans: Vec<ExitPlan>) {
        for plan in plans {
            self.plans.insert(plan.position_id.clone(), plan);
        }
    }
}

fn stop_in_profit(plan: &ExitPlan) -> bool {
    if plan.is_short {
        plan.stop_loss < plan.entry_price
    } else {
        plan.stop_loss > plan.entry_price
    }
}

/// Lock the highest tier reached by the peak; the stop never loosens
fn ratchet_profit_tier(plan: &mut ExitPlan, tiers: &[ProfitTier]) {
    let reached = tiers
        .iter()
        .enumerate()
        .rev()
        .find(|(_, tier)| plan.peak_pnl_pct >= tier.trigger_pct);

    if let Some((index, tier)) = reached {
        if plan.locked_tier.is_some_and(|locked| locked >= index) {
            return;
        }
        // tiers are in leveraged pnl terms, the stop is a price
        let price_lock = if plan.leverage > Decimal::ZERO {
            tier.lock_pct / plan.leverage
        } else {
            tier.lock_pct
        };
        let offset = if plan.is_short { -price_lock } else { price_lock };
        let candidate = plan.entry_price.offset_by_pct(offset);
        plan.tighten_stop(candidate);
        plan.locked_tier = Some(index);
        info!(
            "Profit tier {} locked for {}: peak {:.2}% -> stop {} (+{}%)",
            index + 1,
            plan.position_id,
            plan.peak_pnl_pct.round_dp(2),
            plan.stop_loss,
            tier.lock_pct
        );
    }
}
