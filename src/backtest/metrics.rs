use super::engine::{EquityPoint, Trade};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggregate statistics of one replay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub final_equity: Decimal,
    pub total_return: Decimal,
    pub total_return_pct: Decimal,
    pub num_trades: usize,
    pub num_wins: usize,
    pub num_losses: usize,
    /// Percent of trades with positive pnl
    pub win_rate: f64,
    pub total_profit: Decimal,
    pub total_loss: Decimal,
    pub profit_factor: f64,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub avg_win_loss_ratio: f64,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    /// Expected pnl per trade
    pub expectancy: Decimal,
    /// Mean over standard deviation of per-trade pnl %
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub max_drawdown_pct: f64,
    pub avg_trade_duration_minutes: f64,
    pub total_fees: Decimal,
}

impl BacktestMetrics {
    pub fn calculate(
        trades: &[Trade],
        equity_curve: &[EquityPoint],
        initial_capital: Decimal,
    ) -> Self {
        let final_equity = equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(initial_capital);
        let total_return = final_equity - initial_capital;
        let total_return_pct = if initial_capital.is_zero() {
            Decimal::ZERO
        } else {
            total_return / initial_capital * Decimal::ONE_HUNDRED
        };
        let max_drawdown_pct = max_drawdown_pct(equity_curve, initial_capital);

        let mut metrics = BacktestMetrics {
            final_equity,
            total_return,
            total_return_pct,
            max_drawdown_pct,
            ..Default::default()
        };
        if trades.is_empty() {
            return metrics;
        }

        let (wins, losses): (Vec<&Trade>, Vec<&Trade>) =
            trades.iter().partition(|t| t.pnl > Decimal::ZERO);
        metrics.num_trades = trades.len();
        metrics.num_wins = wins.len();
        metrics.num_losses = losses.len();
        metrics.win_rate = wins.len() as f64 / trades.len() as f64 * 100.0;

        metrics.total_profit = wins.iter().map(|t| t.pnl).sum();
        metrics.total_loss = losses.iter().map(|t| t.pnl).sum::<Decimal>().abs();
        metrics.profit_factor = ratio(metrics.total_profit, metrics.total_loss);
        if !wins.is_empty() {
            metrics.avg_win = metrics.total_profit / Decimal::from(wins.len());
        }
        if !losses.is_empty() {
            metrics.avg_loss = metrics.total_loss / Decimal::from(losses.len());
        }
        metrics.avg_win_loss_ratio = ratio(metrics.avg_win, metrics.avg_loss);
        metrics.largest_win = wins.iter().map(|t| t.pnl).max().unwrap_or(Decimal::ZERO);
        metrics.largest_loss = losses.iter().map(|t| t.pnl).min().unwrap_or(Decimal::ZERO);

        let (mut run_wins, mut run_losses) = (0, 0);
        for trade in trades {
            if trade.pnl > Decimal::ZERO {
                run_wins += 1;
                run_losses = 0;
            } else {
                run_losses += 1;
                run_wins = 0;
            }
            metrics.max_consecutive_wins = metrics.max_consecutive_wins.max(run_wins);
            metrics.max_consecutive_losses = metrics.max_consecutive_losses.max(run_losses);
        }

        let n = Decimal::from(trades.len());
        metrics.expectancy = (metrics.avg_win * Decimal::from(wins.len())
            - metrics.avg_loss * Decimal::from(losses.len()))
            / n;

        let returns: Vec<f64> = trades.iter().map(|t| to_f64(t.pnl_pct)).collect();
        let mean = mean(&returns);
        metrics.sharpe_ratio = match sample_std(&returns) {
            Some(std) if std > 0.0 => mean / std,
            _ => 0.0,
        };
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        metrics.sortino_ratio = match sample_std(&downside) {
            Some(std) if std > 0.0 => mean / std,
            _ => 0.0,
        };
        if max_drawdown_pct > 0.0 {
            metrics.calmar_ratio = to_f64(total_return_pct) / max_drawdown_pct;
        }

        metrics.avg_trade_duration_minutes =
            trades.iter().map(|t| t.duration_minutes as f64).sum::<f64>() / trades.len() as f64;
        metrics.total_fees = trades.iter().map(|t| t.fees).sum();
        metrics
    }
}

/// Largest peak-to-trough decline of the equity curve, in percent
pub fn max_drawdown_pct(equity_curve: &[EquityPoint], initial_capital: Decimal) -> f64 {
    let mut peak = initial_capital;
    let mut worst = Decimal::ZERO;
    for point in equity_curve {
        if point.equity > peak {
            peak = point.equity;
        }
        if peak > Decimal::ZERO {
            let drawdown = (peak - point.equity) / peak * Decimal::ONE_HUNDRED;
            worst = worst.max(drawdown);
        }
    }
    to_f64(worst)
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn ratio(numerator: Decimal, denominator: Decimal) -> f64 {
    if denominator > Decimal::ZERO {
        to_f64(numerator / denominator)
    } else {
        0.0
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}
