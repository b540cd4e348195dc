use crate::error::Result;
use crate::models::{IndicatorMap, MarketSnapshot, Position, TradingSignal};

/// Signal generator polled by the decision loop and the backtester
///
/// Implementations see only the snapshot and indicators handed to them, so
/// the same strategy runs live and in replay without look-ahead.
pub trait Strategy: Send + Sync {
    /// Stable name recorded on positions and decisions
    fn name(&self) -> &str;

    /// Produce a signal for the current snapshot, or `None` to stay out
    ///
    /// `position` is the strategy's open position on this symbol, if any.
    /// Returning `TradingError::MissingData` marks a data fault: the loop
    /// skips this strategy for the tick without counting it as a failure.
    fn generate_signal(
        &mut self,
        snapshot: &MarketSnapshot,
        indicators: &IndicatorMap,
        position: Option<&Position>,
    ) -> Result<Option<TradingSignal>>;
}

impl<S: Strategy + ?Sized> Strategy for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn generate_signal(
        &mut self,
        snapshot: &MarketSnapshot,
        indicators: &IndicatorMap,
        position: Option<&Position>,
    ) -> Result<Option<TradingSignal>> {
        (**self).generate_signal(snapshot, indicators, position)
    }
}
