use crate::error::Result;
use crate::models::MarketFrame;
use crate::types::Symbol;
use async_trait::async_trait;

/// Source of live snapshots and indicators
///
/// Timeouts and throttling should surface as `FeedTimeout` / `RateLimited`
/// so the loop can retry them; a zero or absent price as `MissingData`.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    async fn fetch(&self, symbol: &Symbol, timeframe: &str) -> Result<MarketFrame>;
}
