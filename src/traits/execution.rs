use crate::error::Result;
use crate::models::PositionSide;
use crate::types::{Price, Size, Symbol};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order the live loop wants placed to open or close a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub position_id: String,
    pub symbol: Symbol,
    pub side: PositionSide,
    pub quantity: Size,
    pub price: Price,
    pub leverage: Decimal,
    /// Closing intents only reduce an existing position
    pub reduce_only: bool,
}

/// Hand-off point to whatever actually talks to the venue
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRouter: Send + Sync {
    async fn submit(&self, intent: &OrderIntent) -> Result<()>;
}
