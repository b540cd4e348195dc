use crate::types::{Price, Size, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for longs, -1 for shorts
    pub fn sign(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn is_short(&self) -> bool {
        matches!(self, PositionSide::Short)
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// An open leveraged position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: Symbol,
    pub side: PositionSide,
    pub entry_price: Price,
    pub quantity: Size,
    pub leverage: Decimal,
    pub entry_time: DateTime<Utc>,
    pub strategy: String,
    pub entry_confidence: f64,
    /// Notional booked into the exposure ledger at open; released verbatim at close
    pub entry_value: Decimal,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        symbol: Symbol,
        side: PositionSide,
        entry_price: Price,
        quantity: Size,
        leverage: Decimal,
        entry_time: DateTime<Utc>,
        strategy: impl Into<String>,
        entry_confidence: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entry_value: quantity.notional(entry_price),
            symbol,
            side,
            entry_price,
            quantity,
            leverage,
            entry_time,
            strategy: strategy.into(),
            entry_confidence,
        }
    }

    /// Realized (or unrealized) pnl at `price`: `qty * (price - entry) * leverage`, mirrored for shorts
    pub fn pnl_at(&self, price: Price) -> Decimal {
        self.side.sign() * self.quantity.value() * (price.value() - self.entry_price.value())
            * self.leverage
    }

    /// Leverage-adjusted percentage move at `price`
    pub fn pnl_pct_at(&self, price: Price) -> Decimal {
        self.side.sign() * price.pct_change_from(self.entry_price) * self.leverage
    }

    pub fn holding_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_minutes()
    }
}
