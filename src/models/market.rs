use crate::types::{Price, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Decimal,
}

impl Bar {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: Price,
        high: Price,
        low: Price,
        close: Price,
        volume: Decimal,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Flat candle where every price equals `close`
    pub fn flat(timestamp: DateTime<Utc>, close: Price) -> Self {
        Self::new(timestamp, close, close, close, close, Decimal::ZERO)
    }
}

/// Point-in-time market view for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub price: Price,
    pub timestamp: DateTime<Utc>,
    pub volume: Decimal,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub timeframe: String,
}

impl MarketSnapshot {
    pub fn from_bar(symbol: Symbol, timeframe: impl Into<String>, bar: &Bar) -> Self {
        Self {
            symbol,
            price: bar.close,
            timestamp: bar.timestamp,
            volume: bar.volume,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            timeframe: timeframe.into(),
        }
    }

    /// Snapshot with only a last price, OHLC collapsed onto it
    pub fn at_price(symbol: Symbol, price: Price, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol,
            price,
            timestamp,
            volume: Decimal::ZERO,
            open: price,
            high: price,
            low: price,
            close: price,
            timeframe: String::new(),
        }
    }
}

/// Named indicator values computed by the data layer
///
/// Ordered so iteration (and therefore any serialized form) is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorMap(BTreeMap<String, f64>);

impl IndicatorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    /// Finite value for `name`; NaN and infinities count as missing
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied().filter(|v| v.is_finite())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }
}

/// What a feed returns per symbol and timeframe
#[derive(Debug, Clone, PartialEq)]
pub struct MarketFrame {
    pub snapshot: MarketSnapshot,
    pub indicators: IndicatorMap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_from_bar() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bar = Bar::new(
            ts,
            Price::from(100),
            Price::from(110),
            Price::from(95),
            Price::from(105),
            Decimal::from(12),
        );
        let snapshot = MarketSnapshot::from_bar(Symbol::new("BTCUSDT"), "1h", &bar);
        assert_eq!(snapshot.price, Price::from(105));
        assert_eq!(snapshot.high, Price::from(110));
        assert_eq!(snapshot.timeframe, "1h");
    }

    #[test]
    fn test_indicator_map_ignores_non_finite() {
        let indicators = IndicatorMap::new()
            .with("rsi", 71.5)
            .with("atr", f64::NAN);
        assert_eq!(indicators.get("rsi"), Some(71.5));
        assert_eq!(indicators.get("atr"), None);
        assert_eq!(indicators.get("macd"), None);
    }
}
