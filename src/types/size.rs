use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::Price;

/// Position quantity in base-asset units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Size(pub Decimal);

impl Size {
    pub const ZERO: Size = Size(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Quantity affordable with `value` of quote currency at `price`
    ///
    /// Zero or negative prices yield a zero quantity rather than an error.
    pub fn from_value(value: Decimal, price: Price) -> Size {
        if !price.is_valid() || value <= Decimal::ZERO {
            return Size::ZERO;
        }
        Size(value / price.value())
    }

    /// Quote-currency value of this quantity at `price`
    pub fn notional(&self, price: Price) -> Decimal {
        self.0 * price.value()
    }
}

impl FromStr for Size {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Decimal::from_str(s)?))
    }
}

impl From<Decimal> for Size {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Size {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let decimal = Decimal::from_str(&s).map_err(serde::de::Error::custom)?;
        Ok(Size(decimal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_from_value() {
        let qty = Size::from_value(Decimal::from(1000), Price::from(50000));
        assert_eq!(qty.value(), Decimal::new(2, 2));
    }

    #[test]
    fn test_size_from_value_with_bad_price() {
        assert!(Size::from_value(Decimal::from(1000), Price::ZERO).is_zero());
        assert!(Size::from_value(Decimal::from(-5), Price::from(10)).is_zero());
    }

    #[test]
    fn test_size_notional() {
        let qty: Size = "0.5".parse().unwrap();
        assert_eq!(qty.notional(Price::from(3000)), Decimal::from(1500));
    }
}
