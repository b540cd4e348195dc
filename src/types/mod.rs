//! Decimal newtypes for prices and quantities, and the trading pair key.

pub mod price;
pub mod size;
pub mod symbol;

pub use price::Price;
pub use size::Size;
pub use symbol::Symbol;
