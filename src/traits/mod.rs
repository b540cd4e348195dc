pub mod execution;
pub mod market_data;
pub mod strategy;

pub use execution::{OrderIntent, OrderRouter};
pub use market_data::MarketDataFeed;
pub use strategy::Strategy;

#[cfg(test)]
pub use execution::MockOrderRouter;
