use crate::error::Result;
use crate::traits::{OrderIntent, OrderRouter};
use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;

/// Router that only records intents; used for paper trading
#[derive(Debug, Default)]
pub struct PaperRouter {
    submitted: Mutex<Vec<OrderIntent>>,
}

impl PaperRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submitted(&self) -> Vec<OrderIntent> {
        self.submitted.lock().await.clone()
    }
}

#[async_trait]
impl OrderRouter for PaperRouter {
    async fn submit(&self, intent: &OrderIntent) -> Result<()> {
        info!(
            "Paper order: {} {} {} @ {} x{}{}",
            intent.symbol,
            intent.side,
            intent.quantity,
            intent.price,
            intent.leverage,
            if intent.reduce_only { " (reduce-only)" } else { "" }
        );
        self.submitted.lock().await.push(intent.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSide;
    use crate::types::{Price, Symbol};
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_paper_router_records_intents() {
        let router = PaperRouter::new();
        let intent = OrderIntent {
            position_id: "p1".into(),
            symbol: Symbol::new("BTCUSDT"),
            side: PositionSide::Long,
            quantity: "0.01".parse().unwrap(),
            price: Price::from(50000),
            leverage: Decimal::from(3),
            reduce_only: false,
        };
        router.submit(&intent).await.unwrap();
        assert_eq!(router.submitted().await, vec![intent]);
    }
}
