pub mod connector;
pub mod simulator;
pub mod types;

pub use connector::ExchangeConnector;
pub use simulator::KlineSimulator;
pub use types::{parse_klines, KlineRequest, KlineSource, TrafficStats};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Interval;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_source_trait_object() {
        let source: Arc<dyn KlineSource> = Arc::new(KlineSimulator::new(11, 1_735_689_600_000).unwrap());

        let candles = source
            .klines(&KlineRequest::latest("BTCUSDT", Interval::H1, 60))
            .await
            .unwrap();
        assert_eq!(candles.len(), 60);
        assert!(candles.windows(2).all(|w| w[0].open_time < w[1].open_time));

        source.reset_session().await;
        assert_eq!(source.traffic().requests, 1);
        assert_eq!(source.now_ms(), 1_735_689_600_000);
    }
}
