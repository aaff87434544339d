use crate::market::pipeline::{MarketFeed, MarketFeedHandle};
use crate::market::types::MarketFeedStatusSnapshot;
use reqwest::Client;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

pub struct AppState {
    pub started_at: Instant,
    pub http_client: Client,
    pub market_feed: Mutex<Option<MarketFeedHandle>>,
    pub market_status: Arc<RwLock<MarketFeedStatusSnapshot>>,
}

impl AppState {
    pub fn new(http_client: Client) -> Self {
        let market_status = MarketFeedStatusSnapshot::stopped(Some("feed idle".to_string()));

        Self {
            started_at: Instant::now(),
            http_client,
            market_feed: Mutex::new(None),
            market_status: Arc::new(RwLock::new(market_status)),
        }
    }

    /// The running feed, if any.
    pub async fn current_feed(&self) -> Option<Arc<MarketFeed>> {
        self.market_feed
            .lock()
            .await
            .as_ref()
            .map(|handle| Arc::clone(&handle.feed))
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Client::new())
    }
}
