use crate::market::types::MarketConnectionState;
use crate::{error::AppError, state::AppState};
use serde::Serialize;
use std::time::{Duration, Instant};

pub const STALE_RECORD_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub feed: MarketConnectionState,
    pub asset_count: usize,
    pub stale_count: usize,
}

pub async fn build_health_response(state: &AppState) -> HealthResponse {
    let feed_state = state.market_status.read().await.state;
    let (asset_count, stale_count) = match state.current_feed().await {
        Some(feed) => {
            let view = feed.view();
            (view.len(), view.stale_count(STALE_RECORD_AGE))
        }
        None => (0, 0),
    };
    let status = match feed_state {
        MarketConnectionState::Failed | MarketConnectionState::Error => "degraded",
        _ => "ok",
    };

    HealthResponse {
        status,
        uptime_ms: elapsed_ms(state.started_at),
        feed: feed_state,
        asset_count,
        stale_count,
    }
}

fn elapsed_ms(started_at: Instant) -> u128 {
    started_at.elapsed().as_millis()
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    Ok(build_health_response(state).await)
}
