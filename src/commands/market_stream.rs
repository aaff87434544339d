use crate::error::AppError;
use crate::market::config::StartMarketFeedArgs;
use crate::market::pipeline::{spawn_market_feed, MarketFeedHandle};
use crate::market::types::{
    MarketConnectionState, MarketFeedSession, MarketFeedStatusSnapshot, MarketFeedStopResult,
};
use crate::state::AppState;
use std::sync::Arc;
use tracing::info;

async fn stop_handle(handle: MarketFeedHandle) {
    handle.cancellation_token.cancel();
    let _ = handle.join_handle.await;
}

pub async fn start_market_feed(
    state: &AppState,
    args: Option<StartMarketFeedArgs>,
) -> Result<MarketFeedSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let existing_handle = {
        let mut feed_slot = state.market_feed.lock().await;
        feed_slot.take()
    };
    if let Some(handle) = existing_handle {
        info!("replacing running market feed");
        stop_handle(handle).await;
    }

    let handle = spawn_market_feed(
        config.clone(),
        state.http_client.clone(),
        Arc::clone(&state.market_status),
    );

    {
        let mut feed_slot = state.market_feed.lock().await;
        *feed_slot = Some(handle);
    }

    Ok(MarketFeedSession::from_config(&config))
}

pub async fn stop_market_feed(state: &AppState) -> Result<MarketFeedStopResult, AppError> {
    let existing_handle = {
        let mut feed_slot = state.market_feed.lock().await;
        feed_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        stop_handle(handle).await;
        true
    } else {
        false
    };

    {
        let mut writable = state.market_status.write().await;
        writable.state = MarketConnectionState::Stopped;
        writable.reconnect_attempt = 0;
        writable.reason = Some("feed stopped by command".to_string());
    }

    Ok(MarketFeedStopResult { stopped })
}

pub async fn market_feed_status(state: &AppState) -> Result<MarketFeedStatusSnapshot, AppError> {
    let snapshot = state.market_status.read().await.clone();
    Ok(snapshot)
}
