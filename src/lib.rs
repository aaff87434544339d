pub mod commands;
pub mod error;
pub mod logging;
pub mod market;
pub mod state;

use commands::health::health;
use commands::market_query::{market_rankings, MarketRankingsArgs};
use commands::market_stream::{start_market_feed, stop_market_feed};
use error::AppError;
use market::config::StartMarketFeedArgs;
use market::ranking::RankingCategory;
use state::AppState;
use std::time::Duration;
use tracing::{info, warn};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(15);
const SUMMARY_TOP_COUNT: usize = 5;

async fn log_summary(state: &AppState) -> Result<(), AppError> {
    let report = health(state).await?;
    let gainers = market_rankings(
        state,
        MarketRankingsArgs {
            category: Some(RankingCategory::Gainers),
            limit: Some(SUMMARY_TOP_COUNT),
            locked: None,
        },
    )
    .await?;
    let leaders: Vec<String> = gainers
        .iter()
        .map(|row| format!("{} {}", row.record.symbol, row.percent_display))
        .collect();

    info!(
        feed = ?report.feed,
        assets = report.asset_count,
        stale = report.stale_count,
        top_gainers = ?leaders,
        "market summary"
    );
    Ok(())
}

/// Runs the feed with environment configuration until ctrl-c.
pub async fn run() -> Result<(), AppError> {
    let args = StartMarketFeedArgs::from_env()?;
    let state = AppState::default();
    let session = start_market_feed(&state, Some(args)).await?;
    info!(
        settlement = %session.settlement_currency,
        topics = ?session.topics,
        "market feed started"
    );

    let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
    summary.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            _ = summary.tick() => {
                if let Err(error) = log_summary(&state).await {
                    warn!(%error, "market summary failed");
                }
            }
        }
    }

    let result = stop_market_feed(&state).await?;
    info!(stopped = result.stopped, "market feed shut down");
    Ok(())
}
