use crate::error::AppError;
use crate::market::binance::fetch_klines;
use crate::market::format::AssetRow;
use crate::market::pipeline::MarketOverview;
use crate::market::ranking::RankingCategory;
use crate::market::types::{Candle, MarketTimeframe};
use crate::state::AppState;
use serde::Deserialize;

pub const DEFAULT_RANKING_LIMIT: usize = 10;
pub const DEFAULT_KLINE_LIMIT: u16 = 50;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketRankingsArgs {
    pub category: Option<RankingCategory>,
    pub limit: Option<usize>,
    pub locked: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSearchArgs {
    pub query: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketKlinesArgs {
    pub symbol: String,
    pub timeframe: Option<String>,
    pub limit: Option<u16>,
}

pub async fn market_assets(state: &AppState) -> Result<Vec<AssetRow>, AppError> {
    Ok(state
        .current_feed()
        .await
        .map(|feed| feed.assets())
        .unwrap_or_default())
}

pub async fn market_rankings(
    state: &AppState,
    args: MarketRankingsArgs,
) -> Result<Vec<AssetRow>, AppError> {
    let category = args.category.unwrap_or(RankingCategory::All);
    let limit = args.limit.unwrap_or(DEFAULT_RANKING_LIMIT);
    let locked = args.locked.unwrap_or(false);

    Ok(state
        .current_feed()
        .await
        .map(|feed| feed.rankings(category, limit, locked))
        .unwrap_or_default())
}

pub async fn market_search(
    state: &AppState,
    args: MarketSearchArgs,
) -> Result<Vec<AssetRow>, AppError> {
    Ok(state
        .current_feed()
        .await
        .map(|feed| feed.search(&args.query))
        .unwrap_or_default())
}

pub async fn market_overview(state: &AppState) -> Result<MarketOverview, AppError> {
    Ok(match state.current_feed().await {
        Some(feed) => feed.overview(),
        None => MarketOverview {
            stats: Default::default(),
            top_gainers: Vec::new(),
            top_losers: Vec::new(),
        },
    })
}

/// Accepts either a bare symbol (`BTC`) or a full pair (`BTCUSDT`).
fn pair_for(symbol: &str, settlement_currency: &str) -> Result<String, AppError> {
    let symbol = symbol.trim().to_ascii_uppercase();
    if symbol.is_empty() {
        return Err(AppError::InvalidArgument("symbol is required".to_string()));
    }
    if symbol.len() > settlement_currency.len() && symbol.ends_with(settlement_currency) {
        Ok(symbol)
    } else {
        Ok(format!("{symbol}{settlement_currency}"))
    }
}

pub async fn market_klines(
    state: &AppState,
    args: MarketKlinesArgs,
) -> Result<Vec<Candle>, AppError> {
    let feed = state.current_feed().await.ok_or(AppError::FeedNotRunning)?;
    let pair = pair_for(&args.symbol, &feed.config().settlement_currency)?;
    let timeframe = match args.timeframe.as_deref() {
        Some(raw) => MarketTimeframe::parse_str(raw)?,
        None => MarketTimeframe::default(),
    };
    let limit = args.limit.unwrap_or(DEFAULT_KLINE_LIMIT);

    fetch_klines(
        &state.http_client,
        feed.rest_pool(),
        &pair,
        timeframe,
        limit,
        feed.config().snapshot_timeout,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::market_stream::tests::install_loaded_feed;

    #[tokio::test]
    async fn queries_without_feed_are_empty() {
        let state = AppState::default();

        assert!(market_assets(&state).await.unwrap().is_empty());
        assert!(market_rankings(&state, MarketRankingsArgs::default())
            .await
            .unwrap()
            .is_empty());
        assert!(market_search(&state, MarketSearchArgs { query: "btc".to_string() })
            .await
            .unwrap()
            .is_empty());
        assert_eq!(market_overview(&state).await.unwrap().stats.active_coins, 0);
    }

    #[tokio::test]
    async fn klines_require_a_feed() {
        let state = AppState::default();
        let args = MarketKlinesArgs {
            symbol: "BTC".to_string(),
            timeframe: None,
            limit: None,
        };

        let result = market_klines(&state, args).await;

        assert!(matches!(result, Err(AppError::FeedNotRunning)));
    }

    #[tokio::test]
    async fn klines_reject_unknown_timeframe_before_any_request() {
        let state = AppState::default();
        install_loaded_feed(&state).await;
        let args = MarketKlinesArgs {
            symbol: "BTC".to_string(),
            timeframe: Some("2m".to_string()),
            limit: None,
        };

        let result = market_klines(&state, args).await;

        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn rankings_and_overview_read_the_published_view() {
        let state = AppState::default();
        install_loaded_feed(&state).await;

        let gainers = market_rankings(
            &state,
            MarketRankingsArgs {
                category: Some(RankingCategory::Gainers),
                limit: Some(2),
                locked: None,
            },
        )
        .await
        .unwrap();
        let symbols: Vec<_> = gainers.iter().map(|row| row.record.symbol.as_str()).collect();
        assert_eq!(symbols, ["SOL", "BTC"]);

        let overview = market_overview(&state).await.unwrap();
        assert_eq!(overview.stats.active_coins, 4);
        assert_eq!(overview.top_losers[0].record.symbol, "DOGE");
        assert_eq!(overview.top_gainers.len(), 3);

        let found = market_search(&state, MarketSearchArgs { query: "eth".to_string() })
            .await
            .unwrap();
        assert_eq!(found[0].record.symbol, "ETH");
    }

    #[test]
    fn pair_accepts_bare_symbol_or_full_pair() {
        assert_eq!(pair_for("btc", "USDT").unwrap(), "BTCUSDT");
        assert_eq!(pair_for("ETHUSDT", "USDT").unwrap(), "ETHUSDT");
        assert_eq!(pair_for("USDT", "USDT").unwrap(), "USDTUSDT");
        assert!(pair_for("  ", "USDT").is_err());
    }
}
