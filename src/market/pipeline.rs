use crate::error::AppError;
use crate::market::binance::{
    HttpSnapshotTransport, SnapshotTransport, StreamTransport, WsTransport,
};
use crate::market::config::MarketFeedConfig;
use crate::market::endpoints::EndpointPool;
use crate::market::format::{AssetRow, MarketStats};
use crate::market::publish::{MarketView, PublishScheduler, ViewSnapshot};
use crate::market::ranking::{
    rank, search, top_gainers, top_losers, LockedOrderBook, RankingCategory,
};
use crate::market::snapshot::{SnapshotFetcher, SnapshotOptions};
use crate::market::store::{IngestionStore, TickApplyOutcome};
use crate::market::stream::{BackoffPolicy, StreamConnection, StreamSettings, StreamStateChange};
use crate::market::types::{
    AssetRecord, ConnectionPhase, MarketConnectionState, MarketFeedStatusSnapshot,
};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATUS_HEARTBEAT_MS: u64 = 1_000;
const STATUS_ERROR_THROTTLE_MS: u64 = 500;
const SUMMARY_INTERVAL_MS: u64 = 30_000;
const OVERVIEW_TOP_COUNT: usize = 3;

#[derive(Debug, Default)]
struct IngestCounters {
    applied: AtomicU64,
    unknown: AtomicU64,
    foreign: AtomicU64,
}

impl IngestCounters {
    fn record(&self, outcome: TickApplyOutcome) {
        let counter = match outcome {
            TickApplyOutcome::Applied { .. } => &self.applied,
            TickApplyOutcome::UnknownSymbol => &self.unknown,
            TickApplyOutcome::ForeignPair => &self.foreign,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.applied.load(Ordering::Relaxed),
            self.unknown.load(Ordering::Relaxed),
            self.foreign.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketOverview {
    pub stats: MarketStats,
    pub top_gainers: Vec<AssetRow>,
    pub top_losers: Vec<AssetRow>,
}

fn rows(records: Vec<AssetRecord>, snapshot: &ViewSnapshot) -> Vec<AssetRow> {
    records
        .into_iter()
        .map(|record| {
            let direction = snapshot.direction(&record.symbol);
            AssetRow::new(record, direction)
        })
        .collect()
}

/// One ingestion session: store, publisher and the query surface over the
/// published view.
pub struct MarketFeed {
    config: MarketFeedConfig,
    store: IngestionStore,
    scheduler: PublishScheduler,
    locks: Mutex<LockedOrderBook>,
    rest_pool: Arc<EndpointPool>,
    stream_pool: Arc<EndpointPool>,
    counters: IngestCounters,
}

impl MarketFeed {
    pub fn new(config: MarketFeedConfig) -> Self {
        let store = IngestionStore::new(config.settlement_currency.clone(), config.direction_decay);
        let scheduler = PublishScheduler::new(store.clone());
        Self {
            locks: Mutex::new(LockedOrderBook::new(config.relock_policy)),
            rest_pool: Arc::new(config.rest_pool()),
            stream_pool: Arc::new(config.stream_pool()),
            counters: IngestCounters::default(),
            store,
            scheduler,
            config,
        }
    }

    pub fn config(&self) -> &MarketFeedConfig {
        &self.config
    }

    pub fn store(&self) -> &IngestionStore {
        &self.store
    }

    pub fn scheduler(&self) -> &PublishScheduler {
        &self.scheduler
    }

    pub fn view(&self) -> MarketView {
        self.scheduler.view()
    }

    pub fn rest_pool(&self) -> &Arc<EndpointPool> {
        &self.rest_pool
    }

    pub fn snapshot_fetcher<S: SnapshotTransport>(&self, transport: S) -> SnapshotFetcher<S> {
        SnapshotFetcher::new(
            transport,
            Arc::clone(&self.rest_pool),
            self.config.snapshot_ttl,
            SnapshotOptions {
                settlement_currency: self.config.settlement_currency.clone(),
                min_quote_volume: self.config.min_quote_volume,
                request_timeout: self.config.snapshot_timeout,
            },
        )
    }

    pub fn stream_connection<T: StreamTransport>(&self, transport: T) -> StreamConnection<T> {
        StreamConnection::new(
            transport,
            Arc::clone(&self.stream_pool),
            StreamSettings {
                connect_timeout: self.config.connect_timeout,
                keepalive_interval: self.config.keepalive_interval,
                backoff: self.backoff(),
                max_attempts: self.config.max_reconnect_attempts,
            },
        )
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.config.reconnect_base,
            max: self.config.reconnect_max,
        }
    }

    /// Load boundary: seeds the store, republishes and drops every lock.
    pub fn load(&self, records: Vec<AssetRecord>) -> usize {
        let seeded = self.store.seed(records);
        self.scheduler.republish_all();
        self.locks.lock().reset();
        seeded
    }

    pub fn assets(&self) -> Vec<AssetRow> {
        let snapshot = self.view().snapshot();
        rows(snapshot.records.clone(), &snapshot)
    }

    pub fn rankings(&self, category: RankingCategory, limit: usize, locked: bool) -> Vec<AssetRow> {
        let snapshot = self.view().snapshot();
        let ranked = rank(category, &snapshot.records, limit);
        let ordered = if locked {
            self.locks.lock().resolve(category, limit, ranked, &snapshot.records)
        } else {
            ranked
        };
        rows(ordered, &snapshot)
    }

    pub fn search(&self, query: &str) -> Vec<AssetRow> {
        let snapshot = self.view().snapshot();
        rows(search(&snapshot.records, query), &snapshot)
    }

    pub fn overview(&self) -> MarketOverview {
        let snapshot = self.view().snapshot();
        MarketOverview {
            stats: MarketStats::compute(&snapshot.records),
            top_gainers: rows(top_gainers(&snapshot.records, OVERVIEW_TOP_COUNT), &snapshot),
            top_losers: rows(top_losers(&snapshot.records, OVERVIEW_TOP_COUNT), &snapshot),
        }
    }

    fn ingest(&self, outcome: TickApplyOutcome) {
        self.counters.record(outcome);
    }
}

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<MarketConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

struct StatusReporter<'a> {
    status_store: &'a Arc<RwLock<MarketFeedStatusSnapshot>>,
    feed: &'a MarketFeed,
    throttle: Mutex<StatusPublishThrottle>,
    endpoint: Mutex<Option<String>>,
    attempt: Mutex<u32>,
}

impl<'a> StatusReporter<'a> {
    fn new(status_store: &'a Arc<RwLock<MarketFeedStatusSnapshot>>, feed: &'a MarketFeed) -> Self {
        Self {
            status_store,
            feed,
            throttle: Mutex::new(StatusPublishThrottle::default()),
            endpoint: Mutex::new(None),
            attempt: Mutex::new(0),
        }
    }

    async fn publish(&self, state: MarketConnectionState, reason: Option<String>) {
        let view = self.feed.view();
        let snapshot = MarketFeedStatusSnapshot {
            state,
            endpoint: self.endpoint.lock().clone(),
            reconnect_attempt: *self.attempt.lock(),
            asset_count: view.len(),
            publish_version: view.version(),
            reason,
        };

        match snapshot.state {
            MarketConnectionState::Error | MarketConnectionState::Failed => warn!(
                state = ?snapshot.state,
                endpoint = ?snapshot.endpoint,
                reason = ?snapshot.reason,
                "market feed status"
            ),
            _ => info!(
                state = ?snapshot.state,
                endpoint = ?snapshot.endpoint,
                attempt = snapshot.reconnect_attempt,
                assets = snapshot.asset_count,
                "market feed status"
            ),
        }

        let mut writable = self.status_store.write().await;
        *writable = snapshot;
    }

    async fn publish_throttled(&self, state: MarketConnectionState, reason: Option<String>) {
        if !allow_status_publish(&self.throttle, state, &reason) {
            return;
        }
        self.publish(state, reason).await;
    }

    async fn on_stream_state(&self, change: StreamStateChange) {
        *self.endpoint.lock() = change.endpoint.clone();
        *self.attempt.lock() = change.attempt;
        let state = match change.phase {
            ConnectionPhase::Failed => {
                self.publish(MarketConnectionState::Failed, change.reason).await;
                return;
            }
            ConnectionPhase::Connecting if change.attempt > 0 => {
                MarketConnectionState::Reconnecting
            }
            phase => MarketConnectionState::from(phase),
        };
        self.publish_throttled(state, None).await;
    }

    async fn refresh_counts(&self) {
        let view = self.feed.view();
        let mut writable = self.status_store.write().await;
        writable.asset_count = view.len();
        writable.publish_version = view.version();
    }
}

fn allow_status_publish(
    throttle: &Mutex<StatusPublishThrottle>,
    state: MarketConnectionState,
    reason: &Option<String>,
) -> bool {
    let mut writable = throttle.lock();
    let now = Instant::now();
    let should_throttle = matches!(
        state,
        MarketConnectionState::Error | MarketConnectionState::Reconnecting
    );

    if should_throttle
        && writable.last_state == Some(state)
        && writable.last_reason == *reason
        && writable
            .last_emit
            .map(|instant| {
                now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
            })
            .unwrap_or(false)
    {
        return false;
    }

    writable.last_state = Some(state);
    writable.last_reason = reason.clone();
    writable.last_emit = Some(now);
    true
}

/// Drives one session: snapshot load (retried with backoff), seeding, the
/// flush worker and the live stream, until `cancel` fires.
pub async fn run_market_feed<S, T>(
    feed: Arc<MarketFeed>,
    fetcher: SnapshotFetcher<S>,
    connection: StreamConnection<T>,
    status_store: Arc<RwLock<MarketFeedStatusSnapshot>>,
    cancel: CancellationToken,
) where
    S: SnapshotTransport,
    T: StreamTransport,
{
    let reporter = StatusReporter::new(&status_store, &feed);
    reporter
        .publish(
            MarketConnectionState::Loading,
            Some("loading ticker snapshot".to_string()),
        )
        .await;

    let backoff = feed.backoff();
    let mut attempt = 0_u32;
    let records = loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                reporter.publish(MarketConnectionState::Stopped, None).await;
                return;
            }
            outcome = fetcher.fetch_all() => outcome,
        };

        if !outcome.exhausted {
            if outcome.partial {
                warn!(
                    assets = outcome.records.len(),
                    "ticker snapshot below coverage threshold, continuing with partial set"
                );
            }
            break outcome.records;
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        reporter
            .publish_throttled(
                MarketConnectionState::Error,
                Some(AppError::EndpointsExhausted(fetcher.pool().len()).to_string()),
            )
            .await;
        warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying ticker snapshot");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                reporter.publish(MarketConnectionState::Stopped, None).await;
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    };

    let seeded = feed.load(records);
    info!(assets = seeded, "market store seeded");
    reporter.publish(MarketConnectionState::Connecting, None).await;

    let flush_cancel = cancel.child_token();
    let flush_worker = feed
        .scheduler()
        .spawn_flush_worker(feed.config().frame_interval, flush_cancel.clone());

    let ingest_feed = Arc::clone(&feed);
    let messages = connection.on_message(move |batch| {
        for tick in batch.iter() {
            let outcome = ingest_feed.store().apply_tick(tick);
            if outcome == TickApplyOutcome::UnknownSymbol {
                debug!(pair = %tick.pair, "tick for unseeded symbol ignored");
            }
            ingest_feed.ingest(outcome);
        }
    });

    let (state_tx, mut state_rx) = unbounded_channel::<StreamStateChange>();
    let states = connection.on_state(move |change| {
        let _ = state_tx.send(change);
    });

    connection.connect(feed.config().topics.clone());

    let mut heartbeat = tokio::time::interval(Duration::from_millis(STATUS_HEARTBEAT_MS));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_summary = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(change) = state_rx.recv() => reporter.on_stream_state(change).await,
            _ = heartbeat.tick() => {
                reporter.refresh_counts().await;
                if last_summary.elapsed() >= Duration::from_millis(SUMMARY_INTERVAL_MS) {
                    last_summary = Instant::now();
                    let (applied, unknown, foreign) = feed.counters.snapshot();
                    info!(
                        assets = feed.view().len(),
                        version = feed.view().version(),
                        applied,
                        unknown,
                        foreign,
                        "market feed summary"
                    );
                }
            }
        }
    }

    connection.shutdown().await;
    messages.unsubscribe();
    states.unsubscribe();
    flush_cancel.cancel();
    if let Err(error) = flush_worker.await {
        warn!(%error, "publish flush worker ended abnormally");
    }
    reporter.publish(MarketConnectionState::Stopped, None).await;
}

pub struct MarketFeedHandle {
    pub feed: Arc<MarketFeed>,
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

/// Starts a session against the real exchange transports.
pub fn spawn_market_feed(
    config: MarketFeedConfig,
    http_client: Client,
    status_store: Arc<RwLock<MarketFeedStatusSnapshot>>,
) -> MarketFeedHandle {
    let snapshot_timeout = config.snapshot_timeout;
    let feed = Arc::new(MarketFeed::new(config));
    let fetcher = feed.snapshot_fetcher(HttpSnapshotTransport::new(http_client, snapshot_timeout));
    let connection = feed.stream_connection(WsTransport);
    let cancellation_token = CancellationToken::new();

    let join_handle = tokio::spawn(run_market_feed(
        Arc::clone(&feed),
        fetcher,
        connection,
        status_store,
        cancellation_token.clone(),
    ));

    MarketFeedHandle {
        feed,
        cancellation_token,
        join_handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::config::StartMarketFeedArgs;
    use crate::market::testing::{tick, FakeSnapshotTransport, FakeStreamTransport, OpenScript};
    use crate::market::types::PriceDirection;

    const REST: &str = "https://rest0.test";

    fn config() -> MarketFeedConfig {
        StartMarketFeedArgs {
            rest_endpoints: Some(vec![REST.to_string()]),
            stream_endpoints: Some(vec!["wss://s0.test".to_string()]),
            ..Default::default()
        }
        .normalize()
        .expect("test config should be valid")
    }

    fn status_store() -> Arc<RwLock<MarketFeedStatusSnapshot>> {
        Arc::new(RwLock::new(MarketFeedStatusSnapshot::stopped(None)))
    }

    fn start(
        snapshot: FakeSnapshotTransport,
        stream: FakeStreamTransport,
        status: Arc<RwLock<MarketFeedStatusSnapshot>>,
    ) -> (Arc<MarketFeed>, CancellationToken, JoinHandle<()>) {
        let feed = Arc::new(MarketFeed::new(config()));
        let fetcher = feed.snapshot_fetcher(snapshot);
        let connection = feed.stream_connection(stream);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_market_feed(
            Arc::clone(&feed),
            fetcher,
            connection,
            status,
            cancel.clone(),
        ));
        (feed, cancel, handle)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn seeds_streams_and_publishes_ticks() {
        let snapshot = FakeSnapshotTransport::default();
        snapshot.respond(
            REST,
            Ok(vec![tick("BTCUSDT", 100.0, 5_000_000.0), tick("ETHUSDT", 2_000.0, 9_000_000.0)]),
        );
        let stream = FakeStreamTransport::default();
        stream.script(OpenScript::Accept);
        let status = status_store();

        let (feed, cancel, handle) = start(snapshot, stream.clone(), Arc::clone(&status));
        settle().await;

        assert_eq!(status.read().await.state, MarketConnectionState::Live);
        assert_eq!(feed.view().len(), 2);

        stream.push_text(
            0,
            r#"{"e":"24hrTicker","s":"BTCUSDT","c":"105","p":"5","P":"5.0","v":"10","h":"106","l":"99"}"#,
        );
        settle().await;

        let btc = feed.view().record("BTC").expect("BTC published");
        assert_eq!(btc.price, 105.0);
        assert_eq!(feed.view().direction("BTC").direction, PriceDirection::Up);
        let gainers = feed.rankings(RankingCategory::Gainers, 1, false);
        assert_eq!(gainers[0].record.symbol, "BTC");
        assert_eq!(gainers[0].percent_display, "+5.00%");

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(status.read().await.state, MarketConnectionState::Stopped);
        assert_eq!(stream.live_sockets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_snapshot_until_an_endpoint_answers() {
        let snapshot = FakeSnapshotTransport::default();
        snapshot.respond(REST, Err("unavailable".to_string()));
        let stream = FakeStreamTransport::default();
        stream.script(OpenScript::Accept);
        let status = status_store();

        let (feed, cancel, handle) = start(snapshot.clone(), stream.clone(), Arc::clone(&status));
        settle().await;

        assert_eq!(status.read().await.state, MarketConnectionState::Error);
        assert!(feed.view().is_empty());
        assert!(stream.open_uris().is_empty());

        snapshot.respond(REST, Ok(vec![tick("SOLUSDT", 20.0, 1_000_000.0)]));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(feed.view().len(), 1);
        assert_eq!(status.read().await.state, MarketConnectionState::Live);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_terminal_stream_failure() {
        let snapshot = FakeSnapshotTransport::default();
        snapshot.respond(REST, Ok(vec![tick("BTCUSDT", 100.0, 5_000_000.0)]));
        let stream = FakeStreamTransport::default();
        let status = status_store();

        let (feed, cancel, handle) = start(snapshot, stream.clone(), Arc::clone(&status));
        tokio::time::sleep(Duration::from_secs(120)).await;

        let current = status.read().await.clone();
        assert_eq!(current.state, MarketConnectionState::Failed);
        let reason = current.reason.expect("failure reason recorded");
        assert!(reason.contains("gave up after 5 reconnect attempts"));
        assert_eq!(stream.open_uris().len(), 6);
        assert_eq!(feed.view().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn locked_rankings_hold_order_until_next_load() {
        let feed = MarketFeed::new(config());
        feed.load(vec![
            crate::market::testing::record("BTC", 100.0, 1.0, 10.0),
            crate::market::testing::record("ETH", 10.0, 2.0, 10.0),
        ]);

        let first = feed.rankings(RankingCategory::Gainers, 2, true);
        assert_eq!(first[0].record.symbol, "ETH");

        feed.store().apply_tick(&crate::market::types::TickerTick {
            change_percent: 9.0,
            ..tick("BTCUSDT", 101.0, 1_000.0)
        });
        feed.scheduler().flush();

        let locked = feed.rankings(RankingCategory::Gainers, 2, true);
        let unlocked = feed.rankings(RankingCategory::Gainers, 2, false);
        assert_eq!(locked[0].record.symbol, "ETH");
        assert_eq!(unlocked[0].record.symbol, "BTC");

        feed.load(feed.store().records());
        let relocked = feed.rankings(RankingCategory::Gainers, 2, true);
        assert_eq!(relocked[0].record.symbol, "BTC");
    }

    #[test]
    fn throttles_repeated_error_status() {
        let throttle = Mutex::new(StatusPublishThrottle::default());
        let reason = Some("down".to_string());

        assert!(allow_status_publish(&throttle, MarketConnectionState::Error, &reason));
        assert!(!allow_status_publish(&throttle, MarketConnectionState::Error, &reason));
        assert!(allow_status_publish(&throttle, MarketConnectionState::Live, &None));
        assert!(allow_status_publish(&throttle, MarketConnectionState::Live, &None));
    }
}
