use crate::market::publish::DirtyTracker;
use crate::market::types::{
    derive_symbol, now_unix_ms, AssetRecord, DirectionState, PriceDirection, TickerTick,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickApplyOutcome {
    /// `transition` is set when the price moved.
    Applied { transition: Option<PriceDirection> },
    UnknownSymbol,
    ForeignPair,
}

#[derive(Default)]
struct StoreState {
    records: Vec<AssetRecord>,
    index: HashMap<String, usize>,
    directions: HashMap<String, DirectionState>,
}

impl StoreState {
    fn direction(&self, symbol: &str) -> DirectionState {
        self.directions.get(symbol).copied().unwrap_or_default()
    }
}

struct StoreInner {
    settlement_currency: String,
    decay_window: Duration,
    sequence: AtomicU64,
    state: Mutex<StoreState>,
    tracker: Arc<DirtyTracker>,
}

impl StoreInner {
    fn expire_direction(&self, symbol: &str, stamp: u64) {
        let mut state = self.state.lock();
        let Some(current) = state.directions.get_mut(symbol) else {
            return;
        };
        if current.stamp != stamp {
            trace!(symbol, "direction decay superseded");
            return;
        }
        *current = DirectionState {
            direction: PriceDirection::None,
            intensity: 0.0,
            changed_at_ms: now_unix_ms(),
            stamp,
        };
        drop(state);
        self.tracker.mark_dirty(symbol);
    }
}

/// Authoritative live record set. Ticks are applied synchronously; the
/// published view only catches up on flush.
#[derive(Clone)]
pub struct IngestionStore {
    inner: Arc<StoreInner>,
}

impl IngestionStore {
    pub fn new(settlement_currency: impl Into<String>, decay_window: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                settlement_currency: settlement_currency.into(),
                decay_window,
                sequence: AtomicU64::new(0),
                state: Mutex::new(StoreState::default()),
                tracker: Arc::new(DirtyTracker::default()),
            }),
        }
    }

    pub fn tracker(&self) -> Arc<DirtyTracker> {
        Arc::clone(&self.inner.tracker)
    }

    pub fn settlement_currency(&self) -> &str {
        &self.inner.settlement_currency
    }

    /// Replaces every record and resets all directions to none.
    pub fn seed(&self, records: Vec<AssetRecord>) -> usize {
        let mut state = self.inner.state.lock();
        state.records.clear();
        state.index.clear();
        state.directions.clear();

        for record in records {
            match state.index.get(&record.symbol) {
                Some(&position) => state.records[position] = record,
                None => {
                    let position = state.records.len();
                    state.index.insert(record.symbol.clone(), position);
                    state.records.push(record);
                }
            }
        }
        state.records.len()
    }

    pub fn apply_tick(&self, tick: &TickerTick) -> TickApplyOutcome {
        let Some(symbol) = derive_symbol(&tick.pair, &self.inner.settlement_currency) else {
            return TickApplyOutcome::ForeignPair;
        };

        let mut state = self.inner.state.lock();
        let Some(&position) = state.index.get(symbol) else {
            return TickApplyOutcome::UnknownSymbol;
        };

        let old_price = state.records[position].price;
        state.records[position] = AssetRecord::from_tick(symbol, tick);

        let stamp = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let transition = DirectionState::from_prices(old_price, tick.price, stamp);
        if let Some(direction) = transition {
            state.directions.insert(symbol.to_string(), direction);
        }
        drop(state);

        if let Some(direction) = transition {
            self.schedule_decay(symbol.to_string(), direction.stamp);
        }
        self.inner.tracker.mark_dirty(symbol);

        TickApplyOutcome::Applied {
            transition: transition.map(|direction| direction.direction),
        }
    }

    fn schedule_decay(&self, symbol: String, stamp: u64) {
        let Ok(handle) = Handle::try_current() else {
            debug!(symbol = %symbol, "no runtime available, direction decay skipped");
            return;
        };

        let store: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let window = self.inner.decay_window;
        handle.spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(store) = store.upgrade() {
                store.expire_direction(&symbol, stamp);
            }
        });
    }

    pub fn record(&self, symbol: &str) -> Option<AssetRecord> {
        let state = self.inner.state.lock();
        state
            .index
            .get(symbol)
            .map(|&position| state.records[position].clone())
    }

    pub fn direction(&self, symbol: &str) -> DirectionState {
        self.inner.state.lock().direction(symbol)
    }

    pub fn records(&self) -> Vec<AssetRecord> {
        self.inner.state.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current values for `symbols`, in store order.
    pub fn collect(&self, symbols: &HashSet<String>) -> Vec<(AssetRecord, DirectionState)> {
        let state = self.inner.state.lock();
        let mut positions: Vec<usize> = symbols
            .iter()
            .filter_map(|symbol| state.index.get(symbol).copied())
            .collect();
        positions.sort_unstable();
        positions
            .into_iter()
            .map(|position| {
                let record = state.records[position].clone();
                let direction = state.direction(&record.symbol);
                (record, direction)
            })
            .collect()
    }

    pub fn snapshot(&self) -> (Vec<AssetRecord>, HashMap<String, DirectionState>) {
        let state = self.inner.state.lock();
        (state.records.clone(), state.directions.clone())
    }

    pub fn is_recently_updated(&self, symbol: &str, window: Duration) -> bool {
        self.record(symbol)
            .is_some_and(|record| record.last_update.elapsed() <= window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::testing::record;
    use crate::market::types::parse_stream_frame;

    const DECAY: Duration = Duration::from_secs(3);

    fn seeded() -> IngestionStore {
        let store = IngestionStore::new("USDT", DECAY);
        store.seed(vec![record("BTC", 100.0, 0.0, 1_000.0), record("ETH", 2_000.0, 0.0, 500.0)]);
        store
    }

    fn ticker(raw: &str) -> TickerTick {
        let mut payload = raw.as_bytes().to_vec();
        parse_stream_frame(&mut payload)
            .expect("ticker should parse")
            .remove(0)
    }

    fn btc(price: f64) -> TickerTick {
        TickerTick {
            pair: "BTCUSDT".to_string(),
            price,
            change: price - 100.0,
            change_percent: price - 100.0,
            base_volume: 10.0,
            high: price + 1.0,
            low: price - 1.0,
            quote_volume: None,
            event_time: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn applies_example_tick_and_decays_direction() {
        let store = seeded();
        let tick = ticker(
            r#"{"e":"24hrTicker","s":"BTCUSDT","c":"105","p":"5","P":"5.0","v":"10","h":"106","l":"99"}"#,
        );

        let outcome = store.apply_tick(&tick);

        assert_eq!(
            outcome,
            TickApplyOutcome::Applied {
                transition: Some(PriceDirection::Up)
            }
        );
        let record = store.record("BTC").unwrap();
        assert_eq!(record.price, 105.0);
        assert_eq!(record.high_24h, 106.0);
        assert_eq!(record.low_24h, 99.0);
        assert_eq!(record.volume_24h, 1_050.0);
        let direction = store.direction("BTC");
        assert_eq!(direction.direction, PriceDirection::Up);
        assert_eq!(direction.intensity, 1.0);

        tokio::time::sleep(DECAY + Duration::from_millis(1)).await;

        assert_eq!(store.direction("BTC").direction, PriceDirection::None);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_transition_survives_earlier_decay() {
        let store = seeded();

        store.apply_tick(&btc(101.0));
        tokio::time::sleep(Duration::from_secs(2)).await;
        store.apply_tick(&btc(99.0));
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(store.direction("BTC").direction, PriceDirection::Down);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.direction("BTC").direction, PriceDirection::None);
    }

    #[tokio::test(start_paused = true)]
    async fn every_tick_replaces_all_fields_verbatim() {
        let store = seeded();
        let ticks = [
            btc(101.0),
            TickerTick {
                change: -3.0,
                change_percent: -2.5,
                base_volume: 0.5,
                high: 250.0,
                low: 1.0,
                ..btc(97.0)
            },
            btc(97.0),
        ];

        for tick in &ticks {
            store.apply_tick(tick);
            let record = store.record("BTC").unwrap();
            assert_eq!(record.symbol, "BTC");
            assert_eq!(record.price, tick.price);
            assert_eq!(record.change_24h, tick.change);
            assert_eq!(record.change_24h_percent, tick.change_percent);
            assert_eq!(record.volume_24h, tick.base_volume * tick.price);
            assert_eq!(record.high_24h, tick.high);
            assert_eq!(record.low_24h, tick.low);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_price_keeps_direction_but_marks_dirty() {
        let store = seeded();
        let tracker = store.tracker();

        store.apply_tick(&btc(101.0));
        tracker.take();
        let outcome = store.apply_tick(&btc(101.0));

        assert_eq!(outcome, TickApplyOutcome::Applied { transition: None });
        assert_eq!(store.direction("BTC").direction, PriceDirection::Up);
        assert!(tracker.take().contains("BTC"));
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_unknown_and_foreign_pairs() {
        let store = seeded();
        let tracker = store.tracker();

        assert_eq!(
            store.apply_tick(&TickerTick {
                pair: "DOGEUSDT".to_string(),
                ..btc(1.0)
            }),
            TickApplyOutcome::UnknownSymbol
        );
        assert_eq!(
            store.apply_tick(&TickerTick {
                pair: "ETHBTC".to_string(),
                ..btc(1.0)
            }),
            TickApplyOutcome::ForeignPair
        );
        assert_eq!(store.len(), 2);
        assert!(tracker.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn seed_resets_directions_and_cancels_pending_decay_effects() {
        let store = seeded();
        store.apply_tick(&btc(110.0));

        store.seed(vec![record("BTC", 110.0, 0.0, 1.0)]);

        assert_eq!(store.direction("BTC").direction, PriceDirection::None);
        assert!(store.record("ETH").is_none());
        tokio::time::sleep(DECAY * 2).await;
        assert_eq!(store.direction("BTC").direction, PriceDirection::None);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_old_price_gives_full_intensity() {
        let store = IngestionStore::new("USDT", DECAY);
        store.seed(vec![record("NEW", 0.0, 0.0, 0.0)]);

        store.apply_tick(&TickerTick {
            pair: "NEWUSDT".to_string(),
            ..btc(0.5)
        });

        assert_eq!(store.direction("NEW").intensity, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_recent_updates() {
        let store = seeded();
        store.apply_tick(&btc(102.0));

        assert!(store.is_recently_updated("BTC", Duration::from_secs(3)));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!store.is_recently_updated("BTC", Duration::from_secs(3)));
        assert!(!store.is_recently_updated("XRP", Duration::from_secs(3)));
    }

    #[test]
    fn applies_without_runtime_and_skips_decay() {
        let store = seeded();
        let outcome = store.apply_tick(&btc(90.0));

        assert_eq!(
            outcome,
            TickApplyOutcome::Applied {
                transition: Some(PriceDirection::Down)
            }
        );
        assert_eq!(store.direction("BTC").direction, PriceDirection::Down);
    }
}
