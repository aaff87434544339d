use crate::market::store::IngestionStore;
use crate::market::types::{AssetRecord, DirectionState};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Default)]
struct DirtyState {
    keys: HashSet<String>,
    scheduled: bool,
}

/// Dirty symbol set with at most one pending flush request.
#[derive(Default)]
pub struct DirtyTracker {
    state: Mutex<DirtyState>,
    notify: Notify,
}

impl DirtyTracker {
    /// Returns `true` when this call scheduled a new flush.
    pub fn mark_dirty(&self, symbol: &str) -> bool {
        let mut state = self.state.lock();
        if !state.keys.contains(symbol) {
            state.keys.insert(symbol.to_string());
        }
        if state.scheduled {
            return false;
        }
        state.scheduled = true;
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Drains the dirty set and clears the scheduled flag together.
    pub fn take(&self) -> HashSet<String> {
        let mut state = self.state.lock();
        state.scheduled = false;
        std::mem::take(&mut state.keys)
    }

    pub fn is_scheduled(&self) -> bool {
        self.state.lock().scheduled
    }

    pub fn pending(&self) -> usize {
        self.state.lock().keys.len()
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[derive(Debug, Default)]
struct PublishedView {
    records: Vec<AssetRecord>,
    index: HashMap<String, usize>,
    directions: HashMap<String, DirectionState>,
    version: u64,
}

impl PublishedView {
    fn upsert(&mut self, record: AssetRecord, direction: DirectionState) {
        self.directions.insert(record.symbol.clone(), direction);
        match self.index.get(&record.symbol) {
            Some(&position) => self.records[position] = record,
            None => {
                self.index.insert(record.symbol.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub version: u64,
    pub symbols: usize,
}

/// Consistent copy of the published state at one version.
#[derive(Debug, Clone, Default)]
pub struct ViewSnapshot {
    pub records: Vec<AssetRecord>,
    pub directions: HashMap<String, DirectionState>,
    pub version: u64,
}

impl ViewSnapshot {
    pub fn direction(&self, symbol: &str) -> DirectionState {
        self.directions.get(symbol).copied().unwrap_or_default()
    }
}

/// Read side of the published state.
#[derive(Clone)]
pub struct MarketView {
    inner: Arc<RwLock<PublishedView>>,
}

impl MarketView {
    pub fn snapshot(&self) -> ViewSnapshot {
        let view = self.inner.read();
        ViewSnapshot {
            records: view.records.clone(),
            directions: view.directions.clone(),
            version: view.version,
        }
    }

    pub fn records(&self) -> Vec<AssetRecord> {
        self.inner.read().records.clone()
    }

    pub fn record(&self, symbol: &str) -> Option<AssetRecord> {
        let view = self.inner.read();
        view.index
            .get(symbol)
            .map(|&position| view.records[position].clone())
    }

    pub fn direction(&self, symbol: &str) -> DirectionState {
        self.inner
            .read()
            .directions
            .get(symbol)
            .copied()
            .unwrap_or_default()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_recently_updated(&self, symbol: &str, window: Duration) -> bool {
        self.record(symbol)
            .is_some_and(|record| record.last_update.elapsed() <= window)
    }

    pub fn stale_count(&self, max_age: Duration) -> usize {
        self.inner
            .read()
            .records
            .iter()
            .filter(|record| record.last_update.elapsed() > max_age)
            .count()
    }
}

/// Moves dirty records from the store into the published view, at most
/// once per frame.
#[derive(Clone)]
pub struct PublishScheduler {
    store: IngestionStore,
    tracker: Arc<DirtyTracker>,
    view: Arc<RwLock<PublishedView>>,
    version_tx: Arc<watch::Sender<u64>>,
}

impl PublishScheduler {
    pub fn new(store: IngestionStore) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            tracker: store.tracker(),
            store,
            view: Arc::new(RwLock::new(PublishedView::default())),
            version_tx: Arc::new(version_tx),
        }
    }

    pub fn mark_dirty(&self, symbol: &str) -> bool {
        self.tracker.mark_dirty(symbol)
    }

    pub fn view(&self) -> MarketView {
        MarketView {
            inner: Arc::clone(&self.view),
        }
    }

    /// Watch channel carrying the latest published version.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub fn flush(&self) -> FlushReport {
        let dirty = self.tracker.take();
        if dirty.is_empty() {
            return FlushReport {
                version: self.view.read().version,
                symbols: 0,
            };
        }

        let entries = self.store.collect(&dirty);
        let symbols = entries.len();
        let version = {
            let mut view = self.view.write();
            for (record, direction) in entries {
                view.upsert(record, direction);
            }
            view.version += 1;
            view.version
        };
        self.version_tx.send_replace(version);
        trace!(version, symbols, "published frame");
        FlushReport { version, symbols }
    }

    /// Replaces the whole published view with the store contents.
    pub fn republish_all(&self) -> FlushReport {
        self.tracker.take();
        let (records, directions) = self.store.snapshot();
        let symbols = records.len();
        let version = {
            let mut view = self.view.write();
            view.index = records
                .iter()
                .enumerate()
                .map(|(position, record)| (record.symbol.clone(), position))
                .collect();
            view.records = records;
            view.directions = directions;
            view.version += 1;
            view.version
        };
        self.version_tx.send_replace(version);
        debug!(version, symbols, "republished full view");
        FlushReport { version, symbols }
    }

    /// Waits for dirty symbols, then flushes on the next frame boundary.
    pub fn spawn_flush_worker(
        &self,
        frame_interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut frame = interval(frame_interval);
            frame.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = scheduler.tracker.notified() => {}
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = frame.tick() => {}
                }
                scheduler.flush();
            }
            debug!("publish flush worker stopped");
        })
    }
}
