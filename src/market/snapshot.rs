use crate::market::binance::SnapshotTransport;
use crate::market::endpoints::EndpointPool;
use crate::market::types::{derive_symbol, AssetRecord, TickerTick};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

pub const TICKERS_CACHE_KEY: &str = "tickers";

struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
}

/// Keyed cache whose entries are served only while younger than the TTL.
pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, key: &str, value: V) {
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Merged ticks plus whether they were accepted below every coverage bar.
#[derive(Debug, Clone)]
struct CachedSnapshot {
    ticks: Arc<Vec<TickerTick>>,
    partial: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    pub settlement_currency: String,
    pub min_quote_volume: f64,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotOutcome {
    pub records: Vec<AssetRecord>,
    /// Coverage stayed below every endpoint's bar.
    pub partial: bool,
    /// No endpoint returned anything usable.
    pub exhausted: bool,
    pub from_cache: bool,
}

/// Loads the full ticker set over REST, failing over between endpoints and
/// merging partial answers until one endpoint's coverage bar is met.
pub struct SnapshotFetcher<T> {
    transport: T,
    pool: Arc<EndpointPool>,
    cache: TtlCache<CachedSnapshot>,
    options: SnapshotOptions,
}

impl<T: SnapshotTransport> SnapshotFetcher<T> {
    pub fn new(
        transport: T,
        pool: Arc<EndpointPool>,
        ttl: Duration,
        options: SnapshotOptions,
    ) -> Self {
        Self {
            transport,
            pool,
            cache: TtlCache::new(ttl),
            options,
        }
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate(TICKERS_CACHE_KEY);
    }

    pub async fn fetch_all(&self) -> SnapshotOutcome {
        if let Some(cached) = self.cache.get(TICKERS_CACHE_KEY) {
            debug!(
                pairs = cached.ticks.len(),
                partial = cached.partial,
                "serving ticker snapshot from cache"
            );
            return SnapshotOutcome {
                records: self.to_records(&cached.ticks),
                partial: cached.partial,
                exhausted: false,
                from_cache: true,
            };
        }

        let mut merged: Vec<TickerTick> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut satisfied = false;

        for (index, endpoint) in self.pool.next(self.pool.preferred_index()) {
            let result = timeout(
                self.options.request_timeout,
                self.transport.fetch_tickers(&endpoint.url),
            )
            .await;
            let ticks = match result {
                Ok(Ok(ticks)) => ticks,
                Ok(Err(error)) => {
                    warn!(endpoint = %endpoint.url, %error, "ticker snapshot request failed");
                    continue;
                }
                Err(_) => {
                    warn!(
                        endpoint = %endpoint.url,
                        timeout_ms = self.options.request_timeout.as_millis() as u64,
                        "ticker snapshot request timed out"
                    );
                    continue;
                }
            };

            let mut accepted = 0_usize;
            for tick in ticks {
                if !self.accepts(&tick) {
                    continue;
                }
                accepted += 1;
                match positions.get(&tick.pair) {
                    Some(&position) => merged[position] = tick,
                    None => {
                        positions.insert(tick.pair.clone(), merged.len());
                        merged.push(tick);
                    }
                }
            }

            if accepted == 0 {
                debug!(endpoint = %endpoint.url, "endpoint returned no usable pairs");
                continue;
            }

            self.pool.remember(index);
            info!(
                endpoint = %endpoint.url,
                accepted,
                total = merged.len(),
                "ticker snapshot loaded"
            );

            if merged.len() >= endpoint.min_coverage {
                satisfied = true;
                break;
            }
        }

        if merged.is_empty() {
            warn!(endpoints = self.pool.len(), "ticker snapshot endpoints exhausted");
            return SnapshotOutcome {
                records: Vec::new(),
                partial: false,
                exhausted: true,
                from_cache: false,
            };
        }

        let cached = CachedSnapshot {
            ticks: Arc::new(merged),
            partial: !satisfied,
        };
        self.cache.insert(TICKERS_CACHE_KEY, cached.clone());
        SnapshotOutcome {
            records: self.to_records(&cached.ticks),
            partial: cached.partial,
            exhausted: false,
            from_cache: false,
        }
    }

    fn accepts(&self, tick: &TickerTick) -> bool {
        derive_symbol(&tick.pair, &self.options.settlement_currency).is_some()
            && tick.quote_volume() > self.options.min_quote_volume
    }

    fn to_records(&self, ticks: &[TickerTick]) -> Vec<AssetRecord> {
        ticks
            .iter()
            .filter_map(|tick| {
                derive_symbol(&tick.pair, &self.options.settlement_currency)
                    .map(|symbol| AssetRecord::from_tick(symbol, tick))
            })
            .collect()
    }
}
