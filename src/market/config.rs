use crate::error::AppError;
use crate::market::endpoints::{Endpoint, EndpointPool};
use crate::market::ranking::RelockPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SETTLEMENT_CURRENCY: &str = "USDT";
pub const DEFAULT_MIN_QUOTE_VOLUME: f64 = 100_000.0;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;
pub const DEFAULT_SNAPSHOT_TTL_MS: u64 = 60_000;
pub const DEFAULT_SNAPSHOT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_DIRECTION_DECAY_MS: u64 = 3_000;
pub const DEFAULT_STREAM_TOPIC: &str = "!ticker@arr";
pub const DEFAULT_RELOCK_POLICY: RelockPolicy = RelockPolicy::Manual;

pub const MIN_FRAME_INTERVAL_MS: u64 = 8;
pub const MAX_FRAME_INTERVAL_MS: u64 = 1_000;
pub const MIN_TIMEOUT_MS: u64 = 100;
pub const MAX_TIMEOUT_MS: u64 = 120_000;
pub const MIN_KEEPALIVE_INTERVAL_MS: u64 = 1_000;
pub const MAX_KEEPALIVE_INTERVAL_MS: u64 = 300_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 50;
pub const MIN_DIRECTION_DECAY_MS: u64 = 100;
pub const MAX_DIRECTION_DECAY_MS: u64 = 60_000;

/// Primary REST endpoint plus mirrors. The second element is the number of
/// accepted pairs after which no further endpoint is queried.
pub const DEFAULT_REST_ENDPOINTS: [(&str, usize); 4] = [
    ("https://api.binance.com/api/v3", 150),
    ("https://api.binance.us/api/v3", 40),
    ("https://api1.binance.com/api/v3", 150),
    ("https://api2.binance.com/api/v3", 150),
];

pub const DEFAULT_STREAM_ENDPOINTS: [&str; 3] = [
    "wss://stream.binance.com:9443",
    "wss://stream.binance.us:9443",
    "wss://data-stream.binance.vision",
];

const ENV_PREFIX: &str = "MARKET_PULSE_";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartMarketFeedArgs {
    pub settlement_currency: Option<String>,
    pub min_quote_volume: Option<f64>,
    pub frame_interval_ms: Option<u64>,
    pub snapshot_ttl_ms: Option<u64>,
    pub snapshot_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub keepalive_interval_ms: Option<u64>,
    pub reconnect_base_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub direction_decay_ms: Option<u64>,
    pub topics: Option<Vec<String>>,
    pub rest_endpoints: Option<Vec<String>>,
    pub stream_endpoints: Option<Vec<String>>,
    pub relock_policy: Option<RelockPolicy>,
}

#[derive(Debug, Clone)]
pub struct MarketFeedConfig {
    pub settlement_currency: String,
    pub min_quote_volume: f64,
    pub frame_interval: Duration,
    pub snapshot_ttl: Duration,
    pub snapshot_timeout: Duration,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: u32,
    pub direction_decay: Duration,
    pub topics: Vec<String>,
    pub rest_endpoints: Vec<Endpoint>,
    pub stream_endpoints: Vec<Endpoint>,
    pub relock_policy: RelockPolicy,
}

impl MarketFeedConfig {
    pub fn rest_pool(&self) -> EndpointPool {
        EndpointPool::new(self.rest_endpoints.clone())
    }

    pub fn stream_pool(&self) -> EndpointPool {
        EndpointPool::new(self.stream_endpoints.clone())
    }
}

fn bounded_ms(name: &str, value: u64, min: u64, max: u64) -> Result<Duration, AppError> {
    if !(min..=max).contains(&value) {
        return Err(AppError::InvalidArgument(format!(
            "{name} must be between {min} and {max}"
        )));
    }
    Ok(Duration::from_millis(value))
}

fn normalize_urls(name: &str, urls: Vec<String>) -> Result<Vec<String>, AppError> {
    let cleaned: Vec<String> = urls
        .into_iter()
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
        .collect();

    if cleaned.is_empty() {
        return Err(AppError::InvalidArgument(format!(
            "{name} must contain at least one endpoint"
        )));
    }
    Ok(cleaned)
}

impl StartMarketFeedArgs {
    pub fn normalize(self) -> Result<MarketFeedConfig, AppError> {
        let settlement_currency = self
            .settlement_currency
            .unwrap_or_else(|| DEFAULT_SETTLEMENT_CURRENCY.to_string())
            .trim()
            .to_ascii_uppercase();
        if settlement_currency.is_empty()
            || !settlement_currency
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric())
        {
            return Err(AppError::InvalidArgument(
                "settlementCurrency must be non-empty alphanumeric ASCII".to_string(),
            ));
        }

        let min_quote_volume = self.min_quote_volume.unwrap_or(DEFAULT_MIN_QUOTE_VOLUME);
        if !min_quote_volume.is_finite() || min_quote_volume < 0.0 {
            return Err(AppError::InvalidArgument(
                "minQuoteVolume must be a finite non-negative number".to_string(),
            ));
        }

        let frame_interval = bounded_ms(
            "frameIntervalMs",
            self.frame_interval_ms.unwrap_or(DEFAULT_FRAME_INTERVAL_MS),
            MIN_FRAME_INTERVAL_MS,
            MAX_FRAME_INTERVAL_MS,
        )?;
        let snapshot_ttl = bounded_ms(
            "snapshotTtlMs",
            self.snapshot_ttl_ms.unwrap_or(DEFAULT_SNAPSHOT_TTL_MS),
            0,
            3_600_000,
        )?;
        let snapshot_timeout = bounded_ms(
            "snapshotTimeoutMs",
            self.snapshot_timeout_ms.unwrap_or(DEFAULT_SNAPSHOT_TIMEOUT_MS),
            MIN_TIMEOUT_MS,
            MAX_TIMEOUT_MS,
        )?;
        let connect_timeout = bounded_ms(
            "connectTimeoutMs",
            self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            MIN_TIMEOUT_MS,
            MAX_TIMEOUT_MS,
        )?;
        let keepalive_interval = bounded_ms(
            "keepaliveIntervalMs",
            self.keepalive_interval_ms
                .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL_MS),
            MIN_KEEPALIVE_INTERVAL_MS,
            MAX_KEEPALIVE_INTERVAL_MS,
        )?;
        let reconnect_base = bounded_ms(
            "reconnectBaseMs",
            self.reconnect_base_ms.unwrap_or(DEFAULT_RECONNECT_BASE_MS),
            1,
            MAX_TIMEOUT_MS,
        )?;
        let reconnect_max = bounded_ms(
            "reconnectMaxMs",
            self.reconnect_max_ms.unwrap_or(DEFAULT_RECONNECT_MAX_MS),
            1,
            MAX_TIMEOUT_MS,
        )?;
        if reconnect_max < reconnect_base {
            return Err(AppError::InvalidArgument(
                "reconnectMaxMs must not be smaller than reconnectBaseMs".to_string(),
            ));
        }

        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if max_reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
            return Err(AppError::InvalidArgument(format!(
                "maxReconnectAttempts must be at most {MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let direction_decay = bounded_ms(
            "directionDecayMs",
            self.direction_decay_ms.unwrap_or(DEFAULT_DIRECTION_DECAY_MS),
            MIN_DIRECTION_DECAY_MS,
            MAX_DIRECTION_DECAY_MS,
        )?;

        let topics: Vec<String> = self
            .topics
            .unwrap_or_else(|| vec![DEFAULT_STREAM_TOPIC.to_string()])
            .into_iter()
            .map(|topic| topic.trim().to_string())
            .filter(|topic| !topic.is_empty())
            .collect();
        if topics.is_empty() {
            return Err(AppError::InvalidArgument(
                "topics must contain at least one stream name".to_string(),
            ));
        }

        let rest_endpoints = match self.rest_endpoints {
            Some(urls) => normalize_urls("restEndpoints", urls)?
                .into_iter()
                .map(|url| {
                    let min_coverage = DEFAULT_REST_ENDPOINTS
                        .iter()
                        .find(|(known, _)| *known == url)
                        .map(|(_, coverage)| *coverage)
                        .unwrap_or(DEFAULT_REST_ENDPOINTS[0].1);
                    Endpoint::new(url, min_coverage)
                })
                .collect(),
            None => DEFAULT_REST_ENDPOINTS
                .iter()
                .map(|(url, coverage)| Endpoint::new(*url, *coverage))
                .collect(),
        };

        let stream_endpoints = match self.stream_endpoints {
            Some(urls) => normalize_urls("streamEndpoints", urls)?
                .into_iter()
                .map(|url| Endpoint::new(url, 0))
                .collect(),
            None => DEFAULT_STREAM_ENDPOINTS
                .iter()
                .map(|url| Endpoint::new(*url, 0))
                .collect(),
        };

        Ok(MarketFeedConfig {
            settlement_currency,
            min_quote_volume,
            frame_interval,
            snapshot_ttl,
            snapshot_timeout,
            connect_timeout,
            keepalive_interval,
            reconnect_base,
            reconnect_max,
            max_reconnect_attempts,
            direction_decay,
            topics,
            rest_endpoints,
            stream_endpoints,
            relock_policy: self.relock_policy.unwrap_or(DEFAULT_RELOCK_POLICY),
        })
    }

    /// Reads `MARKET_PULSE_*` overrides from the process environment.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |suffix: &str| {
            lookup(&format!("{ENV_PREFIX}{suffix}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let read_list = |suffix: &str| {
            read(suffix).map(|value| {
                value
                    .split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect::<Vec<_>>()
            })
        };
        let read_u64 = |suffix: &str| -> Result<Option<u64>, AppError> {
            read(suffix)
                .map(|value| {
                    value.parse::<u64>().map_err(|_| {
                        AppError::InvalidArgument(format!(
                            "{ENV_PREFIX}{suffix} must be an unsigned integer"
                        ))
                    })
                })
                .transpose()
        };

        let min_quote_volume = read("MIN_QUOTE_VOLUME")
            .map(|value| value.parse::<f64>())
            .transpose()?;
        let max_reconnect_attempts = read_u64("MAX_RECONNECT_ATTEMPTS")?
            .map(|value| u32::try_from(value).unwrap_or(u32::MAX));

        Ok(Self {
            settlement_currency: read("SETTLEMENT_CURRENCY"),
            min_quote_volume,
            frame_interval_ms: read_u64("FRAME_INTERVAL_MS")?,
            snapshot_ttl_ms: read_u64("SNAPSHOT_TTL_MS")?,
            snapshot_timeout_ms: read_u64("SNAPSHOT_TIMEOUT_MS")?,
            connect_timeout_ms: read_u64("CONNECT_TIMEOUT_MS")?,
            keepalive_interval_ms: read_u64("KEEPALIVE_INTERVAL_MS")?,
            reconnect_base_ms: read_u64("RECONNECT_BASE_MS")?,
            reconnect_max_ms: read_u64("RECONNECT_MAX_MS")?,
            max_reconnect_attempts,
            direction_decay_ms: read_u64("DIRECTION_DECAY_MS")?,
            topics: read_list("TOPICS"),
            rest_endpoints: read_list("REST_ENDPOINTS"),
            stream_endpoints: read_list("STREAM_ENDPOINTS"),
            relock_policy: read("RELOCK_POLICY")
                .map(|value| RelockPolicy::parse_str(&value))
                .transpose()?,
        })
    }
}
