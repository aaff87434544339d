use crate::error::AppError;
use crate::market::config::MarketFeedConfig;
use crate::market::ranking::RelockPolicy;
use crate::market::{MINI_TICKER_EVENT, TICKER_EVENT};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::warn;

/// Consumer-facing state of the whole feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MarketConnectionState {
    Loading,
    Connecting,
    Live,
    Reconnecting,
    Failed,
    Stopped,
    Error,
}

/// Lifecycle of one physical streaming connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl From<ConnectionPhase> for MarketConnectionState {
    fn from(value: ConnectionPhase) -> Self {
        match value {
            ConnectionPhase::Idle => Self::Stopped,
            ConnectionPhase::Connecting => Self::Connecting,
            ConnectionPhase::Open => Self::Live,
            ConnectionPhase::Closed => Self::Reconnecting,
            ConnectionPhase::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFeedStatusSnapshot {
    pub state: MarketConnectionState,
    pub endpoint: Option<String>,
    pub reconnect_attempt: u32,
    pub asset_count: usize,
    pub publish_version: u64,
    pub reason: Option<String>,
}

impl MarketFeedStatusSnapshot {
    pub fn stopped(reason: Option<String>) -> Self {
        Self {
            state: MarketConnectionState::Stopped,
            endpoint: None,
            reconnect_attempt: 0,
            asset_count: 0,
            publish_version: 0,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFeedSession {
    pub running: bool,
    pub settlement_currency: String,
    pub frame_interval_ms: u64,
    pub topics: Vec<String>,
    pub rest_endpoints: Vec<String>,
    pub stream_endpoints: Vec<String>,
    pub relock_policy: RelockPolicy,
}

impl MarketFeedSession {
    pub fn from_config(config: &MarketFeedConfig) -> Self {
        Self {
            running: true,
            settlement_currency: config.settlement_currency.clone(),
            frame_interval_ms: config.frame_interval.as_millis() as u64,
            topics: config.topics.clone(),
            rest_endpoints: config
                .rest_endpoints
                .iter()
                .map(|endpoint| endpoint.url.clone())
                .collect(),
            stream_endpoints: config
                .stream_endpoints
                .iter()
                .map(|endpoint| endpoint.url.clone())
                .collect(),
            relock_policy: config.relock_policy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFeedStopResult {
    pub stopped: bool,
}

/// One asset as held by the store. `symbol` never changes once created;
/// every other field is replaced as a whole by each tick.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub change_24h: f64,
    pub change_24h_percent: f64,
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub updated_at_ms: i64,
    #[serde(skip)]
    pub last_update: Instant,
}

impl AssetRecord {
    pub fn from_tick(symbol: &str, tick: &TickerTick) -> Self {
        Self {
            symbol: symbol.to_string(),
            name: display_name(symbol).to_string(),
            price: tick.price,
            change_24h: tick.change,
            change_24h_percent: tick.change_percent,
            volume_24h: tick.notional_volume(),
            high_24h: tick.high,
            low_24h: tick.low,
            updated_at_ms: now_unix_ms(),
            last_update: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriceDirection {
    Up,
    Down,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DirectionState {
    pub direction: PriceDirection,
    pub intensity: f64,
    pub changed_at_ms: i64,
    /// Transition sequence number; a pending decay only fires if this is
    /// still the value it captured.
    #[serde(skip)]
    pub stamp: u64,
}

impl DirectionState {
    pub fn from_prices(old_price: f64, new_price: f64, stamp: u64) -> Option<Self> {
        if new_price == old_price {
            return None;
        }

        let direction = if new_price > old_price {
            PriceDirection::Up
        } else {
            PriceDirection::Down
        };
        let intensity = if old_price > 0.0 {
            (((new_price - old_price) / old_price).abs() * 100.0).min(1.0)
        } else {
            1.0
        };

        Some(Self {
            direction,
            intensity,
            changed_at_ms: now_unix_ms(),
            stamp,
        })
    }
}

/// A 24h ticker update, from either the stream or the REST snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerTick {
    pub pair: String,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub base_volume: f64,
    pub high: f64,
    pub low: f64,
    pub quote_volume: Option<f64>,
    pub event_time: Option<i64>,
}

impl TickerTick {
    pub fn notional_volume(&self) -> f64 {
        self.base_volume * self.price
    }

    pub fn quote_volume(&self) -> f64 {
        self.quote_volume.unwrap_or_else(|| self.notional_volume())
    }
}

fn parse_finite(field: &str, raw: &str) -> Result<f64, AppError> {
    let value = raw.trim().parse::<f64>()?;
    if !value.is_finite() {
        return Err(AppError::InvalidArgument(format!(
            "ticker field '{field}' must be finite"
        )));
    }
    Ok(value)
}

fn parse_optional(field: &str, raw: Option<&str>) -> Result<f64, AppError> {
    match raw {
        Some(value) => parse_finite(field, value),
        None => Ok(0.0),
    }
}

/// Strips the settlement suffix (`BTCUSDT` -> `BTC`). Pairs quoted in any
/// other currency yield `None`.
pub fn derive_symbol<'a>(pair: &'a str, settlement_currency: &str) -> Option<&'a str> {
    let base = pair.strip_suffix(settlement_currency)?;
    if base.is_empty() {
        None
    } else {
        Some(base)
    }
}

pub fn display_name(symbol: &str) -> &str {
    match symbol {
        "BTC" => "Bitcoin",
        "ETH" => "Ethereum",
        "BNB" => "BNB",
        "SOL" => "Solana",
        "XRP" => "XRP",
        "ADA" => "Cardano",
        "AVAX" => "Avalanche",
        "DOGE" => "Dogecoin",
        "DOT" => "Polkadot",
        "MATIC" => "Polygon",
        "SHIB" => "Shiba Inu",
        "LTC" => "Litecoin",
        "LINK" => "Chainlink",
        "ATOM" => "Cosmos",
        "UNI" => "Uniswap",
        "XLM" => "Stellar",
        "NEAR" => "NEAR Protocol",
        "ALGO" => "Algorand",
        "FIL" => "Filecoin",
        "APT" => "Aptos",
        "ARB" => "Arbitrum",
        "OP" => "Optimism",
        other => other,
    }
}

#[derive(Debug, Deserialize)]
pub struct TickerStreamWire {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: Option<i64>,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub last_price: String,
    #[serde(rename = "o")]
    pub open_price: Option<String>,
    #[serde(rename = "p")]
    pub price_change: Option<String>,
    #[serde(rename = "P")]
    pub price_change_percent: Option<String>,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "q")]
    pub quote_volume: Option<String>,
    #[serde(rename = "h")]
    pub high_price: String,
    #[serde(rename = "l")]
    pub low_price: String,
}

impl TickerStreamWire {
    /// `Ok(None)` for event types other than 24h tickers.
    pub fn into_tick(self) -> Result<Option<TickerTick>, AppError> {
        if self.event_type != TICKER_EVENT && self.event_type != MINI_TICKER_EVENT {
            return Ok(None);
        }

        let price = parse_finite("c", &self.last_price)?;
        let (change, change_percent) = match (&self.price_change, &self.price_change_percent) {
            (Some(change), Some(percent)) => {
                (parse_finite("p", change)?, parse_finite("P", percent)?)
            }
            _ => {
                // Mini tickers only carry the open price.
                let open = parse_optional("o", self.open_price.as_deref())?;
                let change = price - open;
                let percent = if open != 0.0 { change / open * 100.0 } else { 0.0 };
                (change, percent)
            }
        };
        let quote_volume = self
            .quote_volume
            .as_deref()
            .map(|raw| parse_finite("q", raw))
            .transpose()?;

        Ok(Some(TickerTick {
            pair: self.symbol.trim().to_ascii_uppercase(),
            price,
            change,
            change_percent,
            base_volume: parse_finite("v", &self.volume)?,
            high: parse_finite("h", &self.high_price)?,
            low: parse_finite("l", &self.low_price)?,
            quote_volume,
            event_time: self.event_time,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamItemWire {
    Ticker(TickerStreamWire),
    Unrecognized(serde::de::IgnoredAny),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamBodyWire {
    Batch(Vec<StreamItemWire>),
    Single(StreamItemWire),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamFrameWire {
    Combined { data: StreamBodyWire },
    Body(StreamBodyWire),
}

/// Decodes one inbound frame: a ticker object, an array of them, or a
/// combined-stream envelope. Items that are not tickers are skipped;
/// tickers with unparseable values are logged and dropped individually.
pub fn parse_stream_frame(payload: &mut [u8]) -> Result<Vec<TickerTick>, AppError> {
    let frame: StreamFrameWire = simd_json::serde::from_slice(payload)?;
    let body = match frame {
        StreamFrameWire::Combined { data } => data,
        StreamFrameWire::Body(body) => body,
    };
    let items = match body {
        StreamBodyWire::Batch(items) => items,
        StreamBodyWire::Single(item) => vec![item],
    };

    let mut ticks = Vec::with_capacity(items.len());
    for item in items {
        let StreamItemWire::Ticker(wire) = item else {
            continue;
        };
        let pair = wire.symbol.clone();
        match wire.into_tick() {
            Ok(Some(tick)) => ticks.push(tick),
            Ok(None) => {}
            Err(error) => warn!(pair = %pair, %error, "dropping malformed ticker"),
        }
    }
    Ok(ticks)
}

#[derive(Debug, Deserialize)]
pub struct TickerSnapshotWire {
    pub symbol: String,
    #[serde(rename = "lastPrice", alias = "c")]
    pub last_price: Option<String>,
    #[serde(rename = "priceChange", alias = "p")]
    pub price_change: Option<String>,
    #[serde(rename = "priceChangePercent", alias = "P")]
    pub price_change_percent: Option<String>,
    #[serde(rename = "volume", alias = "v")]
    pub volume: Option<String>,
    #[serde(rename = "highPrice", alias = "h")]
    pub high_price: Option<String>,
    #[serde(rename = "lowPrice", alias = "l")]
    pub low_price: Option<String>,
    #[serde(rename = "quoteVolume", alias = "q")]
    pub quote_volume: Option<String>,
}

impl TryFrom<TickerSnapshotWire> for TickerTick {
    type Error = AppError;

    fn try_from(value: TickerSnapshotWire) -> Result<Self, Self::Error> {
        let quote_volume = value
            .quote_volume
            .as_deref()
            .map(|raw| parse_finite("quoteVolume", raw))
            .transpose()?;

        Ok(Self {
            pair: value.symbol.trim().to_ascii_uppercase(),
            price: parse_optional("lastPrice", value.last_price.as_deref())?,
            change: parse_optional("priceChange", value.price_change.as_deref())?,
            change_percent: parse_optional(
                "priceChangePercent",
                value.price_change_percent.as_deref(),
            )?,
            base_volume: parse_optional("volume", value.volume.as_deref())?,
            high: parse_optional("highPrice", value.high_price.as_deref())?,
            low: parse_optional("lowPrice", value.low_price.as_deref())?,
            quote_volume,
            event_time: None,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SnapshotItemWire {
    Ticker(TickerSnapshotWire),
    Unrecognized(serde::de::IgnoredAny),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MarketTimeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[default]
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl MarketTimeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    pub fn parse_str(raw: &str) -> Result<Self, AppError> {
        match raw.trim() {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            "1w" => Ok(Self::W1),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported timeframe '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct KlineWire(
    pub i64,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub i64,
    pub String,
    pub u64,
    pub String,
    pub String,
    pub String,
);

impl TryFrom<KlineWire> for Candle {
    type Error = AppError;

    fn try_from(value: KlineWire) -> Result<Self, Self::Error> {
        Ok(Self {
            t: value.0,
            o: parse_finite("open", &value.1)?,
            h: parse_finite("high", &value.2)?,
            l: parse_finite("low", &value.3)?,
            c: parse_finite("close", &value.4)?,
            v: parse_finite("volume", &value.5)?.max(0.0),
        })
    }
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
