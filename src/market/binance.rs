use crate::error::AppError;
use crate::market::endpoints::EndpointPool;
use crate::market::types::{Candle, KlineWire, MarketTimeframe, SnapshotItemWire, TickerTick};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

pub const MAX_KLINES_PER_REQUEST: u16 = 1_000;

pub type BinanceWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn ticker_24hr_endpoint(base_url: &str) -> String {
    format!("{base_url}/ticker/24hr")
}

/// One topic uses the raw `/ws/<topic>` path; several are multiplexed via
/// the combined `/stream?streams=a/b` endpoint.
pub fn stream_uri(base_url: &str, topics: &[String]) -> String {
    match topics {
        [single] => format!("{base_url}/ws/{single}"),
        many => format!("{base_url}/stream?streams={}", many.join("/")),
    }
}

fn klines_endpoint(base_url: &str, pair: &str, timeframe: MarketTimeframe, limit: u16) -> String {
    format!("{base_url}/klines")
        + &format!(
            "?symbol={}&interval={}&limit={limit}",
            pair.to_ascii_uppercase(),
            timeframe.as_str()
        )
}

/// Source of full 24h ticker snapshots.
pub trait SnapshotTransport: Send + Sync + 'static {
    fn fetch_tickers(
        &self,
        base_url: &str,
    ) -> impl Future<Output = Result<Vec<TickerTick>, AppError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpSnapshotTransport {
    client: Client,
    timeout: Duration,
}

impl HttpSnapshotTransport {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

impl SnapshotTransport for HttpSnapshotTransport {
    async fn fetch_tickers(&self, base_url: &str) -> Result<Vec<TickerTick>, AppError> {
        let endpoint = ticker_24hr_endpoint(base_url);
        let response = self
            .client
            .get(&endpoint)
            .timeout(self.timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpStatus {
                endpoint,
                status: status.as_u16(),
            });
        }

        let payload = response.json::<Vec<SnapshotItemWire>>().await?;
        let mut ticks = Vec::with_capacity(payload.len());
        for item in payload {
            let SnapshotItemWire::Ticker(wire) = item else {
                continue;
            };
            let pair = wire.symbol.clone();
            match TickerTick::try_from(wire) {
                Ok(tick) => ticks.push(tick),
                Err(error) => debug!(pair = %pair, %error, "skipping snapshot entry"),
            }
        }
        Ok(ticks)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Payload(Vec<u8>),
    Close(Option<String>),
    Control,
}

/// An open bidirectional streaming socket.
pub trait TransportSocket: Send + 'static {
    /// `None` once the peer is gone.
    fn next_frame(&mut self) -> impl Future<Output = Option<Result<InboundFrame, AppError>>> + Send;

    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), AppError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

pub trait StreamTransport: Send + Sync + 'static {
    type Socket: TransportSocket;

    fn open(&self, uri: &str) -> impl Future<Output = Result<Self::Socket, AppError>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl StreamTransport for WsTransport {
    type Socket = WsSocket;

    async fn open(&self, uri: &str) -> Result<WsSocket, AppError> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(64 << 20),
            max_frame_size: Some(16 << 20),
            ..Default::default()
        };

        let (stream, _) = connect_async_with_config(uri, Some(ws_config), true).await?;
        Ok(WsSocket { inner: stream })
    }
}

pub struct WsSocket {
    inner: BinanceWsStream,
}

impl TransportSocket for WsSocket {
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, AppError>> {
        let message = match self.inner.next().await? {
            Ok(message) => message,
            Err(error) => return Some(Err(error.into())),
        };

        Some(Ok(match message {
            Message::Text(text) => InboundFrame::Payload(text.into_bytes()),
            Message::Binary(bytes) => InboundFrame::Payload(bytes),
            Message::Close(frame) => {
                InboundFrame::Close(frame.map(|frame| frame.reason.into_owned()))
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => InboundFrame::Control,
        }))
    }

    async fn send_text(&mut self, text: String) -> Result<(), AppError> {
        self.inner.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(error) = self.inner.close(None).await {
            debug!(%error, "websocket close handshake failed");
        }
    }
}

/// Candle history for one pair, tried against each REST endpoint in turn.
/// Each request is bounded by `request_timeout` so a hung endpoint falls
/// through to the next one.
pub async fn fetch_klines(
    client: &Client,
    pool: &EndpointPool,
    pair: &str,
    timeframe: MarketTimeframe,
    limit: u16,
    request_timeout: Duration,
) -> Result<Vec<Candle>, AppError> {
    if limit == 0 || limit > MAX_KLINES_PER_REQUEST {
        return Err(AppError::InvalidArgument(format!(
            "limit must be between 1 and {MAX_KLINES_PER_REQUEST}"
        )));
    }

    for (index, endpoint) in pool.next(pool.preferred_index()) {
        let request = klines_endpoint(&endpoint.url, pair, timeframe, limit);
        match fetch_klines_from(client, &request, request_timeout).await {
            Ok(candles) => {
                pool.remember(index);
                return Ok(candles);
            }
            Err(error) => warn!(endpoint = %endpoint.url, %error, "klines request failed"),
        }
    }

    Err(AppError::EndpointsExhausted(pool.len()))
}

async fn fetch_klines_from(
    client: &Client,
    request: &str,
    request_timeout: Duration,
) -> Result<Vec<Candle>, AppError> {
    let response = client
        .get(request)
        .timeout(request_timeout)
        .send()
        .await?
        .error_for_status()?;
    let mut payload = response.json::<Vec<KlineWire>>().await?;

    payload.sort_unstable_by_key(|kline| kline.0);
    payload.dedup_by_key(|kline| kline.0);

    let mut candles = Vec::with_capacity(payload.len());
    for kline in payload {
        candles.push(kline.try_into()?);
    }
    Ok(candles)
}
