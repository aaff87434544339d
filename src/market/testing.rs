//! Scripted transports and record builders shared by the unit tests.

use crate::error::AppError;
use crate::market::binance::{InboundFrame, SnapshotTransport, StreamTransport, TransportSocket};
use crate::market::types::{display_name, now_unix_ms, AssetRecord, TickerTick};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

pub fn tick(pair: &str, price: f64, quote_volume: f64) -> TickerTick {
    TickerTick {
        pair: pair.to_string(),
        price,
        change: 0.0,
        change_percent: 0.0,
        base_volume: if price > 0.0 { quote_volume / price } else { 0.0 },
        high: price,
        low: price,
        quote_volume: Some(quote_volume),
        event_time: None,
    }
}

pub fn record(symbol: &str, price: f64, change_percent: f64, volume: f64) -> AssetRecord {
    AssetRecord {
        symbol: symbol.to_string(),
        name: display_name(symbol).to_string(),
        price,
        change_24h: price * change_percent / 100.0,
        change_24h_percent: change_percent,
        volume_24h: volume,
        high_24h: price,
        low_24h: price,
        updated_at_ms: now_unix_ms(),
        last_update: Instant::now(),
    }
}

type ScriptedResponse = (Duration, Result<Vec<TickerTick>, String>);

#[derive(Default)]
struct FakeSnapshotState {
    responses: HashMap<String, ScriptedResponse>,
    requests: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeSnapshotTransport {
    inner: Arc<Mutex<FakeSnapshotState>>,
}

impl FakeSnapshotTransport {
    pub fn respond(&self, base_url: &str, result: Result<Vec<TickerTick>, String>) {
        self.respond_after(base_url, Duration::ZERO, result);
    }

    pub fn respond_after(
        &self,
        base_url: &str,
        delay: Duration,
        result: Result<Vec<TickerTick>, String>,
    ) {
        self.inner
            .lock()
            .responses
            .insert(base_url.to_string(), (delay, result));
    }

    pub fn requests(&self) -> Vec<String> {
        self.inner.lock().requests.clone()
    }
}

impl SnapshotTransport for FakeSnapshotTransport {
    async fn fetch_tickers(&self, base_url: &str) -> Result<Vec<TickerTick>, AppError> {
        let scripted = {
            let mut state = self.inner.lock();
            state.requests.push(base_url.to_string());
            state.responses.get(base_url).cloned()
        };

        let Some((delay, result)) = scripted else {
            return Err(AppError::Transport(format!("no route to {base_url}")));
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result.map_err(AppError::Transport)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenScript {
    Refuse,
    Hang,
    Accept,
}

#[derive(Default)]
struct FakeStreamState {
    scripts: VecDeque<OpenScript>,
    opens: Vec<(String, Instant)>,
    sent: Vec<String>,
    servers: Vec<Option<UnboundedSender<InboundFrame>>>,
    live: usize,
    closed: usize,
}

/// Opens follow the queued scripts in order and are refused once the queue
/// is empty. Accepted sockets are addressed by acceptance order.
#[derive(Clone, Default)]
pub struct FakeStreamTransport {
    inner: Arc<Mutex<FakeStreamState>>,
}

impl FakeStreamTransport {
    pub fn script(&self, script: OpenScript) {
        self.inner.lock().scripts.push_back(script);
    }

    pub fn open_uris(&self) -> Vec<String> {
        self.inner.lock().opens.iter().map(|(uri, _)| uri.clone()).collect()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.inner.lock().opens.iter().map(|(_, at)| *at).collect()
    }

    pub fn sent(&self) -> Vec<String> {
        self.inner.lock().sent.clone()
    }

    pub fn live_sockets(&self) -> usize {
        self.inner.lock().live
    }

    pub fn closed_sockets(&self) -> usize {
        self.inner.lock().closed
    }

    pub fn push_text(&self, socket: usize, text: &str) {
        let state = self.inner.lock();
        if let Some(Some(server)) = state.servers.get(socket) {
            let _ = server.send(InboundFrame::Payload(text.as_bytes().to_vec()));
        }
    }

    pub fn close_socket(&self, socket: usize, reason: Option<&str>) {
        let mut state = self.inner.lock();
        if let Some(slot) = state.servers.get_mut(socket) {
            if let Some(server) = slot.take() {
                let _ = server.send(InboundFrame::Close(reason.map(str::to_string)));
            }
        }
    }
}

impl StreamTransport for FakeStreamTransport {
    type Socket = FakeSocket;

    async fn open(&self, uri: &str) -> Result<FakeSocket, AppError> {
        let script = {
            let mut state = self.inner.lock();
            state.opens.push((uri.to_string(), Instant::now()));
            state.scripts.pop_front().unwrap_or(OpenScript::Refuse)
        };

        match script {
            OpenScript::Refuse => Err(AppError::Transport("connection refused".to_string())),
            OpenScript::Hang => std::future::pending::<Result<FakeSocket, AppError>>().await,
            OpenScript::Accept => {
                let (sender, receiver) = unbounded_channel();
                let mut state = self.inner.lock();
                state.servers.push(Some(sender));
                state.live += 1;
                Ok(FakeSocket {
                    receiver,
                    state: Arc::clone(&self.inner),
                })
            }
        }
    }
}

pub struct FakeSocket {
    receiver: UnboundedReceiver<InboundFrame>,
    state: Arc<Mutex<FakeStreamState>>,
}

impl TransportSocket for FakeSocket {
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, AppError>> {
        self.receiver.recv().await.map(Ok)
    }

    async fn send_text(&mut self, text: String) -> Result<(), AppError> {
        self.state.lock().sent.push(text);
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().closed += 1;
    }
}

impl Drop for FakeSocket {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
    }
}
