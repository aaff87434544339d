use crate::error::AppError;
use crate::market::binance::{stream_uri, InboundFrame, StreamTransport, TransportSocket};
use crate::market::endpoints::EndpointPool;
use crate::market::observers::{ObserverHandle, ObserverSet};
use crate::market::types::{parse_stream_frame, ConnectionPhase, TickerTick};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const KEEPALIVE_PING: &str = r#"{"method":"ping"}"#;

/// A session that closes sooner than this after opening counts as a flap;
/// the fallback that follows waits this long instead of retrying at once.
pub const MIN_FALLBACK_DELAY: Duration = Duration::from_millis(250);

pub type TickBatch = Arc<Vec<TickerTick>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStateChange {
    pub phase: ConnectionPhase,
    pub endpoint: Option<String>,
    pub attempt: u32,
    /// Set on `Failed`, the same text the error observers receive.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// `min(base * 2^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Retry right away against another endpoint.
    Fallback { index: usize },
    Backoff {
        delay: Duration,
        index: usize,
        attempt: u32,
    },
    GiveUp,
}

/// Decides what follows a closed or failed connection attempt.
#[derive(Debug, Clone)]
pub struct ReconnectPlanner {
    endpoint_count: usize,
    max_attempts: u32,
    backoff: BackoffPolicy,
    attempts: u32,
    tried: usize,
}

impl ReconnectPlanner {
    pub fn new(endpoint_count: usize, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            endpoint_count,
            max_attempts,
            backoff,
            attempts: 0,
            tried: 1,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_open(&mut self) {
        self.attempts = 0;
        self.tried = 1;
    }

    pub fn on_close(&mut self, current_index: usize) -> ReconnectAction {
        if self.attempts == 0 && self.tried < self.endpoint_count {
            self.tried += 1;
            return ReconnectAction::Fallback {
                index: (current_index + 1) % self.endpoint_count,
            };
        }

        if self.attempts >= self.max_attempts {
            return ReconnectAction::GiveUp;
        }

        let delay = self.backoff.delay(self.attempts);
        // A fresh backoff cycle starts over from the primary endpoint.
        let index = if self.attempts == 0 { 0 } else { current_index };
        self.attempts += 1;
        ReconnectAction::Backoff {
            delay,
            index,
            attempt: self.attempts,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
}

#[derive(Default)]
struct StreamObservers {
    message: Arc<ObserverSet<TickBatch>>,
    connect: Arc<ObserverSet<String>>,
    disconnect: Arc<ObserverSet<Option<String>>>,
    state: Arc<ObserverSet<StreamStateChange>>,
    error: Arc<ObserverSet<Arc<AppError>>>,
}

impl StreamObservers {
    fn clear(&self) {
        self.message.clear();
        self.connect.clear();
        self.disconnect.clear();
        self.state.clear();
        self.error.clear();
    }
}

struct ConnectionControl {
    phase: ConnectionPhase,
    endpoint: Option<String>,
    generation: u64,
    cancel: Option<CancellationToken>,
    supervisor: Option<JoinHandle<()>>,
    retiring: Vec<JoinHandle<()>>,
}

struct ConnectionInner<T> {
    transport: T,
    pool: Arc<EndpointPool>,
    settings: StreamSettings,
    observers: StreamObservers,
    control: Mutex<ConnectionControl>,
}

impl<T> ConnectionInner<T> {
    /// Applies a phase change unless a newer connect/disconnect superseded
    /// this supervisor.
    fn transition(
        &self,
        generation: u64,
        phase: ConnectionPhase,
        endpoint: Option<&str>,
        attempt: u32,
    ) -> bool {
        self.transition_with_reason(generation, phase, endpoint, attempt, None)
    }

    fn transition_with_reason(
        &self,
        generation: u64,
        phase: ConnectionPhase,
        endpoint: Option<&str>,
        attempt: u32,
        reason: Option<String>,
    ) -> bool {
        let mut control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        control.phase = phase;
        control.endpoint = endpoint.map(str::to_string);
        self.observers.state.emit(StreamStateChange {
            phase,
            endpoint: control.endpoint.clone(),
            attempt,
            reason,
        });
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.control.lock().generation == generation
    }
}

enum SessionEnd {
    Cancelled,
    Closed(Option<String>),
}

/// One logical streaming connection with endpoint fallback, backoff and
/// keepalive. At most one supervisor task (and so one socket) is live.
pub struct StreamConnection<T> {
    inner: Arc<ConnectionInner<T>>,
}

impl<T> Clone for StreamConnection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: StreamTransport> StreamConnection<T> {
    pub fn new(transport: T, pool: Arc<EndpointPool>, settings: StreamSettings) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                pool,
                settings,
                observers: StreamObservers::default(),
                control: Mutex::new(ConnectionControl {
                    phase: ConnectionPhase::Idle,
                    endpoint: None,
                    generation: 0,
                    cancel: None,
                    supervisor: None,
                    retiring: Vec::new(),
                }),
            }),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.control.lock().phase
    }

    pub fn endpoint(&self) -> Option<String> {
        self.inner.control.lock().endpoint.clone()
    }

    /// No-op while already connecting or open. From any other phase this
    /// starts a fresh supervisor with reset counters.
    pub fn connect(&self, topics: Vec<String>) {
        let mut control = self.inner.control.lock();
        if matches!(
            control.phase,
            ConnectionPhase::Connecting | ConnectionPhase::Open
        ) {
            debug!(phase = ?control.phase, "connect ignored, stream already active");
            return;
        }

        if let Some(token) = control.cancel.take() {
            token.cancel();
        }
        if let Some(stale) = control.supervisor.take() {
            stale.abort();
        }
        for retiring in control.retiring.drain(..) {
            retiring.abort();
        }

        control.generation += 1;
        let generation = control.generation;
        let start_index = self.inner.pool.preferred_index();
        control.phase = ConnectionPhase::Connecting;
        control.endpoint = self.inner.pool.get(start_index).map(|endpoint| endpoint.url.clone());

        let cancel = CancellationToken::new();
        control.cancel = Some(cancel.clone());
        control.supervisor = Some(tokio::spawn(supervise(
            Arc::clone(&self.inner),
            topics,
            generation,
            cancel,
            start_index,
        )));
    }

    /// Safe from any phase and idempotent. Observers are dropped; the next
    /// `connect` starts clean.
    pub fn disconnect(&self) {
        let mut control = self.inner.control.lock();
        control.generation += 1;
        if let Some(token) = control.cancel.take() {
            token.cancel();
        }
        if let Some(supervisor) = control.supervisor.take() {
            control.retiring.push(supervisor);
        }
        let previous = control.phase;
        control.phase = ConnectionPhase::Idle;
        control.endpoint = None;
        drop(control);

        self.inner.observers.clear();
        if previous != ConnectionPhase::Idle {
            info!(previous = ?previous, "market stream disconnected");
        }
    }

    /// `disconnect` plus waiting for the socket to be closed.
    pub async fn shutdown(&self) {
        self.disconnect();
        let retiring: Vec<JoinHandle<()>> = self.inner.control.lock().retiring.drain(..).collect();
        for mut handle in retiring {
            if timeout(self.inner.settings.connect_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!("stream supervisor did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    pub fn on_message<F>(&self, handler: F) -> ObserverHandle<TickBatch>
    where
        F: FnMut(TickBatch) + Send + 'static,
    {
        self.inner.observers.message.subscribe(handler)
    }

    pub fn on_connect<F>(&self, handler: F) -> ObserverHandle<String>
    where
        F: FnMut(String) + Send + 'static,
    {
        self.inner.observers.connect.subscribe(handler)
    }

    pub fn on_disconnect<F>(&self, handler: F) -> ObserverHandle<Option<String>>
    where
        F: FnMut(Option<String>) + Send + 'static,
    {
        self.inner.observers.disconnect.subscribe(handler)
    }

    pub fn on_state<F>(&self, handler: F) -> ObserverHandle<StreamStateChange>
    where
        F: FnMut(StreamStateChange) + Send + 'static,
    {
        self.inner.observers.state.subscribe(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> ObserverHandle<Arc<AppError>>
    where
        F: FnMut(Arc<AppError>) + Send + 'static,
    {
        self.inner.observers.error.subscribe(handler)
    }
}

async fn supervise<T: StreamTransport>(
    inner: Arc<ConnectionInner<T>>,
    topics: Vec<String>,
    generation: u64,
    cancel: CancellationToken,
    mut index: usize,
) {
    let settings = inner.settings;
    let mut planner =
        ReconnectPlanner::new(inner.pool.len(), settings.max_attempts, settings.backoff);
    let mut last_reason: Option<String> = None;

    loop {
        let Some(endpoint) = inner.pool.get(index).cloned() else {
            warn!("no stream endpoints configured");
            fail(&inner, generation, "no stream endpoints configured".to_string());
            return;
        };
        if !inner.transition(
            generation,
            ConnectionPhase::Connecting,
            Some(&endpoint.url),
            planner.attempts(),
        ) {
            return;
        }

        let uri = stream_uri(&endpoint.url, &topics);
        info!(endpoint = %endpoint.url, attempt = planner.attempts(), "opening market stream");
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = timeout(settings.connect_timeout, inner.transport.open(&uri)) => result,
        };

        let mut flapped = false;
        match opened {
            Ok(Ok(mut socket)) => {
                let opened_at = Instant::now();
                planner.on_open();
                inner.pool.remember(index);
                if !inner.transition(generation, ConnectionPhase::Open, Some(&endpoint.url), 0) {
                    socket.close().await;
                    return;
                }
                info!(endpoint = %endpoint.url, "market stream open");
                inner.observers.connect.emit(endpoint.url.clone());

                match run_session(&inner, &mut socket, &cancel).await {
                    SessionEnd::Cancelled => return,
                    SessionEnd::Closed(reason) => {
                        if !inner.is_current(generation) {
                            return;
                        }
                        info!(endpoint = %endpoint.url, reason = ?reason, "market stream closed");
                        inner.observers.disconnect.emit(reason.clone());
                        flapped = opened_at.elapsed() < MIN_FALLBACK_DELAY;
                        last_reason = reason;
                    }
                }
            }
            Ok(Err(error)) => {
                warn!(endpoint = %endpoint.url, %error, "market stream connect failed");
                last_reason = Some(error.to_string());
            }
            Err(_) => {
                warn!(
                    endpoint = %endpoint.url,
                    timeout_ms = settings.connect_timeout.as_millis() as u64,
                    "market stream connect timed out"
                );
                last_reason = Some("connection timed out".to_string());
            }
        }

        match planner.on_close(index) {
            ReconnectAction::Fallback { index: next } => {
                debug!(from = index, to = next, "falling back to next stream endpoint");
                if flapped {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = sleep(MIN_FALLBACK_DELAY) => {}
                    }
                }
                index = next;
            }
            ReconnectAction::Backoff {
                delay,
                index: next,
                attempt,
            } => {
                if !inner.transition(
                    generation,
                    ConnectionPhase::Closed,
                    Some(&endpoint.url),
                    attempt,
                ) {
                    return;
                }
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling market stream reconnect"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = sleep(delay) => {}
                }
                index = next;
            }
            ReconnectAction::GiveUp => {
                let reason = last_reason.take().unwrap_or_else(|| "connection closed".to_string());
                warn!(
                    attempts = settings.max_attempts,
                    %reason,
                    "market stream reconnect attempts exhausted"
                );
                fail(
                    &inner,
                    generation,
                    format!(
                        "gave up after {} reconnect attempts: {reason}",
                        settings.max_attempts
                    ),
                );
                return;
            }
        }
    }
}

fn fail<T>(inner: &ConnectionInner<T>, generation: u64, reason: String) {
    let error = AppError::Transport(reason);
    if inner.transition_with_reason(
        generation,
        ConnectionPhase::Failed,
        None,
        inner.settings.max_attempts,
        Some(error.to_string()),
    ) {
        inner.observers.error.emit(Arc::new(error));
    }
}

async fn run_session<T: StreamTransport>(
    inner: &ConnectionInner<T>,
    socket: &mut T::Socket,
    cancel: &CancellationToken,
) -> SessionEnd {
    let period = inner.settings.keepalive_interval;
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                socket.close().await;
                return SessionEnd::Cancelled;
            }
            _ = keepalive.tick() => {
                if let Err(error) = socket.send_text(KEEPALIVE_PING.to_string()).await {
                    warn!(%error, "keepalive ping failed");
                    return SessionEnd::Closed(Some(error.to_string()));
                }
                debug!("keepalive ping sent");
            }
            frame = socket.next_frame() => match frame {
                None => return SessionEnd::Closed(None),
                Some(Err(error)) => {
                    warn!(%error, "market stream transport error");
                    return SessionEnd::Closed(Some(error.to_string()));
                }
                Some(Ok(InboundFrame::Close(reason))) => return SessionEnd::Closed(reason),
                Some(Ok(InboundFrame::Control)) => {}
                Some(Ok(InboundFrame::Payload(mut payload))) => {
                    match parse_stream_frame(&mut payload) {
                        Ok(ticks) if ticks.is_empty() => {}
                        Ok(ticks) => inner.observers.message.emit(Arc::new(ticks)),
                        Err(error) => warn!(%error, "dropping malformed stream frame"),
                    }
                }
            },
        }
    }
}
