// =============================================================================
// Stream Connector — one persistent Binance websocket with auto-reconnect
// =============================================================================
//
// State machine:
//   Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting ...
//
// Subscriptions are tracked locally so every reconnect replays them, chunked
// the same way as the initial requests. A manual `stop()` is the only path
// that suppresses reconnection; exhausting the attempt budget ends the session
// with `MaxReconnectReached`.
//
// All socket I/O happens inside one spawned session task. Callers talk to it
// through an unbounded command channel and observe it through a broadcast
// channel of `ConnectorEvent`s. Broadcast receivers may lag and skip events,
// so consumers that must see every candle attach a bounded kline feed
// instead; the session waits on that feed rather than dropping candles.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use super::backoff::ReconnectPolicy;
use super::messages::{control_frames, parse_stream_message, StreamMessage};
use crate::market_data::{Candle, Ticker};
use crate::types::ConnectionState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Default combined-stream endpoint.
pub const DEFAULT_WS_URL: &str = "wss://stream.binance.com:9443/stream";

/// Binance caps a single connection at 1024 streams.
pub const MAX_STREAMS_PER_CONNECTION: usize = 1024;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub url: String,
    /// Interval between keepalive ping frames.
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// Maximum streams per SUBSCRIBE / UNSUBSCRIBE frame.
    pub subscribe_chunk_size: usize,
    /// Pause between consecutive control frames.
    pub subscribe_chunk_delay: Duration,
    pub max_streams: usize,
    /// Broadcast capacity; slow receivers lag and skip events.
    pub event_capacity: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            heartbeat_interval: Duration::from_secs(20),
            reconnect: ReconnectPolicy::default(),
            subscribe_chunk_size: 100,
            subscribe_chunk_delay: Duration::from_millis(250),
            max_streams: MAX_STREAMS_PER_CONNECTION,
            event_capacity: 4096,
        }
    }
}

// ---------------------------------------------------------------------------
// Events & commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    Connected,
    /// A finalized or in-progress candle update.
    Kline {
        symbol: String,
        interval: String,
        candle: Candle,
    },
    /// One batch from the aggregate ticker stream.
    Ticker(Arc<Vec<Ticker>>),
    Error(String),
    Closed { manual: bool },
    Reconnecting { attempt: u32, delay: Duration },
    MaxReconnectReached { attempts: u32 },
}

/// One kline delivered through the lossless feed.
#[derive(Debug, Clone, PartialEq)]
pub struct KlineUpdate {
    pub symbol: String,
    pub interval: String,
    pub candle: Candle,
}

#[derive(Debug)]
enum Command {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Stop,
}

enum SessionEnd {
    Stopped,
    Dropped(String),
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    config: ConnectorConfig,
    state: RwLock<ConnectionState>,
    /// Active streams in subscription order.
    subscriptions: RwLock<Vec<String>>,
    events: broadcast::Sender<ConnectorEvent>,
    next_request_id: AtomicU64,
    manual_close: AtomicBool,
    kline_feed: Mutex<Option<mpsc::Sender<KlineUpdate>>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let prev = std::mem::replace(&mut *self.state.write(), state);
        if prev != state {
            debug!(from = %prev, to = %state, "connection state changed");
        }
    }

    fn emit(&self, event: ConnectorEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn handle_text(&self, text: &str) {
        match parse_stream_message(text) {
            Ok(StreamMessage::Kline {
                symbol,
                interval,
                candle,
            }) => {
                let feed = self.kline_feed.lock().clone();
                if let Some(feed) = feed {
                    let update = KlineUpdate {
                        symbol: symbol.clone(),
                        interval: interval.clone(),
                        candle: candle.clone(),
                    };
                    if feed.send(update).await.is_err() {
                        debug!("kline feed receiver dropped -- detaching");
                        let mut slot = self.kline_feed.lock();
                        if slot.as_ref().is_some_and(|s| s.same_channel(&feed)) {
                            *slot = None;
                        }
                    }
                }
                self.emit(ConnectorEvent::Kline {
                    symbol,
                    interval,
                    candle,
                });
            }
            Ok(StreamMessage::Tickers(tickers)) => {
                self.emit(ConnectorEvent::Ticker(Arc::new(tickers)));
            }
            Ok(StreamMessage::Ack { id, error: Some(e) }) => {
                warn!(id, error = %e, "control request rejected");
                self.emit(ConnectorEvent::Error(format!("request {id} rejected: {e}")));
            }
            Ok(StreamMessage::Ack { id, error: None }) => trace!(id, "control request acknowledged"),
            Ok(StreamMessage::Other) => trace!("ignoring unrecognised stream message"),
            Err(e) => warn!(error = %e, "failed to parse stream message"),
        }
    }
}

// ---------------------------------------------------------------------------
// StreamConnector
// ---------------------------------------------------------------------------

pub struct StreamConnector {
    shared: Arc<Shared>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                subscriptions: RwLock::new(Vec::new()),
                events,
                next_request_id: AtomicU64::new(1),
                manual_close: AtomicBool::new(false),
                kline_feed: Mutex::new(None),
            }),
            commands: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to connector events. Dropping the receiver unsubscribes.
    pub fn events(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.shared.events.subscribe()
    }

    /// Attach a bounded, lossless kline feed, replacing any previous one.
    ///
    /// While attached, the session waits for space in the feed before reading
    /// further frames. Dropping the receiver detaches it.
    pub fn kline_feed(&self, capacity: usize) -> mpsc::Receiver<KlineUpdate> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.shared.kline_feed.lock() = Some(tx);
        rx
    }

    pub fn detach_kline_feed(&self) {
        self.shared.kline_feed.lock().take();
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.shared.config
    }

    /// Streams that will be (re)subscribed on every connection.
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.subscriptions.read().clone()
    }

    /// Open the transport and start the session task.
    ///
    /// Streams tracked before the call are subscribed as soon as the socket is
    /// up. Calling `connect` on a live connector is a no-op.
    pub async fn connect(&self) -> Result<()> {
        if self.task.lock().as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("connect called on a running connector");
            return Ok(());
        }

        let shared = self.shared.clone();
        shared.manual_close.store(false, Ordering::SeqCst);
        shared.set_state(ConnectionState::Connecting);
        info!(url = %shared.config.url, "connecting to market-data WebSocket");

        let ws = match open(&shared.config.url).await {
            Ok(ws) => ws,
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                shared.emit(ConnectorEvent::Error(format!("{e:#}")));
                return Err(e);
            }
        };

        shared.set_state(ConnectionState::Connected);
        shared.emit(ConnectorEvent::Connected);
        info!(url = %shared.config.url, "market-data WebSocket connected");

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_session(shared, ws, rx));
        *self.commands.lock() = Some(tx);
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Track `streams` and, when connected, request them in chunks.
    pub fn subscribe(&self, streams: &[String]) -> Result<()> {
        let added = {
            let mut subs = self.shared.subscriptions.write();
            let mut added = Vec::new();
            for stream in streams {
                if !subs.contains(stream) && !added.contains(stream) {
                    added.push(stream.clone());
                }
            }
            let limit = self.shared.config.max_streams;
            if subs.len() + added.len() > limit {
                anyhow::bail!(
                    "subscribing {} more streams would exceed the per-connection limit of {limit}",
                    added.len()
                );
            }
            subs.extend(added.iter().cloned());
            added
        };

        if added.is_empty() {
            return Ok(());
        }
        debug!(streams = added.len(), "subscribing");
        self.send_command(Command::Subscribe(added));
        Ok(())
    }

    /// Stop tracking `streams` and, when connected, unsubscribe them.
    pub fn unsubscribe(&self, streams: &[String]) {
        let removed: Vec<String> = {
            let mut subs = self.shared.subscriptions.write();
            let removed = subs.iter().filter(|s| streams.contains(s)).cloned().collect();
            subs.retain(|s| !streams.contains(s));
            removed
        };

        if removed.is_empty() {
            return;
        }
        debug!(streams = removed.len(), "unsubscribing");
        self.send_command(Command::Unsubscribe(removed));
    }

    /// Forget every tracked stream, unsubscribing them if connected.
    pub fn clear_subscriptions(&self) {
        let removed = std::mem::take(&mut *self.shared.subscriptions.write());
        if removed.is_empty() {
            return;
        }
        debug!(streams = removed.len(), "clearing subscriptions");
        self.send_command(Command::Unsubscribe(removed));
    }

    /// Close the connection for good. Reconnection is suppressed.
    pub async fn stop(&self) {
        self.shared.manual_close.store(true, Ordering::SeqCst);
        if let Some(tx) = self.commands.lock().take() {
            let _ = tx.send(Command::Stop);
        }

        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                warn!("session task did not stop in time -- aborting");
                handle.abort();
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!("market-data WebSocket stopped");
    }

    fn send_command(&self, command: Command) {
        if let Some(tx) = self.commands.lock().as_ref() {
            // A closed channel means the session already ended; the tracked
            // set is replayed on the next connect.
            let _ = tx.send(command);
        }
    }
}

impl Drop for StreamConnector {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for StreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnector")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .field("subscriptions", &self.shared.subscriptions.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

async fn open(url: &str) -> Result<WsStream> {
    let (ws, _response) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    Ok(ws)
}

async fn run_session(
    shared: Arc<Shared>,
    mut ws: WsStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        match drive_connection(&shared, ws, &mut commands).await {
            SessionEnd::Stopped => {
                shared.set_state(ConnectionState::Disconnected);
                shared.emit(ConnectorEvent::Closed { manual: true });
                return;
            }
            SessionEnd::Dropped(reason) => {
                warn!(reason = %reason, "market-data WebSocket closed unexpectedly");
                shared.emit(ConnectorEvent::Error(reason));
                shared.emit(ConnectorEvent::Closed { manual: false });
            }
        }

        match reconnect(&shared, &mut commands).await {
            Some(next) => ws = next,
            None => return,
        }
    }
}

/// Pump one live connection until it drops or a stop is requested.
async fn drive_connection(
    shared: &Shared,
    ws: WsStream,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    let tracked = shared.subscriptions.read().clone();
    if !tracked.is_empty() {
        if let Err(e) = send_control(shared, &mut write, "SUBSCRIBE", &tracked).await {
            return SessionEnd::Dropped(format!("{e:#}"));
        }
        info!(streams = tracked.len(), "subscriptions sent");
    }

    let period = shared.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => shared.handle_text(&text).await,
                Some(Ok(Message::Close(frame))) => {
                    return SessionEnd::Dropped(format!("server sent close frame: {frame:?}"));
                }
                // Pong replies to server pings are queued by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Dropped(format!("read error: {e}")),
                None => return SessionEnd::Dropped("stream ended".to_string()),
            },
            _ = heartbeat.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    return SessionEnd::Dropped(format!("heartbeat failed: {e}"));
                }
                trace!("heartbeat sent");
            }
            command = commands.recv() => match command {
                Some(Command::Subscribe(streams)) => {
                    if let Err(e) = send_control(shared, &mut write, "SUBSCRIBE", &streams).await {
                        return SessionEnd::Dropped(format!("{e:#}"));
                    }
                }
                Some(Command::Unsubscribe(streams)) => {
                    if let Err(e) = send_control(shared, &mut write, "UNSUBSCRIBE", &streams).await {
                        return SessionEnd::Dropped(format!("{e:#}"));
                    }
                }
                Some(Command::Stop) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Stopped;
                }
            },
        }
    }
}

/// Back off and reopen the socket. Returns `None` when stopped or when the
/// attempt budget runs out.
async fn reconnect(
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Option<WsStream> {
    let policy = &shared.config.reconnect;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if policy.exhausted(attempt) {
            let attempts = attempt - 1;
            error!(attempts, "reconnect budget exhausted -- giving up");
            shared.set_state(ConnectionState::Disconnected);
            shared.emit(ConnectorEvent::MaxReconnectReached { attempts });
            return None;
        }

        let delay = policy.delay_for(attempt);
        shared.set_state(ConnectionState::Reconnecting);
        shared.emit(ConnectorEvent::Reconnecting { attempt, delay });
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

        if wait_or_stop(shared, delay, commands).await {
            shared.set_state(ConnectionState::Disconnected);
            shared.emit(ConnectorEvent::Closed { manual: true });
            return None;
        }

        shared.set_state(ConnectionState::Connecting);
        match open(&shared.config.url).await {
            Ok(ws) => {
                shared.set_state(ConnectionState::Connected);
                shared.emit(ConnectorEvent::Connected);
                info!(attempt, "market-data WebSocket reconnected");
                return Some(ws);
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
                shared.emit(ConnectorEvent::Error(format!("{e:#}")));
            }
        }
    }
}

/// Sleep for `delay`. Returns `true` if a stop arrived meanwhile.
/// Subscription commands received here need no action: the tracked set is
/// replayed once the socket is back.
async fn wait_or_stop(
    shared: &Shared,
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        if shared.manual_close.load(Ordering::SeqCst) {
            return true;
        }
        tokio::select! {
            _ = &mut sleep => return shared.manual_close.load(Ordering::SeqCst),
            command = commands.recv() => match command {
                Some(Command::Stop) | None => return true,
                Some(_) => {}
            },
        }
    }
}

/// Send `streams` as chunked control frames with the configured pause between
/// chunks.
async fn send_control(
    shared: &Shared,
    write: &mut WsSink,
    method: &str,
    streams: &[String],
) -> Result<()> {
    let frames = control_frames(
        method,
        streams,
        shared.config.subscribe_chunk_size,
        &shared.next_request_id,
    );
    let total = frames.len();

    for (i, frame) in frames.into_iter().enumerate() {
        write
            .send(Message::Text(frame))
            .await
            .with_context(|| format!("failed to send {method} frame"))?;
        if i + 1 < total && !shared.config.subscribe_chunk_delay.is_zero() {
            tokio::time::sleep(shared.config.subscribe_chunk_delay).await;
        }
    }

    debug!(method, streams = streams.len(), frames = total, "control frames sent");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
