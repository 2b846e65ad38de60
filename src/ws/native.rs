//! Native WebSocket client: `tokio-tungstenite`.
//!
//! Full implementation with:
//! - Background tokio task per connection session
//! - WebSocket-level ping/pong health check
//! - Exponential backoff reconnection with jitter, bounded attempts
//! - Channel registry + auto-resubscribe on reconnect
//! - Message queue when disconnected (pending frames flushed on reconnect)
//! - Callback fan-out to local subscribers
//!
//! The consumer API never awaits. All mutable state (connection state, attempt
//! counter, outbound queue, channel registry) sits behind one mutex, and frames
//! only reach the socket task while the state is `Connected`, so FIFO order
//! holds from queue flush through live sends.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::auth::CredentialProvider;
use crate::error::{ClientError, WsError};
use crate::shared::Channel;
use crate::ws::connection::{CloseOutcome, ConnectSkip, ConnectionManager};
use crate::ws::subscriptions::{dispatch_to, SubscriberRef};
use crate::ws::{ConnectionState, MessageIn, MessageOut, WsConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

// ─── Commands from public API to background task ─────────────────────────────

#[derive(Debug)]
enum Command {
    Send(MessageOut),
    Disconnect,
}

// ─── Disconnect reasons for reconnection decision ────────────────────────────

enum DisconnectReason {
    UserRequested,
    Closed { code: u16, reason: String },
    PongTimeout,
    Error(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserRequested => write!(f, "client disconnect"),
            Self::Closed { code, reason } => write!(f, "closed by server ({}: {})", code, reason),
            Self::PongTimeout => write!(f, "pong timeout"),
            Self::Error(e) => write!(f, "{}", e),
        }
    }
}

// ─── Shared state ────────────────────────────────────────────────────────────

struct Shared {
    manager: ConnectionManager,
    /// Bumped on every explicit connect/disconnect; a task whose epoch no
    /// longer matches must not touch the state.
    epoch: u64,
    cmd_tx: Option<mpsc::UnboundedSender<Command>>,
}

impl Shared {
    /// Hand a frame to the socket task.
    ///
    /// Only called while `Connected`. If the task died underneath us the
    /// frame is queued and the state drops to `Disconnected`, so the next
    /// `connect()` starts over and flushes it.
    fn transmit(&mut self, frame: MessageOut) {
        let cmd = Command::Send(frame);
        let cmd = match &self.cmd_tx {
            Some(tx) => match tx.send(cmd) {
                Ok(()) => return,
                Err(mpsc::error::SendError(cmd)) => cmd,
            },
            None => cmd,
        };
        if let Command::Send(frame) = cmd {
            tracing::warn!("Socket task unavailable, queueing {}", frame);
            self.cmd_tx = None;
            self.manager.disconnect();
            self.manager.send(frame);
        }
    }
}

struct Inner {
    config: WsConfig,
    credentials: Box<dyn CredentialProvider>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Inner {
    fn publish(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

// ─── Public WsClient ─────────────────────────────────────────────────────────

/// Native WebSocket client using `tokio-tungstenite`.
///
/// Cheap to clone; every clone is a handle to the same connection. Build one
/// at the application's composition root and pass handles to consumers.
///
/// Delivery is at-most-once and best effort since the last successful
/// connection: nothing published during an outage is replayed.
#[derive(Clone)]
pub struct WsClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish()
    }
}

impl WsClient {
    /// Create a new WS client. Does not connect yet.
    pub fn new(config: WsConfig, credentials: impl CredentialProvider + 'static) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    manager: ConnectionManager::new(&config),
                    epoch: 0,
                    cmd_tx: None,
                }),
                config,
                credentials: Box::new(credentials),
                state_tx,
            }),
        }
    }

    /// Like [`WsClient::new`], rejecting configs the client cannot run with.
    pub fn try_new(
        config: WsConfig,
        credentials: impl CredentialProvider + 'static,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self::new(config, credentials))
    }

    /// Start connecting in the background. Returns immediately.
    ///
    /// No-op while connected or connecting, and when the credential provider
    /// has no valid session. From `Reconnecting` or `Exhausted` it starts a
    /// fresh attempt with the attempt counter reset.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut shared = self.inner.shared.lock();

        let url = match shared
            .manager
            .begin_connect(self.inner.credentials.as_ref(), true)
        {
            Ok(url) => url,
            Err(ConnectSkip::AlreadyActive) => {
                tracing::debug!("Already connected or connecting, skipping");
                return;
            }
            Err(ConnectSkip::NotAuthenticated) => {
                tracing::warn!("No valid session token, skipping WebSocket connection");
                self.inner.publish(shared.manager.state());
                return;
            }
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("WebSocket connect called outside a tokio runtime: {}", e);
                shared.manager.abort_connect();
                self.inner.publish(shared.manager.state());
                return;
            }
        };

        shared.epoch += 1;
        let epoch = shared.epoch;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        if let Some(old) = shared.cmd_tx.replace(cmd_tx) {
            let _ = old.send(Command::Disconnect);
        }
        self.inner.publish(shared.manager.state());
        drop(shared);

        tracing::info!("Connecting to {}", self.inner.config.url);
        runtime.spawn(run_task(Arc::downgrade(&self.inner), epoch, cmd_rx, url));
    }

    /// Tear the connection down. Idempotent.
    ///
    /// Cancels a scheduled reconnect and closes the socket. Subscriptions are
    /// kept; a later [`connect`](Self::connect) resubscribes them.
    pub fn disconnect(&self) {
        let mut shared = self.inner.shared.lock();
        shared.epoch += 1;
        if let Some(tx) = shared.cmd_tx.take() {
            let _ = tx.send(Command::Disconnect);
        }
        if shared.manager.disconnect() {
            tracing::info!("WebSocket disconnected by client");
        }
        self.inner.publish(shared.manager.state());
    }

    /// Send a control frame now, or queue it until the next connection.
    pub fn send(&self, frame: MessageOut) {
        let mut shared = self.inner.shared.lock();
        if let Some(frame) = shared.manager.send(frame) {
            shared.transmit(frame);
        }
        self.inner.publish(shared.manager.state());
    }

    /// Register `subscriber` for payloads on `channel`.
    ///
    /// Only the first subscriber of a channel sends a `subscribe` frame.
    /// Subscribing the same handle twice has no effect.
    pub fn subscribe(&self, channel: impl Into<Channel>, subscriber: SubscriberRef) {
        let mut shared = self.inner.shared.lock();
        if let Some(frame) = shared.manager.subscribe(channel.into(), subscriber) {
            shared.transmit(frame);
        }
        self.inner.publish(shared.manager.state());
    }

    /// Remove `subscriber` from `channel`.
    ///
    /// Once the last subscriber leaves, an `unsubscribe` frame is sent. Unknown
    /// channels and subscribers are ignored.
    pub fn unsubscribe(&self, channel: impl Into<Channel>, subscriber: &SubscriberRef) {
        let mut shared = self.inner.shared.lock();
        if let Some(frame) = shared.manager.unsubscribe(&channel.into(), subscriber) {
            shared.transmit(frame);
        }
        self.inner.publish(shared.manager.state());
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Whether the WebSocket is currently open.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.shared.lock().manager.attempts()
    }

    /// Channels that currently have at least one subscriber.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.shared.lock().manager.registry().channels()
    }

    pub fn subscriber_count(&self, channel: impl Into<Channel>) -> usize {
        self.inner
            .shared
            .lock()
            .manager
            .registry()
            .subscriber_count(&channel.into())
    }

    /// Frames waiting for the next connection.
    pub fn queued_frames(&self) -> Vec<MessageOut> {
        self.inner.shared.lock().manager.queued().cloned().collect()
    }

    pub fn config(&self) -> &WsConfig {
        &self.inner.config
    }
}

// ─── Background task ─────────────────────────────────────────────────────────

async fn run_task(
    inner: Weak<Inner>,
    epoch: u64,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    first_url: String,
) {
    let mut url = first_url;

    loop {
        let Some((connect_timeout, jitter_ms)) = inner
            .upgrade()
            .map(|i| (i.config.connect_timeout_ms, i.config.reconnect_jitter_ms))
        else {
            return;
        };

        // ── 1. Attempt connection ────────────────────────────────────────
        let mut unsent = Vec::new();
        match attempt_connect(&url, connect_timeout).await {
            Ok((mut sink, stream)) => {
                // ── 2. Connected: flush queue, resubscribe ───────────────
                let frames = with_current(&inner, epoch, |i, shared| {
                    let frames = shared.manager.on_open();
                    i.publish(shared.manager.state());
                    frames
                });
                let Some(frames) = frames else {
                    let _ = sink.close().await;
                    return;
                };
                tracing::info!("WebSocket connected");

                if let Err(frame) = flush(&mut sink, frames, &mut unsent).await {
                    tracing::warn!("Failed to flush {}: connection dropped", frame);
                } else {
                    // ── 3. Inner select! loop ────────────────────────────
                    let reason =
                        run_connected(&inner, &mut cmd_rx, sink, stream, &mut unsent).await;
                    if let DisconnectReason::UserRequested = reason {
                        return;
                    }
                    tracing::warn!("WebSocket disconnected: {}", reason);
                }
            }
            Err(e) => {
                tracing::error!("WebSocket connection failed: {}", e);
            }
        }

        // ── 4. Post-disconnect decision ──────────────────────────────────
        let outcome = with_current(&inner, epoch, |i, shared| {
            reclaim_in_flight(&mut shared.manager, &mut cmd_rx, unsent);
            let outcome = shared.manager.on_closed();
            i.publish(shared.manager.state());
            outcome
        });

        let (attempt, delay) = match outcome {
            Some(CloseOutcome::Reconnect { attempt, delay }) => (attempt, delay),
            Some(CloseOutcome::Exhausted) => {
                tracing::error!("Max reconnect attempts reached, giving up");
                return;
            }
            Some(CloseOutcome::Stopped) | None => return,
        };

        let jitter = if jitter_ms > 0 {
            rand::random::<u64>() % jitter_ms
        } else {
            0
        };
        let delay = delay + Duration::from_millis(jitter);
        tracing::warn!(
            "Reconnect attempt {} in {}ms",
            attempt,
            delay.as_millis()
        );

        if !backoff_sleep(&inner, &mut cmd_rx, delay).await {
            return;
        }

        // ── 5. Next attempt re-reads the token ───────────────────────────
        let next = with_current(&inner, epoch, |i, shared| {
            let next = shared
                .manager
                .begin_connect(i.credentials.as_ref(), false);
            i.publish(shared.manager.state());
            next
        });
        match next {
            Some(Ok(next_url)) => url = next_url,
            Some(Err(ConnectSkip::NotAuthenticated)) => {
                tracing::warn!("Session token gone, abandoning reconnect");
                return;
            }
            Some(Err(ConnectSkip::AlreadyActive)) | None => return,
        }
    }
}

/// Run `f` under the lock if the client still exists and `epoch` is current.
fn with_current<T>(
    inner: &Weak<Inner>,
    epoch: u64,
    f: impl FnOnce(&Inner, &mut Shared) -> T,
) -> Option<T> {
    let inner = inner.upgrade()?;
    let mut shared = inner.shared.lock();
    if shared.epoch != epoch {
        return None;
    }
    Some(f(&inner, &mut shared))
}

/// The inner connected loop, runs until the connection breaks.
async fn run_connected(
    inner: &Weak<Inner>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    mut sink: WsSink,
    mut stream: WsSource,
    unsent: &mut Vec<MessageOut>,
) -> DisconnectReason {
    let Some((ping_ms, pong_ms)) = inner
        .upgrade()
        .map(|i| (i.config.ping_interval_ms, i.config.pong_timeout_ms))
    else {
        return DisconnectReason::UserRequested;
    };
    let ping_dur = Duration::from_millis(ping_ms.max(1));
    let pong_dur = Duration::from_millis(pong_ms);

    let mut ping_interval = tokio::time::interval(ping_dur);
    ping_interval.reset(); // skip immediate first tick

    let mut pong_deadline: Option<tokio::time::Instant> = None;

    let far_future = tokio::time::Instant::now() + Duration::from_secs(86400);
    let pong_sleep = tokio::time::sleep_until(far_future);
    tokio::pin!(pong_sleep);

    loop {
        tokio::select! {
            // ── a) Incoming WS message ───────────────────────────────────
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let text_str: &str = text.as_ref();
                        if !handle_text(inner, text_str) {
                            return DisconnectReason::UserRequested;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                        pong_sleep.as_mut().reset(far_future);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = extract_close(frame.as_ref());
                        return DisconnectReason::Closed { code, reason };
                    }
                    Some(Ok(_)) => {} // Binary, Frame: ignore
                    Some(Err(e)) => {
                        return DisconnectReason::Error(WsError::from(e).to_string());
                    }
                    None => {
                        return DisconnectReason::Error("Stream ended".into());
                    }
                }
            }

            // ── b) Command from public API ───────────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Send(msg_out)) => {
                        if let Err(e) = send_msg(&mut sink, &msg_out).await {
                            unsent.push(msg_out);
                            return DisconnectReason::Error(e.to_string());
                        }
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = sink.send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "Client disconnect".into(),
                        }))).await;
                        return DisconnectReason::UserRequested;
                    }
                }
            }

            // ── c) Ping interval ─────────────────────────────────────────
            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    return DisconnectReason::Error(format!("Failed to send ping: {}", e));
                }
                if pong_deadline.is_none() {
                    let deadline = tokio::time::Instant::now() + pong_dur;
                    pong_deadline = Some(deadline);
                    pong_sleep.as_mut().reset(deadline);
                }
            }

            // ── d) Pong timeout ──────────────────────────────────────────
            () = &mut pong_sleep, if pong_deadline.is_some() => {
                let _ = sink.close().await;
                return DisconnectReason::PongTimeout;
            }
        }
    }
}

/// Decode and dispatch one text frame. Returns `false` if the client is gone.
fn handle_text(inner: &Weak<Inner>, text: &str) -> bool {
    let msg = match MessageIn::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("Discarding malformed frame: {}", e);
            tracing::debug!("Malformed frame raw: {}", text);
            return true;
        }
    };

    if let MessageIn::Error { detail } = &msg {
        tracing::warn!("Server error frame: {}", detail);
        return true;
    }

    let Some(inner) = inner.upgrade() else {
        return false;
    };
    // snapshot, then release the lock before calling out
    let targets = inner.shared.lock().manager.registry().targets(&msg);
    if let MessageIn::Data { channel, .. } = &msg {
        if targets.is_empty() {
            tracing::debug!("No subscribers for channel {}, dropping frame", channel);
        }
    }
    dispatch_to(&targets, &msg);
    true
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Attempt to establish a WebSocket connection within `timeout_ms`.
async fn attempt_connect(url: &str, timeout_ms: u64) -> Result<(WsSink, WsSource), WsError> {
    let (ws_stream, _) =
        tokio::time::timeout(Duration::from_millis(timeout_ms), connect_async(url))
            .await
            .map_err(|_| WsError::ConnectTimeout(timeout_ms))??;

    Ok(ws_stream.split())
}

/// Serialize and send a MessageOut over the sink.
async fn send_msg(sink: &mut WsSink, msg: &MessageOut) -> Result<(), WsError> {
    let json = msg
        .to_json()
        .map_err(|e| WsError::SendFailed(e.to_string()))?;
    tracing::debug!("Sending {}", msg);
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| WsError::SendFailed(e.to_string()))
}

/// Write the frames produced by `on_open`, in order.
///
/// On failure the failed frame and everything after it go to `unsent`.
async fn flush(
    sink: &mut WsSink,
    frames: Vec<MessageOut>,
    unsent: &mut Vec<MessageOut>,
) -> Result<(), MessageOut> {
    if !frames.is_empty() {
        tracing::info!("Flushing {} frame(s) after connect", frames.len());
    }
    let mut frames = frames.into_iter();
    while let Some(frame) = frames.next() {
        if send_msg(sink, &frame).await.is_err() {
            unsent.push(frame.clone());
            unsent.extend(frames);
            return Err(frame);
        }
    }
    Ok(())
}

/// Move frames accepted while connected but never written back to the head
/// of the outbound queue.
fn reclaim_in_flight(
    manager: &mut ConnectionManager,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    mut unsent: Vec<MessageOut>,
) {
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let Command::Send(msg) = cmd {
            unsent.push(msg);
        }
    }
    if !unsent.is_empty() {
        tracing::info!("Re-queueing {} unsent frame(s)", unsent.len());
        manager.requeue_front(unsent);
    }
}

/// Sleep before the next attempt. Returns `false` if the client asked to stop.
async fn backoff_sleep(
    inner: &Weak<Inner>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(msg)) => {
                    // raced with a state change; keep it for the next connection
                    let Some(inner) = inner.upgrade() else {
                        return false;
                    };
                    inner.shared.lock().manager.send(msg);
                }
                Some(Command::Disconnect) | None => return false,
            },
        }
    }
}

/// Extract close code and reason from an optional CloseFrame.
fn extract_close(frame: Option<&CloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (f.code.into(), f.reason.to_string()),
        None => (1006, "No close frame".into()),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
