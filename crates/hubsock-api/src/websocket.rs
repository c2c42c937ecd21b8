//! WebSocket transport with request correlation and auto-reconnect.
//!
//! Connects to the admin socket endpoint, speaks the JSON-array frame
//! protocol from [`crate::protocol`], and exposes it through the
//! [`Transport`] trait. Acknowledged requests are tracked in a pending
//! table keyed by a monotonic correlation id; the table is cleared on
//! every disconnect so that awaiting callers observe a closed channel
//! instead of hanging. Reconnection uses exponential backoff + jitter.
//!
//! # Example
//!
//! ```rust,ignore
//! use hubsock_api::websocket::{WebSocketOptions, WebSocketTransport};
//! use hubsock_api::{Transport, TransportEvent};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! let url = Url::parse("ws://192.168.1.10:8081/?sid=1&name=admin")?;
//! let (transport, mut events) =
//!     WebSocketTransport::connect(url, WebSocketOptions::default(), CancellationToken::new());
//!
//! while let Some(event) = events.recv().await {
//!     if let TransportEvent::Connect { .. } = event {
//!         let reply = transport.emit_with_ack("getVersion", vec![]).await?;
//!         println!("{reply:?}");
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::protocol::Frame;
use crate::transport::{Ack, EventReceiver, Transport, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Message the server sends once all of its handlers are installed.
const READY_MESSAGE: &str = "___ready___";

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for WebSocket reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts after a connection was lost.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,

    /// Maximum dial retries before the very first connection succeeds.
    /// Default: 30.
    pub max_initial_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
            max_initial_retries: 30,
        }
    }
}

// ── WebSocketOptions ─────────────────────────────────────────────────

/// Tuning for a [`WebSocketTransport`].
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    pub reconnect: ReconnectConfig,
    /// Interval between keep-alive pings. A missing pong by the next
    /// tick drops the connection. Default: 5s.
    pub ping_interval: Duration,
    /// How long to wait for the server's ready marker before announcing
    /// the connection anyway. Default: 1s.
    pub ready_timeout: Duration,
    /// Optional `Cookie` header for the upgrade request (session auth).
    pub cookie: Option<String>,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            ping_interval: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(1),
            cookie: None,
        }
    }
}

// ── PendingTable ─────────────────────────────────────────────────────

/// Outstanding acknowledged requests, keyed by correlation id.
///
/// Ids are monotonic and never reused while an entry is live. Each
/// entry is removed exactly once: on settlement or on [`clear`](Self::clear).
#[derive(Debug, Default)]
pub struct PendingTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>,
}

impl PendingTable {
    /// Allocate a correlation id and register its reply channel.
    pub fn register(&self) -> (u64, oneshot::Receiver<Vec<Value>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Settle the entry for `id`. Returns `false` for unknown ids
    /// (already settled, cleared, or never issued).
    pub fn settle(&self, id: u64, args: Vec<Value>) -> bool {
        let Some(tx) = self.lock().remove(&id) else {
            return false;
        };
        // Caller may have stopped waiting (timed out); that's fine.
        let _ = tx.send(args);
        true
    }

    /// Drop a single entry without answering it.
    pub fn forget(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Drop every outstanding entry. Waiting receivers observe `RecvError`.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Vec<Value>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── WebSocketTransport ───────────────────────────────────────────────

/// Handle to a running WebSocket transport.
///
/// Cheaply cloneable. Dropping handles does not stop the background
/// task; call [`close`](Transport::close) or cancel the token.
#[derive(Clone)]
pub struct WebSocketTransport {
    shared: Arc<Shared>,
}

struct Shared {
    outgoing: mpsc::UnboundedSender<Frame>,
    pending: PendingTable,
    connected: AtomicBool,
    cancel: CancellationToken,
}

impl WebSocketTransport {
    /// Spawn the connection loop and return the transport handle plus
    /// its inbound event stream.
    ///
    /// Returns immediately; the first dial happens in the background and
    /// is reported as [`TransportEvent::Connect`] or
    /// [`TransportEvent::ConnectError`].
    pub fn connect(
        url: Url,
        options: WebSocketOptions,
        cancel: CancellationToken,
    ) -> (Self, EventReceiver) {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            outgoing,
            pending: PendingTable::default(),
            connected: AtomicBool::new(false),
            cancel,
        });

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            ws_loop(url, options, task_shared, outgoing_rx, event_tx).await;
        });

        (Self { shared }, event_rx)
    }

    /// Whether the socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Number of requests still waiting for an acknowledgement.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Transport for WebSocketTransport {
    fn emit(&self, name: &str, args: Vec<Value>) {
        if !self.is_connected() {
            tracing::debug!(name, "dropping emit while disconnected");
            return;
        }
        let _ = self.shared.outgoing.send(Frame::Message {
            id: 0,
            name: name.to_owned(),
            args,
        });
    }

    fn emit_with_ack(&self, name: &str, args: Vec<Value>) -> Ack {
        if !self.is_connected() {
            tracing::debug!(name, "rejecting request while disconnected");
            return Ack::rejected();
        }
        let (id, rx) = self.shared.pending.register();
        let frame = Frame::Message {
            id,
            name: name.to_owned(),
            args,
        };
        if self.shared.outgoing.send(frame).is_err() {
            self.shared.pending.forget(id);
            return Ack::new(rx);
        }
        // Settled entries are already gone; forgetting them is a no-op.
        let shared = Arc::downgrade(&self.shared);
        Ack::with_release(rx, move || {
            if let Some(shared) = shared.upgrade() {
                shared.pending.forget(id);
            }
        })
    }

    fn close(&self) {
        self.shared.cancel.cancel();
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Main loop: dial → run session → on drop, backoff → redial.
async fn ws_loop(
    url: Url,
    options: WebSocketOptions,
    shared: Arc<Shared>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Frame>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let cancel = shared.cancel.clone();
    let mut attempt: u32 = 0;
    let mut ever_connected = false;

    loop {
        let dialed = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = dial(&url, options.cookie.as_deref()) => result,
        };

        match dialed {
            Ok(stream) => {
                attempt = 0;
                shared.connected.store(true, Ordering::Release);

                let result = run_session(
                    stream,
                    &options,
                    &shared,
                    &mut outgoing_rx,
                    &event_tx,
                    ever_connected,
                )
                .await;
                ever_connected = true;

                shared.connected.store(false, Ordering::Release);
                let dropped = shared.pending.clear();
                while outgoing_rx.try_recv().is_ok() {}

                if cancel.is_cancelled() {
                    break;
                }

                let reason = match &result {
                    Ok(()) => "connection closed".to_owned(),
                    Err(e) => e.to_string(),
                };
                tracing::info!(reason, dropped, "WebSocket disconnected");
                let _ = event_tx.send(TransportEvent::Disconnect { reason });

                // Clean close: reconnect right away.
                if result.is_ok() {
                    continue;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "WebSocket connect failed");
                let _ = event_tx.send(TransportEvent::ConnectError(e.to_string()));

                let limit = if ever_connected {
                    options.reconnect.max_retries
                } else {
                    Some(options.reconnect.max_initial_retries)
                };
                if let Some(max) = limit {
                    if attempt >= max {
                        tracing::error!(
                            max_retries = max,
                            "WebSocket reconnection limit reached, giving up"
                        );
                        break;
                    }
                }
            }
        }

        let delay = calculate_backoff(attempt, &options.reconnect);
        tracing::debug!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "Waiting before reconnect"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }

        attempt = attempt.saturating_add(1);
    }

    shared.connected.store(false, Ordering::Release);
    shared.pending.clear();
    tracing::debug!("WebSocket loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Open the socket. `cookie` is injected on the upgrade request.
async fn dial(url: &Url, cookie: Option<&str>) -> Result<WsStream, Error> {
    tracing::info!(url = %url, "Connecting to WebSocket");

    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let mut request = ClientRequestBuilder::new(uri);
    if let Some(cookie_val) = cookie {
        request = request.with_header("Cookie", cookie_val);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    tracing::info!("WebSocket connected");
    Ok(stream)
}

/// Pump frames in both directions until the connection drops.
async fn run_session(
    stream: WsStream,
    options: &WebSocketOptions,
    shared: &Shared,
    outgoing_rx: &mut mpsc::UnboundedReceiver<Frame>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    is_reconnect: bool,
) -> Result<(), Error> {
    let (mut write, mut read) = stream.split();

    let mut ping = tokio::time::interval(options.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.reset();
    let mut awaiting_pong = false;

    let ready_deadline = tokio::time::sleep(options.ready_timeout);
    tokio::pin!(ready_deadline);
    let mut announced = false;

    let announce = |ready: bool| {
        let event = if is_reconnect {
            TransportEvent::Reconnect
        } else {
            TransportEvent::Connect { ready }
        };
        let _ = event_tx.send(event);
    };

    loop {
        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => {
                let _ = write.send(tungstenite::Message::Close(None)).await;
                return Ok(());
            }
            () = &mut ready_deadline, if !announced => {
                tracing::debug!("no ready marker from server, announcing connection");
                announced = true;
                announce(false);
            }
            _ = ping.tick() => {
                if awaiting_pong {
                    return Err(Error::Timeout {
                        timeout_ms: u64::try_from(options.ping_interval.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                awaiting_pong = true;
                send_frame(&mut write, &Frame::Ping).await?;
            }
            Some(frame) = outgoing_rx.recv() => {
                send_frame(&mut write, &frame).await?;
            }
            message = read.next() => {
                match message {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        awaiting_pong = false;
                        match Frame::decode(text.as_str()) {
                            Ok(Frame::Ping) => send_frame(&mut write, &Frame::Pong).await?,
                            Ok(Frame::Pong) => tracing::trace!("pong"),
                            Ok(Frame::Callback { id, args, .. }) => {
                                if !shared.pending.settle(id, args) {
                                    tracing::debug!(id, "acknowledgement for unknown request");
                                }
                            }
                            Ok(Frame::Message { name, .. }) if name == READY_MESSAGE => {
                                if !announced {
                                    announced = true;
                                    announce(true);
                                }
                            }
                            Ok(Frame::Message { name, args, .. }) => {
                                let _ = event_tx.send(TransportEvent::Message { name, args });
                            }
                            Err(e) => tracing::debug!(error = %e, "Failed to decode WebSocket frame"),
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite answers protocol-level pings itself
                        tracing::trace!("WebSocket ping");
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "WebSocket close frame received"
                            );
                        }
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
                    None => {
                        tracing::info!("WebSocket stream ended");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_frame<S>(write: &mut S, frame: &Frame) -> Result<(), Error>
where
    S: futures_util::Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    write
        .send(tungstenite::Message::text(frame.encode()))
        .await
        .map_err(|e| Error::WebSocketClosed {
            code: 1006,
            reason: e.to_string(),
        })
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms from multiple clients.
pub(crate) fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
