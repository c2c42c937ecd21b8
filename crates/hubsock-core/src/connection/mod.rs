// ── Connection client ──
//
// Stateful wrapper around a named-event transport. Owns the connection
// state machine, subscription tables, object cache, simulated states and
// the memo cache. Inbound transport events are handled by one task in
// arrival order; request-style calls run on the caller's task and only
// touch shared tables under a short, never-awaited lock.

mod admin;
mod files;
mod handlers;
mod instances;
mod lifecycle;
mod objects;
mod states;
mod system;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt as _;
use serde::de::DeserializeOwned;
use serde_json::Value;
use strum::Display;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use hubsock_api::{
    Endpoint, EventReceiver, Transport, WebSocketOptions, WebSocketTransport,
};

use crate::callback::{
    CmdExitHandler, CmdOutputHandler, ConnectionCallbacks, ConnectionHandler, FileHandler,
    InstanceMessageHandler, LogHandler, ObjectHandler, StateHandler, guarded,
};
use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, PERMISSION_ERROR};
use crate::model::object::is_truthy;
use crate::model::{IoObject, State};
use crate::store::{MemoCache, ObjectCache, SimulatedStates};
use crate::subscription::{FileSubscriptions, InstanceSubscriptions, SubscriptionTable};

// ── ConnectionState ──────────────────────────────────────────────────

/// Progress of the current connection cycle.
///
/// Moves forward monotonically and drops back to `Connecting` when the
/// transport disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Connecting,
    Connected,
    ObjectsLoaded,
    Ready,
}

// ── Connection ───────────────────────────────────────────────────────

/// Real-time client for the admin backend.
///
/// Cheaply cloneable via `Arc<Inner>`. Dropping the last clone cancels
/// background work and closes the transport.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    callbacks: ConnectionCallbacks,
    state: watch::Sender<ConnectionState>,
    first_connection: watch::Sender<bool>,
    connected: AtomicBool,
    tables: Mutex<Tables>,
    memo: MemoCache,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.transport.close();
    }
}

/// Mutable bookkeeping shared between the event task and callers.
struct Tables {
    states: SubscriptionTable<StateHandler>,
    objects: SubscriptionTable<ObjectHandler>,
    files: FileSubscriptions<FileHandler>,
    instances: InstanceSubscriptions<InstanceMessageHandler>,
    connection_handlers: Vec<Arc<ConnectionHandler>>,
    log_handlers: Vec<Arc<LogHandler>>,
    cmd_stdout: Option<Arc<CmdOutputHandler>>,
    cmd_stderr: Option<Arc<CmdOutputHandler>>,
    cmd_exit: Option<Arc<CmdExitHandler>>,
    object_cache: ObjectCache,
    simulated: SimulatedStates,
    /// Server-side subscriptions are live for this connection cycle.
    subscribed: bool,
    first_connect: bool,
    loaded: bool,
    loading: bool,
    wait_for_restart: bool,
    is_secure: bool,
    acl: Option<Value>,
    system_lang: Option<String>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            states: SubscriptionTable::default(),
            objects: SubscriptionTable::default(),
            files: FileSubscriptions::default(),
            instances: InstanceSubscriptions::default(),
            connection_handlers: Vec::new(),
            log_handlers: Vec::new(),
            cmd_stdout: None,
            cmd_stderr: None,
            cmd_exit: None,
            object_cache: ObjectCache::default(),
            simulated: SimulatedStates::default(),
            subscribed: false,
            first_connect: true,
            loaded: false,
            loading: false,
            wait_for_restart: false,
            is_secure: false,
            acl: None,
            system_lang: None,
        }
    }
}

impl Connection {
    /// Create a client over an existing transport and start handling its
    /// events. Must be called inside a Tokio runtime.
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        events: EventReceiver,
        callbacks: ConnectionCallbacks,
    ) -> Self {
        Self::with_cancel(config, transport, events, callbacks, CancellationToken::new())
    }

    /// Dial the WebSocket endpoint derived from the hosting page and
    /// return a client for it. The first dial happens in the background.
    pub fn open(
        config: ConnectionConfig,
        endpoint: &Endpoint,
        callbacks: ConnectionCallbacks,
    ) -> Result<Self, ConnectionError> {
        let mut config = config;
        config.mode = endpoint.mode;
        if config.session_url.is_none() {
            config.session_url = Some(endpoint.session_url()?);
        }

        let sid = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        let url = endpoint.websocket_url(sid, config.name.as_deref())?;
        let options = WebSocketOptions {
            reconnect: config.reconnect.clone(),
            ping_interval: config.ping_interval,
            ..WebSocketOptions::default()
        };
        info!(url = %url, mode = ?config.mode, "opening connection");

        let cancel = CancellationToken::new();
        let (transport, events) = WebSocketTransport::connect(url, options, cancel.clone());
        Ok(Self::with_cancel(
            config,
            Arc::new(transport),
            events,
            callbacks,
            cancel,
        ))
    }

    fn with_cancel(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        events: EventReceiver,
        callbacks: ConnectionCallbacks,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (first_connection, _) = watch::channel(false);

        let conn = Self {
            inner: Arc::new(Inner {
                config: config.normalized(),
                transport,
                callbacks,
                state,
                first_connection,
                connected: AtomicBool::new(false),
                tables: Mutex::new(Tables::default()),
                memo: MemoCache::default(),
                cancel: cancel.clone(),
            }),
        };

        tokio::spawn(lifecycle::event_loop(
            Arc::downgrade(&conn.inner),
            events,
            cancel,
        ));
        conn
    }

    /// Stop background work and close the transport.
    pub fn close(&self) {
        debug!("closing connection");
        self.inner.cancel.cancel();
        self.inner.transport.close();
        self.inner.connected.store(false, Ordering::Release);
        self.inner.memo.clear();
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Whether the server runs with authentication enabled.
    pub fn is_secure(&self) -> bool {
        self.tables().is_secure
    }

    pub fn is_web(&self) -> bool {
        self.inner.config.is_web()
    }

    /// Resolves once the first connection completed its handshake.
    pub async fn wait_for_first_connection(&self) {
        let mut rx = self.inner.first_connection.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Language chosen during the initial load.
    pub fn system_lang(&self) -> Option<String> {
        self.tables().system_lang.clone()
    }

    /// Permissions read during the initial load (only with `load_acl`).
    pub fn user_permissions(&self) -> Option<Value> {
        self.tables().acl.clone()
    }

    /// Cached object documents, if the cache has been loaded.
    pub fn cached_objects(&self) -> Option<std::collections::HashMap<String, IoObject>> {
        self.tables().object_cache.snapshot()
    }

    /// Ask for a reload instead of a resume on the next (re)connect.
    pub fn set_wait_for_restart(&self) {
        self.tables().wait_for_restart = true;
    }

    // ── Internal plumbing ────────────────────────────────────────────

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn progress(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
        debug!(%state, "connection progress");
        if let Some(hook) = &self.inner.callbacks.on_progress {
            guarded("on_progress", || hook(state));
        }
    }

    fn report_error(&self, message: &str) {
        match &self.inner.callbacks.on_error {
            Some(hook) => guarded("on_error", || hook(message)),
            None => error!(message, "connection error"),
        }
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }

    fn ensure_admin(&self, operation: &str) -> Result<(), ConnectionError> {
        if self.is_web() {
            Err(ConnectionError::NotAllowed {
                operation: operation.to_owned(),
            })
        } else {
            Ok(())
        }
    }

    /// Fire-and-forget emit.
    fn emit(&self, name: &str, args: Vec<Value>) {
        self.inner.transport.emit(name, args);
    }

    /// Emit and await the acknowledgement, bounded by `io_timeout`.
    async fn call(&self, name: &str, args: Vec<Value>) -> Result<Vec<Value>, ConnectionError> {
        self.ensure_connected()?;
        self.call_within(name, args, self.inner.config.io_timeout)
            .await
    }

    /// Emit and await the acknowledgement for at most `timeout`. Does not
    /// check the connection. On timeout the dropped [`Ack`](hubsock_api::Ack) releases the
    /// transport's correlation entry, so a late reply is discarded.
    async fn call_within(
        &self,
        name: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>, ConnectionError> {
        let reply = self.inner.transport.emit_with_ack(name, args);
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(args)) => Ok(args),
            Ok(Err(_)) => Err(ConnectionError::NotConnected),
            Err(_) => {
                debug!(name, timeout_ms = millis(timeout), "request timed out");
                Err(ConnectionError::Timeout {
                    operation: name.to_owned(),
                    timeout_ms: millis(timeout),
                })
            }
        }
    }

    /// Request using the `(err, result)` acknowledgement convention.
    async fn call_value(&self, name: &str, args: Vec<Value>) -> Result<Value, ConnectionError> {
        reply_value(self.call(name, args).await?)
    }

    /// Request whose acknowledgement carries only an error slot.
    async fn call_unit(&self, name: &str, args: Vec<Value>) -> Result<(), ConnectionError> {
        self.call_value(name, args).await.map(drop)
    }

    /// Host command with a client-side deadline. The acknowledgement is
    /// a single data argument: `"permissionError"` or a falsy value is
    /// turned into an error.
    async fn call_host(
        &self,
        name: &str,
        args: Vec<Value>,
        operation: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, ConnectionError> {
        self.ensure_connected()?;
        let timeout = timeout.unwrap_or(self.inner.config.cmd_timeout);
        let reply = self
            .call_within(name, args, timeout)
            .await
            .map_err(|e| match e {
                ConnectionError::Timeout { timeout_ms, .. } => ConnectionError::Timeout {
                    operation: operation.to_owned(),
                    timeout_ms,
                },
                other => other,
            })?;
        host_reply(operation, reply.into_iter().next().unwrap_or(Value::Null))
    }

    /// Serve `key` from the memo cache unless `force` is set; otherwise
    /// run `fetch` and share it with concurrent callers. The reply is
    /// stored once it arrives; failures are evicted.
    async fn memoized<F, Fut>(
        &self,
        key: &str,
        force: bool,
        fetch: F,
    ) -> Result<Value, ConnectionError>
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = Result<Value, ConnectionError>> + Send + 'static,
    {
        let cached = if force { None } else { self.inner.memo.get(key) };
        let (generation, shared) = match cached {
            Some(entry) => entry,
            None => {
                let shared = fetch(self.clone()).boxed().shared();
                (self.inner.memo.insert(key, &shared), shared)
            }
        };
        let result = shared.await;
        match &result {
            Ok(value) => self.inner.memo.complete(key, generation, value),
            Err(_) => self.inner.memo.evict(key, generation),
        }
        result
    }
}

// ── Reply helpers ────────────────────────────────────────────────────

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Split an `(err, result)` acknowledgement.
fn reply_value(reply: Vec<Value>) -> Result<Value, ConnectionError> {
    let mut args = reply.into_iter();
    let err = args.next().unwrap_or(Value::Null);
    if is_truthy(&err) {
        return Err(ConnectionError::from_server(&err));
    }
    Ok(args.next().unwrap_or(Value::Null))
}

fn host_reply(operation: &str, data: Value) -> Result<Value, ConnectionError> {
    if data.as_str() == Some(PERMISSION_ERROR) {
        Err(ConnectionError::Denied {
            operation: operation.to_owned(),
        })
    } else if is_truthy(&data) {
        Ok(data)
    } else {
        Err(ConnectionError::Unavailable {
            operation: operation.to_owned(),
        })
    }
}

fn parse<T: DeserializeOwned>(operation: &str, value: Value) -> Result<T, ConnectionError> {
    serde_json::from_value(value).map_err(|e| ConnectionError::invalid_response(operation, e))
}

/// Parse a `{ id: state | null }` map, dropping null entries.
fn parse_states(
    operation: &str,
    value: Value,
) -> Result<std::collections::HashMap<String, State>, ConnectionError> {
    let Value::Object(map) = value else {
        return Ok(std::collections::HashMap::new());
    };
    map.into_iter()
        .filter(|(_, state)| !state.is_null())
        .map(|(id, state)| Ok((id, parse(operation, state)?)))
        .collect()
}

/// Turn `{rows: [{id, value}]}` into `(id, value)` pairs.
fn view_rows(value: Value) -> Vec<(String, Value)> {
    let Value::Object(mut doc) = value else {
        return Vec::new();
    };
    let Some(Value::Array(rows)) = doc.remove("rows") else {
        return Vec::new();
    };
    rows.into_iter()
        .filter_map(|row| match row {
            Value::Object(mut row) => {
                let id = row.remove("id")?.as_str()?.to_owned();
                Some((id, row.remove("value").unwrap_or(Value::Null)))
            }
            _ => None,
        })
        .collect()
}

/// Render a push argument used as an id (strings verbatim, anything else
/// as JSON text).
fn value_to_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
