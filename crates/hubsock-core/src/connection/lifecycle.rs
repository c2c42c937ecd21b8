// ── Connection lifecycle ──
//
// Inbound event loop, handshake (version probe + authenticate), the
// initial permission/config/object load, reconnect replay and dispatch
// of server pushes to subscribers.

use std::collections::HashMap;
use std::sync::Weak;
use std::sync::atomic::Ordering;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use hubsock_api::{EventReceiver, TransportEvent};

use super::{Connection, ConnectionState, Inner, value_to_id};
use crate::callback::guarded;
use crate::error::ConnectionError;
use crate::model::admin::instance_object_id;
use crate::model::object::is_truthy;
use crate::model::{IoObject, LogEntry, PermissionError, State, normalize_language};
use crate::store::ObjectUpdate;

/// Marker the server puts in `error` pushes when the session expired.
const NOT_AUTHORIZED: &str = "User not authorized";

/// Drain transport events until cancelled, the transport goes away or
/// the last `Connection` handle is dropped.
pub(super) async fn event_loop(
    inner: Weak<Inner>,
    mut events: EventReceiver,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Connection { inner }.handle_event(event);
    }
    debug!("connection event loop stopped");
}

impl Connection {
    fn handle_event(&self, event: TransportEvent) {
        trace!(kind = event.kind(), "transport event");
        match event {
            TransportEvent::Connect { ready } => {
                let conn = self.clone();
                tokio::spawn(async move { conn.handshake(ready).await });
            }
            TransportEvent::Reconnect => self.on_reconnect(),
            TransportEvent::Disconnect { reason } => self.on_disconnect(&reason),
            TransportEvent::ConnectError(message) => {
                warn!(error = %message, "connect error");
            }
            TransportEvent::Message { name, args } => self.dispatch(&name, args),
        }
    }

    // ── Handshake ────────────────────────────────────────────────────

    /// Probe the server version unless the transport reported the server
    /// ready, then authenticate (or skip it for old servers).
    async fn handshake(&self, ready: bool) {
        let secure = if ready {
            true
        } else {
            if !self.sleep(self.inner.config.version_probe_delay).await {
                return;
            }
            match self.get_version(true).await {
                Ok(info) if info.numeric() < self.inner.config.secure_auth_since => {
                    info!(
                        version = %info.version,
                        server = %info.server_name,
                        "server predates secure authentication"
                    );
                    false
                }
                Ok(info) => {
                    debug!(version = %info.version, "server version");
                    true
                }
                Err(e) => {
                    warn!(error = %e, "version probe failed, authenticating anyway");
                    true
                }
            }
        };

        if secure {
            self.authenticate().await;
        } else {
            self.pre_connect(false, false);
        }
    }

    /// `authenticate` handshake with linear backoff between attempts.
    async fn authenticate(&self) {
        let policy = self.inner.config.auth_retry;
        for attempt in 1..=policy.attempts {
            match self
                .call_within("authenticate", Vec::new(), self.inner.config.io_timeout)
                .await
            {
                Ok(reply) => {
                    let is_ok = reply.first().is_some_and(is_truthy);
                    let is_secure = reply.get(1).is_some_and(is_truthy);
                    self.pre_connect(is_ok, is_secure);
                    return;
                }
                Err(ConnectionError::NotConnected) => {
                    debug!("transport dropped during authentication");
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "authenticate failed");
                    if attempt < policy.attempts
                        && !self.sleep(policy.delay.saturating_mul(attempt)).await
                    {
                        return;
                    }
                }
            }
        }
        warn!(attempts = policy.attempts, "giving up on authentication");
    }

    fn pre_connect(&self, is_ok: bool, is_secure: bool) {
        debug!(is_ok, is_secure, "authenticated");
        self.inner.connected.store(true, Ordering::Release);

        let (restart, first_connect, start_load) = {
            let mut t = self.tables();
            t.is_secure = is_secure;
            let start_load = t.first_connect && !t.loaded && !t.loading;
            if start_load {
                t.loading = true;
            }
            (t.wait_for_restart, t.first_connect, start_load)
        };

        if restart {
            self.restart_required();
        } else {
            if start_load {
                let conn = self.clone();
                tokio::spawn(async move { conn.load_with_retry().await });
            } else if !first_connect {
                self.progress(ConnectionState::Ready);
            }
            self.subscribe_all();
            self.notify_connection(true);
        }

        self.inner.first_connection.send_replace(true);
    }

    // ── Initial load ─────────────────────────────────────────────────

    async fn load_with_retry(self) {
        let policy = self.inner.config.load_retry;
        for attempt in 1..=policy.attempts {
            match self.load().await {
                Ok(()) => break,
                Err(message) if attempt == policy.attempts => self.report_error(&message),
                Err(message) => {
                    warn!(attempt, error = %message, "initial load failed, retrying");
                    if !self.sleep(policy.delay).await {
                        break;
                    }
                }
            }
        }
        self.tables().loading = false;
    }

    /// Permissions (optional), system config, language and the object
    /// set handed to `on_ready`.
    async fn load(&self) -> Result<(), String> {
        let config = &self.inner.config;

        if config.load_acl {
            let acl = self
                .call_value("getUserPermissions", Vec::new())
                .await
                .map_err(|e| format!("Cannot read user permissions: {e}"))?;
            self.mark_loaded();
            self.tables().acl = Some(acl);
        }

        let config_error = |e: ConnectionError| format!("Cannot read system config: {e}");
        let (language, system_config) = if config.admin5only {
            let compact = self
                .get_compact_system_config(false)
                .await
                .map_err(config_error)?;
            let language = compact
                .pointer("/common/language")
                .and_then(Value::as_str)
                .map(str::to_owned);
            (language, None)
        } else {
            let obj = self.get_system_config(false).await.map_err(config_error)?;
            let language = obj
                .common_field("language")
                .and_then(Value::as_str)
                .map(str::to_owned);
            (language, Some(obj))
        };

        if !config.load_acl {
            self.mark_loaded();
        }

        let language = language
            .filter(|lang| !lang.is_empty())
            .unwrap_or_else(|| normalize_language(config.fallback_locale.as_deref()));
        debug!(language, "system language");
        self.tables().system_lang = Some(language.clone());
        if let Some(hook) = &self.inner.callbacks.on_language {
            guarded("on_language", || hook(&language));
        }

        let objects = if config.load_all_objects {
            let objects = self.get_objects(false).await.map_err(config_error)?;
            self.progress(ConnectionState::ObjectsLoaded);
            objects
        } else {
            let objects: HashMap<String, IoObject> = system_config
                .into_iter()
                .map(|obj| (obj.id.clone(), obj))
                .collect();
            self.tables().object_cache.replace(objects.clone());
            objects
        };

        info!(objects = objects.len(), "connection ready");
        self.progress(ConnectionState::Ready);
        if let Some(hook) = &self.inner.callbacks.on_ready {
            guarded("on_ready", || hook(&objects));
        }
        Ok(())
    }

    fn mark_loaded(&self) {
        let newly_loaded = {
            let mut t = self.tables();
            let newly_loaded = !t.loaded;
            t.loaded = true;
            t.first_connect = false;
            newly_loaded
        };
        if newly_loaded {
            self.progress(ConnectionState::Connected);
        }
    }

    // ── Reconnect / disconnect ───────────────────────────────────────

    fn on_reconnect(&self) {
        info!("transport reconnected");
        self.progress(ConnectionState::Ready);
        self.inner.connected.store(true, Ordering::Release);

        if self.tables().wait_for_restart {
            self.restart_required();
        } else {
            self.subscribe_all();
            self.notify_connection(true);
        }
    }

    fn on_disconnect(&self, reason: &str) {
        info!(reason, "transport disconnected");
        self.inner.connected.store(false, Ordering::Release);
        {
            let mut t = self.tables();
            t.subscribed = false;
            t.object_cache.mark_stale();
        }
        // Anything memoized may have changed while offline.
        self.inner.memo.clear();
        self.progress(ConnectionState::Connecting);
        self.notify_connection(false);
    }

    /// Announce every tracked pattern once per connection cycle.
    pub(super) fn subscribe_all(&self) {
        let (objects, states, files) = {
            let mut t = self.tables();
            if t.subscribed {
                return;
            }
            t.subscribed = true;
            let states: Vec<String> = t
                .states
                .patterns()
                .into_iter()
                .filter(|pattern| !t.simulated.is_ignored(pattern))
                .collect();
            (t.objects.patterns(), states, t.files.grouped())
        };
        let config = &self.inner.config;
        debug!(
            objects = objects.len(),
            states = states.len(),
            files = files.len(),
            "announcing subscriptions"
        );

        for id in config.auto_subscribes.iter().chain(&objects) {
            self.emit("subscribeObjects", vec![json!(id)]);
        }
        if config.auto_subscribe_log {
            self.emit("requireLog", vec![json!(true)]);
        }
        for id in &states {
            self.emit("subscribe", vec![json!(id)]);
        }
        for (id, patterns) in files {
            self.emit("subscribeFiles", vec![json!(id), json!(patterns)]);
        }
    }

    fn notify_connection(&self, connected: bool) {
        let handlers = self.tables().connection_handlers.clone();
        for handler in &handlers {
            guarded("connection handler", || handler(connected));
        }
    }

    fn restart_required(&self) {
        match &self.inner.callbacks.on_restart_required {
            Some(hook) => guarded("on_restart_required", || hook()),
            None => warn!("restart pending but no restart hook installed"),
        }
    }

    fn auth_required(&self) {
        match &self.inner.callbacks.on_auth_required {
            Some(hook) => guarded("on_auth_required", || hook()),
            None => warn!("server requested authentication but no hook installed"),
        }
    }

    /// Sleep unless the connection is closed first. Returns `false` when
    /// cancelled.
    async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    // ── Push dispatch ────────────────────────────────────────────────

    fn dispatch(&self, name: &str, args: Vec<Value>) {
        let mut args = args.into_iter();
        let mut next = || args.next().unwrap_or(Value::Null);
        match name {
            "reauthenticate" => self.auth_required(),
            "log" => self.on_log(next()),
            "error" => self.on_server_error(&next()),
            "permissionError" => self.on_permission_error(next()),
            "objectChange" => {
                let id = value_to_id(&next());
                self.object_change(&id, next());
            }
            "stateChange" => {
                let id = value_to_id(&next());
                self.state_change(&id, next());
            }
            "im" => {
                let message_type = value_to_id(&next());
                let from = value_to_id(&next());
                self.instance_message(&message_type, &from, &next());
            }
            "fileChange" => {
                let id = value_to_id(&next());
                let file_name = value_to_id(&next());
                let size = next().as_u64();
                self.file_change(&id, &file_name, size);
            }
            "cmdStdout" | "cmdStderr" => {
                let id = value_to_id(&next());
                let text = value_to_id(&next());
                let handler = {
                    let t = self.tables();
                    if name == "cmdStdout" {
                        t.cmd_stdout.clone()
                    } else {
                        t.cmd_stderr.clone()
                    }
                };
                if let Some(handler) = handler {
                    guarded(name, || handler(&id, &text));
                }
            }
            "cmdExit" => {
                let id = value_to_id(&next());
                let code = next().as_i64().unwrap_or_default();
                let handler = self.tables().cmd_exit.clone();
                if let Some(handler) = handler {
                    guarded("cmdExit", || handler(&id, code));
                }
            }
            other => trace!(event = other, "unhandled push"),
        }
    }

    fn on_log(&self, raw: Value) {
        let entry: LogEntry = match serde_json::from_value(raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "malformed log push");
                return;
            }
        };
        if let Some(hook) = &self.inner.callbacks.on_log {
            guarded("on_log", || hook(&entry));
        }
        let handlers = self.tables().log_handlers.clone();
        for handler in &handlers {
            guarded("log handler", || handler(&entry));
        }
    }

    fn on_server_error(&self, raw: &Value) {
        let text = match raw {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => {
                warn!(error = %other, "received non-text error push");
                other.to_string()
            }
        };
        if text.contains(NOT_AUTHORIZED) {
            self.auth_required();
        } else {
            self.report_error(&format!("Socket Error: {text}"));
        }
    }

    fn on_permission_error(&self, raw: Value) {
        let err: PermissionError = match serde_json::from_value(raw) {
            Ok(err) => err,
            Err(e) => {
                warn!(error = %e, "malformed permissionError push");
                return;
            }
        };
        warn!(operation = %err.operation, kind = %err.kind, "permission denied");
        match &self.inner.callbacks.on_permission_error {
            Some(hook) => guarded("on_permission_error", || hook(&err)),
            None => self.report_error(&err.describe()),
        }
    }

    fn object_change(&self, id: &str, raw: Value) {
        let obj = if raw.is_null() {
            None
        } else {
            match serde_json::from_value::<IoObject>(raw) {
                Ok(mut obj) => {
                    if obj.id.is_empty() {
                        id.clone_into(&mut obj.id);
                    }
                    Some(obj)
                }
                Err(e) => {
                    warn!(id, error = %e, "malformed objectChange push");
                    return;
                }
            }
        };

        let (update, handlers) = {
            let mut t = self.tables();
            let update = t.object_cache.apply(id, obj.clone());
            let handlers = match update {
                ObjectUpdate::Changed { .. } => t.objects.matching(id),
                _ => Vec::new(),
            };
            (update, handlers)
        };
        let ObjectUpdate::Changed { previous } = update else {
            trace!(id, ?update, "object change suppressed");
            return;
        };

        for handler in &handlers {
            guarded("object subscriber", || {
                handler(id, obj.as_ref(), previous.as_ref());
            });
        }
        if let Some(hook) = &self.inner.callbacks.on_object_change {
            guarded("on_object_change", || hook(id, obj.as_ref()));
        }
    }

    fn state_change(&self, id: &str, raw: Value) {
        let state = if raw.is_null() {
            None
        } else {
            match serde_json::from_value::<State>(raw) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(id, error = %e, "malformed stateChange push");
                    return;
                }
            }
        };
        let handlers = self.tables().states.matching(id);
        for handler in &handlers {
            guarded("state subscriber", || handler(id, state.as_ref()));
        }
    }

    fn instance_message(&self, message_type: &str, from: &str, data: &Value) {
        let source = instance_object_id(from);
        let handlers = self.tables().instances.matching(&source, message_type);
        for handler in &handlers {
            guarded("instance message subscriber", || {
                handler(data, &source, message_type);
            });
        }
    }

    fn file_change(&self, id: &str, file_name: &str, size: Option<u64>) {
        let handlers = self.tables().files.matching(id, file_name);
        for handler in &handlers {
            guarded("file subscriber", || handler(id, file_name, size));
        }
    }
}
