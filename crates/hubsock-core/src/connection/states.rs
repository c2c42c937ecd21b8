// ── State operations ──
//
// State subscriptions with the immediate read-back, reads and writes,
// the client-simulated sentinel id, history and log requests.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{Connection, parse, parse_states};
use crate::callback::{StateHandler, guarded};
use crate::error::ConnectionError;
use crate::model::object::is_truthy;
use crate::model::{FileData, HistoryResult, State};

impl Connection {
    // ── Subscriptions ────────────────────────────────────────────────

    /// Subscribe `handler` to every pattern in `ids`.
    ///
    /// Patterns not tracked before are announced with one `subscribe`
    /// request. While connected, the current values are read once and
    /// handed to `handler` without waiting for a push.
    pub fn subscribe_state(&self, ids: &[&str], handler: Arc<StateHandler>) {
        let read_ids = self.track_states(ids, &handler);
        if read_ids.is_empty() || !self.is_connected() {
            return;
        }
        let conn = self.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.read_back(&read_ids, &handler).await {
                warn!(ids = ?read_ids, error = %e, "cannot read subscribed states");
            }
        });
    }

    /// Like [`subscribe_state`](Self::subscribe_state), but resolves once
    /// the initial read-back delivered the current values.
    pub async fn subscribe_state_async(
        &self,
        ids: &[&str],
        handler: Arc<StateHandler>,
    ) -> Result<(), ConnectionError> {
        let read_ids = self.track_states(ids, &handler);
        self.ensure_connected()?;
        if read_ids.is_empty() {
            return Ok(());
        }
        self.read_back(&read_ids, &handler).await
    }

    /// Remove `handler` (or every handler when `None`) from each pattern.
    /// Patterns left without handlers are announced with `unsubscribe`.
    pub fn unsubscribe_state(&self, ids: &[&str], handler: Option<&Arc<StateHandler>>) {
        let (removed, announce) = {
            let mut t = self.tables();
            let mut removed = Vec::new();
            for id in ids {
                if t.states.unsubscribe(id, handler) && !t.simulated.is_ignored(id) {
                    removed.push((*id).to_owned());
                }
            }
            (removed, t.subscribed && self.is_connected())
        };
        if !removed.is_empty() && announce {
            self.emit("unsubscribe", vec![json!(removed)]);
        }
    }

    /// Register the handler and announce new patterns. Returns the ids
    /// that need a server read-back; the sentinel is answered locally.
    fn track_states(&self, ids: &[&str], handler: &Arc<StateHandler>) -> Vec<String> {
        let (announce, read_ids, simulated) = {
            let mut t = self.tables();
            let mut announce = Vec::new();
            let mut read_ids = Vec::new();
            let mut simulated = None;
            for id in ids {
                let is_new = t.states.subscribe(id, Arc::clone(handler));
                if t.simulated.is_ignored(id) {
                    simulated = t.simulated.get(id).cloned().map(|s| ((*id).to_owned(), s));
                    continue;
                }
                if is_new {
                    announce.push((*id).to_owned());
                }
                read_ids.push((*id).to_owned());
            }
            if !(t.subscribed && self.is_connected()) {
                announce.clear();
            }
            (announce, read_ids, simulated)
        };

        if !announce.is_empty() {
            debug!(patterns = ?announce, "subscribing states");
            self.emit("subscribe", vec![json!(announce)]);
        }
        if let Some((id, state)) = simulated {
            guarded("state subscriber", || handler(&id, Some(&state)));
        }
        read_ids
    }

    /// One-time read of the current values for freshly subscribed ids.
    async fn read_back(
        &self,
        ids: &[String],
        handler: &Arc<StateHandler>,
    ) -> Result<(), ConnectionError> {
        let name = if self.is_web() {
            "getStates"
        } else {
            "getForeignStates"
        };
        let arg = match ids {
            [id] => json!(id),
            _ => json!(ids),
        };
        let mut reply = self.call(name, vec![arg]).await?.into_iter();
        let err = reply.next().unwrap_or(Value::Null);
        if is_truthy(&err) {
            warn!(ids = ?ids, error = %err, "state read-back reported an error");
        }
        let Some(Value::Object(states)) = reply.next() else {
            return Err(if is_truthy(&err) {
                ConnectionError::from_server(&err)
            } else {
                ConnectionError::Unavailable {
                    operation: name.to_owned(),
                }
            });
        };

        for (id, raw) in states {
            let state = if raw.is_null() {
                None
            } else {
                Some(parse::<State>(name, raw)?)
            };
            guarded("state subscriber", || handler(&id, state.as_ref()));
        }
        Ok(())
    }

    // ── Simulated state ──────────────────────────────────────────────

    /// Handle `id` purely client-side: reads and writes never reach the
    /// server and writes are delivered to local subscribers immediately.
    pub fn set_state_to_ignore(&self, id: &str) {
        debug!(id, "state is simulated locally");
        self.tables().simulated.set_ignored(id);
    }

    fn simulated_write(&self, id: &str, payload: Value, ack: Option<bool>) {
        let is_state = payload.is_object() && (ack.is_some() || payload.get("val").is_some());
        let state = if is_state {
            serde_json::from_value(payload.clone()).unwrap_or_else(|_| State::simulated(payload))
        } else {
            State::simulated(payload)
        };
        let handlers = {
            let mut t = self.tables();
            t.simulated.set(id, state.clone());
            t.states.exact(id)
        };
        for handler in &handlers {
            guarded("state subscriber", || handler(id, Some(&state)));
        }
    }

    // ── Reads and writes ─────────────────────────────────────────────

    /// Current state of `id`, `None` if the server has none.
    pub async fn get_state(&self, id: &str) -> Result<Option<State>, ConnectionError> {
        let simulated = {
            let t = self.tables();
            t.simulated
                .is_ignored(id)
                .then(|| t.simulated.get(id).cloned().unwrap_or_else(State::unset))
        };
        if simulated.is_some() {
            return Ok(simulated);
        }

        let value = self.call_value("getState", vec![json!(id)]).await?;
        if value.is_null() {
            Ok(None)
        } else {
            parse("getState", value).map(Some)
        }
    }

    /// Write a value. With `ack` the value is wrapped as `{ val, ack }`;
    /// otherwise it is sent as given (a bare value or a state object).
    pub async fn set_state(
        &self,
        id: &str,
        val: impl Into<Value>,
        ack: Option<bool>,
    ) -> Result<(), ConnectionError> {
        let val = val.into();
        let payload = match ack {
            Some(ack) => json!({ "val": val, "ack": ack }),
            None => val,
        };

        if self.tables().simulated.is_ignored(id) {
            self.simulated_write(id, payload, ack);
            return Ok(());
        }
        self.call_unit("setState", vec![json!(id), payload]).await
    }

    /// All states the session may read.
    pub async fn get_states(&self) -> Result<HashMap<String, State>, ConnectionError> {
        let value = self.call_value("getStates", Vec::new()).await?;
        parse_states("getStates", value)
    }

    /// States matching `pattern` (`*` when `None`). Web sessions use the
    /// restricted `getStates` request.
    pub async fn get_foreign_states(
        &self,
        pattern: Option<&str>,
    ) -> Result<HashMap<String, State>, ConnectionError> {
        let name = if self.is_web() {
            "getStates"
        } else {
            "getForeignStates"
        };
        let value = self
            .call_value(name, vec![json!(pattern.unwrap_or("*"))])
            .await?;
        parse_states(name, value)
    }

    /// Binary state content, decoded from the base64 wire form.
    pub async fn get_binary_state(&self, id: &str) -> Result<Option<Vec<u8>>, ConnectionError> {
        let value = self.call_value("getBinaryState", vec![json!(id)]).await?;
        match value {
            Value::Null => Ok(None),
            Value::String(encoded) => FileData::from_base64(&encoded)
                .map(|data| Some(data.as_bytes().to_vec()))
                .map_err(|e| ConnectionError::invalid_response("getBinaryState", e)),
            other => Err(ConnectionError::invalid_response(
                "getBinaryState",
                format!("expected base64 text, got {other}"),
            )),
        }
    }

    pub async fn set_binary_state(&self, id: &str, data: &[u8]) -> Result<(), ConnectionError> {
        let encoded = FileData::Binary(data.to_vec()).to_base64();
        self.call_unit("setBinaryState", vec![json!(id), json!(encoded)])
            .await
    }

    // ── History and logs ─────────────────────────────────────────────

    pub async fn get_history(&self, id: &str, options: Value) -> Result<Value, ConnectionError> {
        self.call_value("getHistory", vec![json!(id), options]).await
    }

    /// History query that also returns the paging details.
    pub async fn get_history_ex(
        &self,
        id: &str,
        options: Value,
    ) -> Result<HistoryResult, ConnectionError> {
        let reply = self
            .call("getHistory", vec![json!(id), options])
            .await?;
        let mut reply = reply.into_iter();
        let err = reply.next().unwrap_or(Value::Null);
        if is_truthy(&err) {
            return Err(ConnectionError::from_server(&err));
        }
        let mut next = || reply.next().unwrap_or(Value::Null);
        Ok(HistoryResult {
            values: next(),
            step_ignore: next(),
            session_id: next(),
        })
    }

    /// Enable or disable the live log stream.
    pub async fn require_log(&self, enabled: bool) -> Result<(), ConnectionError> {
        self.call_unit("requireLog", vec![json!(enabled)]).await
    }

    /// Write a line to the server log. Empty text is ignored.
    pub fn log(&self, text: &str, level: Option<&str>) {
        if text.is_empty() {
            return;
        }
        self.emit("log", vec![json!(text), json!(level.unwrap_or("debug"))]);
    }
}
