// ── State records ──

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Marker used as `from` for client-simulated states.
pub(crate) const SIMULATED_STATE_SOURCE: &str = "system.adapter.vis.0";

/// A live value record associated with an object id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub val: Value,

    #[serde(default)]
    pub ack: bool,

    /// Timestamp of the last write, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,

    /// Timestamp of the last value change, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lc: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Quality code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<u32>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl State {
    /// A bare `{ val, ack }` record.
    pub fn new(val: impl Into<Value>, ack: bool) -> Self {
        Self {
            val: val.into(),
            ack,
            ts: None,
            lc: None,
            from: None,
            q: None,
            extra: Map::new(),
        }
    }

    /// Record for a locally simulated value, stamped with the current time.
    pub(crate) fn simulated(val: Value) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            ts: Some(now),
            lc: Some(now),
            from: Some(SIMULATED_STATE_SOURCE.to_owned()),
            ..Self::new(val, false)
        }
    }

    /// What `getState` answers for a simulated id that was never set.
    pub(crate) fn unset() -> Self {
        Self::new(Value::Null, true)
    }
}

/// Result of a history query with paging details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResult {
    pub values: Value,
    #[serde(rename = "stepIgnore", default)]
    pub step_ignore: Value,
    #[serde(rename = "sessionId", default)]
    pub session_id: Value,
}
