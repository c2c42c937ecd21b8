// ── Object documents ──

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A server-managed metadata document (device, channel, state, adapter
/// instance, ...), identified by a dotted id.
///
/// Only the fields the client reasons about are typed; everything else
/// is kept verbatim in `extra` so documents survive a read-modify-write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoObject {
    #[serde(rename = "_id", default)]
    pub id: String,

    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub object_type: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub common: Value,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub native: Value,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IoObject {
    pub fn new(id: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object_type: object_type.into(),
            common: Value::Object(Map::new()),
            native: Value::Object(Map::new()),
            rev: None,
            extra: Map::new(),
        }
    }

    /// The minimal identity (id + type) of this document.
    pub fn identity(&self) -> ObjectIdentity {
        ObjectIdentity {
            id: self.id.clone(),
            object_type: self.object_type.clone(),
        }
    }

    /// `common.<key>`, if present.
    pub fn common_field(&self, key: &str) -> Option<&Value> {
        self.common.get(key)
    }

    /// Remove the bookkeeping fields the server owns (`from`, `user`,
    /// `ts`) before writing a document back.
    pub fn strip_server_fields(&mut self) {
        for key in ["from", "user", "ts"] {
            self.extra.remove(key);
        }
    }

    /// Ensure `common` and `native` are objects.
    pub(crate) fn fill_sections(&mut self) {
        if !self.common.is_object() {
            self.common = Value::Object(Map::new());
        }
        if !self.native.is_object() {
            self.native = Value::Object(Map::new());
        }
    }
}

/// Prior identity of an object, delivered alongside a change so that
/// subscribers can detect deletions and type transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIdentity {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub object_type: String,
}

/// Fill in `common.adminUI` for adapters that still describe their UI
/// with the legacy flags.
pub fn fix_admin_ui(obj: &mut IoObject) {
    let Some(common) = obj.common.as_object_mut() else {
        return;
    };
    if common.get("adminUI").is_some_and(is_truthy) {
        return;
    }

    let flag = |common: &Map<String, Value>, key: &str| common.get(key).is_some_and(is_truthy);

    let mut admin_ui = Map::new();
    let config = if flag(common, "noConfig") {
        "none"
    } else if flag(common, "jsonConfig") {
        "json"
    } else if flag(common, "materialize") {
        "materialize"
    } else {
        "html"
    };
    admin_ui.insert("config".into(), config.into());

    if flag(common, "jsonCustom") || flag(common, "supportCustoms") {
        admin_ui.insert("custom".into(), "json".into());
    }

    if flag(common, "adminTab") {
        let tab = if flag(common, "materializeTab") {
            "materialize"
        } else {
            "html"
        };
        admin_ui.insert("tab".into(), tab.into());
    }

    let admin_ui = Value::Object(admin_ui);
    tracing::debug!(
        adapter = %obj.id,
        admin_ui = %admin_ui,
        "adapter lacks common.adminUI, derived from legacy flags"
    );
    common.insert("adminUI".into(), admin_ui);
}

/// JavaScript-style truthiness of a JSON value.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
