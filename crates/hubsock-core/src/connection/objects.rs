// ── Object operations ──
//
// Object subscriptions, cached and direct reads, writes that strip the
// server-owned bookkeeping fields, enums and object-view range queries.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::debug;

use super::{Connection, parse, view_rows};
use crate::callback::ObjectHandler;
use crate::error::ConnectionError;
use crate::model::IoObject;

/// Upper bound used for open-ended object-view ranges.
pub(super) const RANGE_END: &str = "\u{9999}";

const SERVER_FIELDS: [&str; 3] = ["from", "user", "ts"];

impl Connection {
    // ── Subscriptions ────────────────────────────────────────────────

    /// Subscribe `handler` to object changes for every pattern in `ids`.
    /// New patterns are announced with one `subscribeObjects` request.
    pub fn subscribe_object(&self, ids: &[&str], handler: Arc<ObjectHandler>) {
        let announce = {
            let mut t = self.tables();
            let mut announce = Vec::new();
            for id in ids {
                if t.objects.subscribe(id, Arc::clone(&handler)) {
                    announce.push((*id).to_owned());
                }
            }
            if t.subscribed && self.is_connected() {
                announce
            } else {
                Vec::new()
            }
        };
        if !announce.is_empty() {
            debug!(patterns = ?announce, "subscribing objects");
            self.emit("subscribeObjects", vec![json!(announce)]);
        }
    }

    /// Remove `handler` (or all handlers when `None`) from each pattern.
    pub fn unsubscribe_object(&self, ids: &[&str], handler: Option<&Arc<ObjectHandler>>) {
        let (removed, announce) = {
            let mut t = self.tables();
            let removed: Vec<String> = ids
                .iter()
                .copied()
                .filter(|id| t.objects.unsubscribe(id, handler))
                .map(str::to_owned)
                .collect();
            (removed, t.subscribed && self.is_connected())
        };
        if !removed.is_empty() && announce {
            self.emit("unsubscribeObjects", vec![json!(removed)]);
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Object document for `id`, `None` if it does not exist.
    ///
    /// The simulated state id answers a synthetic state object locally.
    pub async fn get_object(&self, id: &str) -> Result<Option<IoObject>, ConnectionError> {
        if self.tables().simulated.is_ignored(id) {
            let mut obj = IoObject::new(id, "state");
            obj.common = json!({ "name": "ignored state", "type": "mixed" });
            obj.native = Value::Null;
            return Ok(Some(obj));
        }

        let value = self.call_value("getObject", vec![json!(id)]).await?;
        if value.is_null() {
            Ok(None)
        } else {
            parse("getObject", value).map(Some)
        }
    }

    /// All objects. Served from the cache unless `force` is set or the
    /// cache was never loaded or went stale across a reconnect; a fetch
    /// replaces the cache wholesale.
    pub async fn get_objects(
        &self,
        force: bool,
    ) -> Result<HashMap<String, IoObject>, ConnectionError> {
        self.ensure_connected()?;
        if !force {
            let cached = self.tables().object_cache.fresh_snapshot();
            if let Some(objects) = cached {
                return Ok(objects);
            }
        }

        let name = if self.is_web() {
            "getObjects"
        } else {
            "getAllObjects"
        };
        let value = self.call_value(name, Vec::new()).await?;
        let objects = parse_object_map(name, value)?;
        debug!(count = objects.len(), "object cache refreshed");
        self.tables().object_cache.replace(objects.clone());
        Ok(objects)
    }

    /// Fetch the given ids in one round trip. Fetched documents refresh
    /// their cache entries if the cache is loaded.
    pub async fn get_objects_by_id(
        &self,
        ids: &[&str],
    ) -> Result<HashMap<String, IoObject>, ConnectionError> {
        let value = self.call_value("getObjects", vec![json!(ids)]).await?;
        let objects = parse_object_map("getObjects", value)?;
        {
            let mut t = self.tables();
            if t.object_cache.is_loaded() {
                for obj in objects.values() {
                    t.object_cache.insert(obj.clone());
                }
            }
        }
        Ok(objects)
    }

    /// Objects matching `pattern` (`*` when `None`), optionally of one type.
    pub async fn get_foreign_objects(
        &self,
        pattern: Option<&str>,
        object_type: Option<&str>,
    ) -> Result<HashMap<String, IoObject>, ConnectionError> {
        let value = self
            .call_value(
                "getForeignObjects",
                vec![json!(pattern.unwrap_or("*")), json!(object_type)],
            )
            .await?;
        parse_object_map("getForeignObjects", value)
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Store a whole object document.
    pub async fn set_object(&self, id: &str, obj: &IoObject) -> Result<(), ConnectionError> {
        let mut obj = obj.clone();
        obj.strip_server_fields();
        let obj = serde_json::to_value(obj)
            .map_err(|e| ConnectionError::InvalidArgument {
                message: e.to_string(),
            })?;
        self.call_unit("setObject", vec![json!(id), obj]).await
    }

    /// Merge `patch` into the stored document.
    pub async fn extend_object(&self, id: &str, patch: Value) -> Result<(), ConnectionError> {
        let Value::Object(mut patch) = patch else {
            return Err(ConnectionError::InvalidArgument {
                message: "Null object is not allowed".into(),
            });
        };
        for key in SERVER_FIELDS {
            patch.remove(key);
        }
        self.call_unit("extendObject", vec![json!(id), Value::Object(patch)])
            .await
    }

    /// Delete one object. `maintenance` also allows non-conforming ids.
    pub async fn del_object(&self, id: &str, maintenance: bool) -> Result<(), ConnectionError> {
        self.call_unit(
            "delObject",
            vec![json!(id), json!({ "maintenance": maintenance })],
        )
        .await
    }

    /// Delete an object and all its children.
    pub async fn del_objects(&self, id: &str, maintenance: bool) -> Result<(), ConnectionError> {
        self.call_unit(
            "delObjects",
            vec![json!(id), json!({ "maintenance": maintenance })],
        )
        .await
    }

    // ── Views ────────────────────────────────────────────────────────

    /// Enum objects below `enum.<name>` (all enums when `None`), keyed by
    /// id. The enum root itself is left out.
    pub async fn get_enums(
        &self,
        name: Option<&str>,
        force: bool,
    ) -> Result<HashMap<String, IoObject>, ConnectionError> {
        let name = name.unwrap_or_default().to_owned();
        let key = format!("enums_{}", if name.is_empty() { "all" } else { name.as_str() });
        let value = self
            .memoized(&key, force, move |conn| async move {
                conn.ensure_connected()?;
                let (start, end) = if name.is_empty() {
                    ("enum.".to_owned(), format!("enum.{RANGE_END}"))
                } else {
                    (format!("enum.{name}"), format!("enum.{name}.{RANGE_END}"))
                };
                let root = format!("enum.{name}");
                let rows = conn.object_view("system", "enum", &start, &end).await?;
                let enums: Map<String, Value> = rows
                    .into_iter()
                    .filter(|(id, _)| name.is_empty() || *id != root)
                    .collect();
                Ok(Value::Object(enums))
            })
            .await?;
        parse_object_map("getObjectView", value)
    }

    /// Range query over an arbitrary design document, keyed by id.
    pub async fn get_object_view_custom(
        &self,
        design: &str,
        object_type: &str,
        start: &str,
        end: Option<&str>,
    ) -> Result<HashMap<String, Value>, ConnectionError> {
        let rows = self
            .object_view(design, object_type, start, end.unwrap_or(RANGE_END))
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Range query over the `system` design, keyed by id.
    pub async fn get_object_view_system(
        &self,
        object_type: &str,
        start: &str,
        end: Option<&str>,
    ) -> Result<HashMap<String, IoObject>, ConnectionError> {
        let rows = self
            .object_view("system", object_type, start, end.unwrap_or(RANGE_END))
            .await?;
        rows.into_iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(id, value)| Ok((id, parse("getObjectView", value)?)))
            .collect()
    }

    /// All `meta` objects.
    pub async fn read_meta_items(&self) -> Result<Vec<IoObject>, ConnectionError> {
        let rows = self.object_view("system", "meta", "", RANGE_END).await?;
        rows.into_iter()
            .map(|(_, value)| parse("getObjectView", value))
            .collect()
    }

    /// `getObjectView` request returning the `(id, value)` rows.
    pub(super) async fn object_view(
        &self,
        design: &str,
        object_type: &str,
        start: &str,
        end: &str,
    ) -> Result<Vec<(String, Value)>, ConnectionError> {
        let value = self
            .call_value(
                "getObjectView",
                vec![
                    json!(design),
                    json!(object_type),
                    json!({ "startkey": start, "endkey": end }),
                ],
            )
            .await?;
        Ok(view_rows(value))
    }
}

/// Parse a `{ id: object | null }` map. Documents without `_id` take the
/// key as their id.
pub(super) fn parse_object_map(
    operation: &str,
    value: Value,
) -> Result<HashMap<String, IoObject>, ConnectionError> {
    let Value::Object(map) = value else {
        return Ok(HashMap::new());
    };
    map.into_iter()
        .filter(|(_, raw)| !raw.is_null())
        .map(|(id, raw)| {
            let mut obj: IoObject = parse(operation, raw)?;
            if obj.id.is_empty() {
                obj.id.clone_from(&id);
            }
            Ok((id, obj))
        })
        .collect()
}
