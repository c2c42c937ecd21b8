// ── File storage operations ──

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use super::{Connection, parse};
use crate::callback::FileHandler;
use crate::error::ConnectionError;
use crate::model::object::is_truthy;
use crate::model::{FileAclChange, FileContent, FileData, FileEntry};

impl Connection {
    /// Subscribe `handler` to changes of files matching any of
    /// `file_patterns` below the meta object(s) matching `id`.
    pub fn subscribe_files(&self, id: &str, file_patterns: &[&str], handler: Arc<FileHandler>) {
        let announce = {
            let mut t = self.tables();
            let fresh: Vec<String> = file_patterns
                .iter()
                .copied()
                .filter(|pattern| t.files.subscribe(id, pattern, Arc::clone(&handler)))
                .map(str::to_owned)
                .collect();
            if t.subscribed && self.is_connected() {
                fresh
            } else {
                Vec::new()
            }
        };
        if !announce.is_empty() {
            debug!(id, patterns = ?announce, "subscribing files");
            self.emit("subscribeFiles", vec![json!(id), json!(announce)]);
        }
    }

    pub fn unsubscribe_files(
        &self,
        id: &str,
        file_patterns: &[&str],
        handler: Option<&Arc<FileHandler>>,
    ) {
        let (removed, announce) = {
            let mut t = self.tables();
            let removed: Vec<String> = file_patterns
                .iter()
                .copied()
                .filter(|pattern| t.files.unsubscribe(id, pattern, handler))
                .map(str::to_owned)
                .collect();
            (removed, t.subscribed && self.is_connected())
        };
        if !removed.is_empty() && announce {
            self.emit("unsubscribeFiles", vec![json!(id), json!(removed)]);
        }
    }

    pub async fn read_dir(
        &self,
        adapter: &str,
        path: &str,
    ) -> Result<Vec<FileEntry>, ConnectionError> {
        let value = self
            .call_value("readDir", vec![json!(adapter), json!(path)])
            .await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        parse("readDir", value)
    }

    /// Read a file as text (`readFile`) or, with `base64`, as bytes
    /// (`readFile64`).
    pub async fn read_file(
        &self,
        adapter: &str,
        file_name: &str,
        base64: bool,
    ) -> Result<FileContent, ConnectionError> {
        if base64 {
            let data = self
                .call_value(
                    "readFile64",
                    vec![json!(adapter), json!(file_name), json!(true)],
                )
                .await?;
            return decode_file64(data);
        }

        let mut reply = self
            .call("readFile", vec![json!(adapter), json!(file_name)])
            .await?
            .into_iter();
        let err = reply.next().unwrap_or(Value::Null);
        if is_truthy(&err) {
            return Err(ConnectionError::from_server(&err));
        }
        let data = match reply.next().unwrap_or(Value::Null) {
            Value::String(text) => FileData::Text(text),
            Value::Null => FileData::Text(String::new()),
            other => FileData::Text(other.to_string()),
        };
        let mime_type = reply.next().and_then(|t| t.as_str().map(str::to_owned));
        Ok(FileContent { data, mime_type })
    }

    /// Write a file. Text goes through `writeFile`; bytes are base64
    /// encoded and go through `writeFile64`.
    pub async fn write_file64(
        &self,
        adapter: &str,
        file_name: &str,
        data: &FileData,
    ) -> Result<(), ConnectionError> {
        match data {
            FileData::Text(text) => {
                self.call_unit(
                    "writeFile",
                    vec![json!(adapter), json!(file_name), json!(text)],
                )
                .await
            }
            FileData::Binary(_) => {
                self.call_unit(
                    "writeFile64",
                    vec![json!(adapter), json!(file_name), json!(data.to_base64())],
                )
                .await
            }
        }
    }

    pub async fn delete_file(&self, adapter: &str, file_name: &str) -> Result<(), ConnectionError> {
        self.call_unit("unlink", vec![json!(adapter), json!(file_name)])
            .await
    }

    /// Delete a folder with everything in it.
    pub async fn delete_folder(
        &self,
        adapter: &str,
        folder_name: &str,
    ) -> Result<(), ConnectionError> {
        self.call_unit("deleteFolder", vec![json!(adapter), json!(folder_name)])
            .await
    }

    pub async fn rename(
        &self,
        adapter: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<(), ConnectionError> {
        self.call_unit(
            "rename",
            vec![json!(adapter), json!(old_name), json!(new_name)],
        )
        .await
    }

    pub async fn rename_file(
        &self,
        adapter: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<(), ConnectionError> {
        self.call_unit(
            "renameFile",
            vec![json!(adapter), json!(old_name), json!(new_name)],
        )
        .await
    }

    pub async fn file_exists(&self, adapter: &str, file_name: &str) -> Result<bool, ConnectionError> {
        let exists = self
            .call_value("fileExists", vec![json!(adapter), json!(file_name)])
            .await?;
        Ok(exists.as_bool().unwrap_or(false))
    }

    /// Change file permissions, e.g. `{"mode": 0o644}`. Admin only.
    pub async fn chmod_file(
        &self,
        adapter: &str,
        file_name: &str,
        options: Value,
    ) -> Result<FileAclChange, ConnectionError> {
        self.file_acl("chmodFile", adapter, file_name, options).await
    }

    /// Change owner and/or owner group, e.g. `{"owner": "system.user.admin"}`.
    /// Admin only.
    pub async fn chown_file(
        &self,
        adapter: &str,
        file_name: &str,
        options: Value,
    ) -> Result<FileAclChange, ConnectionError> {
        self.file_acl("chownFile", adapter, file_name, options).await
    }

    async fn file_acl(
        &self,
        name: &str,
        adapter: &str,
        file_name: &str,
        options: Value,
    ) -> Result<FileAclChange, ConnectionError> {
        self.ensure_admin(name)?;
        let mut reply = self
            .call(name, vec![json!(adapter), json!(file_name), options])
            .await?
            .into_iter();
        let err = reply.next().unwrap_or(Value::Null);
        if is_truthy(&err) {
            return Err(ConnectionError::from_server(&err));
        }
        let entries = match reply.next() {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        };
        let id = reply.next().and_then(|id| id.as_str().map(str::to_owned));
        Ok(FileAclChange { entries, id })
    }
}

fn decode_file64(data: Value) -> Result<FileContent, ConnectionError> {
    match data {
        Value::String(encoded) => Ok(FileContent {
            data: FileData::from_base64(&encoded)
                .map_err(|e| ConnectionError::invalid_response("readFile64", e))?,
            mime_type: None,
        }),
        // Some servers answer `{ file, mimeType }`.
        Value::Object(mut map) => {
            let mime_type = map
                .remove("mimeType")
                .and_then(|t| t.as_str().map(str::to_owned));
            let encoded = map
                .remove("file")
                .and_then(|f| f.as_str().map(str::to_owned))
                .unwrap_or_default();
            let data = FileData::from_base64(&encoded)
                .map_err(|e| ConnectionError::invalid_response("readFile64", e))?;
            Ok(FileContent { data, mime_type })
        }
        other => Err(ConnectionError::invalid_response(
            "readFile64",
            format!("expected base64 text, got {other}"),
        )),
    }
}
