// ── File storage types ──

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of a `readDir` listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file: String,
    #[serde(rename = "isDir", default)]
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub stats: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<i64>,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub acl: Value,
}

/// File payload for reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileData {
    Text(String),
    Binary(Vec<u8>),
}

impl FileData {
    pub(crate) fn to_base64(&self) -> String {
        match self {
            Self::Text(text) => STANDARD.encode(text.as_bytes()),
            Self::Binary(bytes) => STANDARD.encode(bytes),
        }
    }

    pub(crate) fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        STANDARD.decode(encoded.trim()).map(Self::Binary)
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// A file read back from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub data: FileData,
    pub mime_type: Option<String>,
}

/// Outcome of `chmodFile` / `chownFile`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAclChange {
    #[serde(default)]
    pub entries: Vec<Value>,
    #[serde(default)]
    pub id: Option<String>,
}
