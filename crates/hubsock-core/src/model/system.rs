// ── Server and session descriptors ──

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Languages the admin UI ships translations for.
const SUPPORTED_LANGUAGES: &[&str] = &["en", "de", "ru", "pt", "nl", "fr", "it", "es", "pl", "uk"];

/// Server version as reported by `getVersion`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(rename = "serverName")]
    pub server_name: String,
}

impl VersionInfo {
    /// `major * 10000 + minor * 100 + patch`. Missing or non-numeric
    /// components count as zero; pre-release suffixes are ignored.
    pub fn numeric(&self) -> u32 {
        numeric_version(&self.version)
    }
}

pub(crate) fn numeric_version(version: &str) -> u32 {
    let mut parts = version.split('.').map(|part| {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        digits.parse::<u32>().unwrap_or(0)
    });
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    major
        .saturating_mul(10000)
        .saturating_add(minor.saturating_mul(100))
        .saturating_add(patch)
}

/// Unsolicited `permissionError` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionError {
    #[serde(default)]
    pub operation: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
}

impl PermissionError {
    /// Text shown when no dedicated permission hook is installed.
    pub fn describe(&self) -> String {
        match &self.id {
            Some(id) => format!("no permission for {} {} on {id}", self.operation, self.kind),
            None => format!("no permission for {} {}", self.operation, self.kind),
        }
    }
}

/// One line of the host log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub ts: i64,
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// Map a locale such as `de-AT` onto one of the supported UI languages.
pub fn normalize_language(locale: Option<&str>) -> String {
    let Some(locale) = locale.map(str::to_ascii_lowercase) else {
        return "en".into();
    };
    if locale.starts_with("zh") {
        return "zh-cn".into();
    }
    SUPPORTED_LANGUAGES
        .iter()
        .find(|lang| locale.starts_with(*lang))
        .map_or_else(|| "en".into(), |lang| (*lang).to_owned())
}
