//! Connection profiles for hubsock clients.
//!
//! TOML profiles merged with `HUBSOCK_*` environment overrides, and their
//! translation to `hubsock_core::ConnectionConfig` plus the socket
//! `Endpoint` to dial.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hubsock_api::{DeploymentMode, Endpoint, TlsMode};
use hubsock_core::ConnectionConfig;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no profile named '{profile}'")]
    UnknownProfile { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named explicitly.
    pub default_profile: Option<String>,

    /// Values a profile falls back to.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named server profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// Socket request timeout in seconds.
    #[serde(default = "default_io_timeout")]
    pub io_timeout: u64,

    /// Host command timeout in seconds.
    #[serde(default = "default_cmd_timeout")]
    pub cmd_timeout: u64,

    #[serde(default)]
    pub insecure: bool,

    /// Fallback UI locale (e.g. `de-DE`).
    pub locale: Option<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            io_timeout: default_io_timeout(),
            cmd_timeout: default_cmd_timeout(),
            insecure: false,
            locale: None,
        }
    }
}

fn default_io_timeout() -> u64 {
    20
}
fn default_cmd_timeout() -> u64 {
    5
}

/// A named server profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Profile {
    /// Page URL the socket is served from (e.g. `http://192.168.1.5:8081/`).
    pub url: String,

    /// `admin` or `web`.
    #[serde(default)]
    pub mode: DeploymentMode,

    /// Client name announced to the server.
    pub name: Option<String>,

    #[serde(default)]
    pub load_all_objects: bool,

    #[serde(default)]
    pub load_acl: bool,

    #[serde(default)]
    pub admin5only: bool,

    /// Object patterns subscribed on every connect.
    #[serde(default)]
    pub auto_subscribes: Vec<String>,

    #[serde(default)]
    pub auto_subscribe_log: bool,

    /// Path to a custom CA certificate for the session probe.
    pub ca_cert: Option<PathBuf>,

    /// Override the default TLS setting.
    pub insecure: Option<bool>,

    /// Override the default socket timeout (seconds).
    pub io_timeout: Option<u64>,

    /// Override the default host command timeout (seconds).
    pub cmd_timeout: Option<u64>,

    /// Override the default locale.
    pub locale: Option<String>,
}

impl Config {
    /// Look up `name`, or the default profile when `None`.
    pub fn profile<'a>(
        &'a self,
        name: Option<&'a str>,
    ) -> Result<(&'a str, &'a Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get_key_value(name)
            .map(|(name, profile)| (name.as_str(), profile))
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: name.to_owned(),
            })
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "hubsock", "hubsock").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("hubsock");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + environment. Nested keys are separated by `__`
/// (`HUBSOCK_DEFAULTS__IO_TIMEOUT=30`).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HUBSOCK_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

/// Socket endpoint for a profile's page URL.
pub fn profile_endpoint(profile: &Profile) -> Result<Endpoint, ConfigError> {
    let url: url::Url = profile.url.parse().map_err(|_| ConfigError::Validation {
        field: "url".into(),
        reason: format!("invalid URL: {}", profile.url),
    })?;
    let host = url.host_str().ok_or_else(|| ConfigError::Validation {
        field: "url".into(),
        reason: format!("URL has no host: {}", profile.url),
    })?;

    // The page path names a directory; a trailing file name is dropped.
    let path = match url.path().rfind('/') {
        Some(pos) => url.path()[..=pos].to_owned(),
        None => "/".to_owned(),
    };

    Ok(Endpoint {
        protocol: url.scheme().to_owned(),
        host: host.to_owned(),
        port: url.port(),
        path,
        mode: profile.mode,
    })
}

/// Build a `ConnectionConfig` from a profile, falling back to `defaults`
/// for anything the profile leaves unset.
pub fn profile_to_connection_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<ConnectionConfig, ConfigError> {
    let endpoint = profile_endpoint(profile)?;
    let session_url = endpoint.session_url().map_err(|e| ConfigError::Validation {
        field: "url".into(),
        reason: e.to_string(),
    })?;

    let tls = if profile.insecure.unwrap_or(defaults.insecure) {
        TlsMode::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsMode::CustomCa(ca_path.clone())
    } else {
        TlsMode::System
    };

    Ok(ConnectionConfig {
        name: profile.name.clone(),
        mode: profile.mode,
        io_timeout: Duration::from_secs(profile.io_timeout.unwrap_or(defaults.io_timeout)),
        cmd_timeout: Duration::from_secs(profile.cmd_timeout.unwrap_or(defaults.cmd_timeout)),
        load_all_objects: profile.load_all_objects,
        load_acl: profile.load_acl,
        admin5only: profile.admin5only,
        auto_subscribes: profile.auto_subscribes.clone(),
        auto_subscribe_log: profile.auto_subscribe_log,
        fallback_locale: profile.locale.clone().or_else(|| defaults.locale.clone()),
        session_url: Some(session_url),
        tls,
        ..ConnectionConfig::default()
    }
    .normalized())
}
