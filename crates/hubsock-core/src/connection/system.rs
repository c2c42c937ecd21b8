// ── Server and system queries ──
//
// Version, identity and system configuration reads, feature probing,
// host messages, logout and the HTTP session probe.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use hubsock_api::{HttpConfig, SessionProbe};

use super::{Connection, parse, reply_value};
use crate::error::ConnectionError;
use crate::model::object::is_truthy;
use crate::model::{IoObject, VersionInfo};

const SYSTEM_CONFIG_ID: &str = "system.config";
const DEFAULT_SERVER_NAME: &str = "socketio";
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Old servers answer `getVersion` with the version in the error slot.
static VERSION_IN_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+").expect("valid version pattern"));

impl Connection {
    /// Server version and name. Used during the handshake, so it does not
    /// wait for authentication to complete.
    pub async fn get_version(&self, force: bool) -> Result<VersionInfo, ConnectionError> {
        let value = self
            .memoized("version", force, |conn| async move {
                let timeout = conn.inner.config.io_timeout;
                let reply = conn.call_within("getVersion", Vec::new(), timeout).await?;
                version_reply(reply)
            })
            .await?;
        parse("getVersion", value)
    }

    /// Name of the adapter serving this connection (e.g. `admin`).
    pub async fn get_web_server_name(&self, force: bool) -> Result<String, ConnectionError> {
        let value = self
            .memoized("webName", force, |conn| async move {
                conn.call_value("getAdapterName", Vec::new()).await
            })
            .await?;
        parse("getAdapterName", value)
    }

    /// Logged-in user, e.g. `system.user.admin`.
    pub async fn get_current_user(&self) -> Result<String, ConnectionError> {
        let reply = self.call("authEnabled", Vec::new()).await?;
        Ok(reply
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned())
    }

    /// Namespace of the serving instance, e.g. `admin.0`.
    pub async fn get_current_instance(&self, force: bool) -> Result<String, ConnectionError> {
        let value = self
            .memoized("currentInstance", force, |conn| async move {
                conn.call_value("getCurrentInstance", Vec::new()).await
            })
            .await?;
        parse("getCurrentInstance", value)
    }

    /// Installation UUID from `system.meta.uuid`.
    pub async fn get_uuid(&self, force: bool) -> Result<Option<String>, ConnectionError> {
        let value = self
            .memoized("uuid", force, |conn| async move {
                let obj = conn.get_object("system.meta.uuid").await?;
                Ok(obj
                    .and_then(|obj| obj.native.get("uuid").cloned())
                    .unwrap_or(Value::Null))
            })
            .await?;
        Ok(value.as_str().map(str::to_owned))
    }

    // ── System configuration ─────────────────────────────────────────

    /// `system.config`. A missing document yields an empty one with
    /// `common` and `native` present.
    pub async fn get_system_config(&self, force: bool) -> Result<IoObject, ConnectionError> {
        let value = self
            .memoized("systemConfig", force, |conn| async move {
                let mut obj = conn
                    .get_object(SYSTEM_CONFIG_ID)
                    .await?
                    .unwrap_or_else(|| IoObject::new(SYSTEM_CONFIG_ID, "config"));
                obj.fill_sections();
                serde_json::to_value(obj)
                    .map_err(|e| ConnectionError::invalid_response("getObject", e))
            })
            .await?;
        parse("getObject", value)
    }

    /// Store `system.config` and refresh the memoized copy.
    pub async fn set_system_config(&self, obj: &IoObject) -> Result<(), ConnectionError> {
        self.set_object(SYSTEM_CONFIG_ID, obj).await?;
        let mut cached = obj.clone();
        cached.fill_sections();
        let value = serde_json::to_value(cached).map_err(|e| ConnectionError::InvalidArgument {
            message: e.to_string(),
        })?;
        self.inner.memo.put("systemConfig", value);
        Ok(())
    }

    /// Reduced system config (`common` only).
    pub async fn get_compact_system_config(&self, force: bool) -> Result<Value, ConnectionError> {
        self.memoized("systemConfigCommon", force, |conn| async move {
            conn.call_value("getCompactSystemConfig", Vec::new()).await
        })
        .await
    }

    /// Whether the controller supports `feature`.
    pub async fn check_feature_supported(
        &self,
        feature: &str,
        force: bool,
    ) -> Result<bool, ConnectionError> {
        let key = format!("supportedFeatures_{feature}");
        let feature = feature.to_owned();
        let value = self
            .memoized(&key, force, move |conn| async move {
                conn.call_value("checkFeatureSupported", vec![json!(feature)])
                    .await
            })
            .await?;
        Ok(is_truthy(&value))
    }

    // ── Messages and session ─────────────────────────────────────────

    /// Send `command` to a host process and return its answer.
    pub async fn send_to_host(
        &self,
        host: &str,
        command: &str,
        message: Value,
    ) -> Result<Value, ConnectionError> {
        let reply = self
            .call("sendToHost", vec![json!(host), json!(command), message])
            .await?;
        Ok(reply.into_iter().next().unwrap_or(Value::Null))
    }

    pub async fn logout(&self) -> Result<(), ConnectionError> {
        debug!("logging out");
        self.call_unit("logout", Vec::new()).await
    }

    /// Fetch the HTTP session document (`./session`). The request is
    /// aborted after `timeout` (5s when `None`).
    pub async fn get_current_session(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Value, ConnectionError> {
        self.ensure_connected()?;
        let url = self
            .inner
            .config
            .session_url
            .clone()
            .ok_or_else(|| ConnectionError::InvalidArgument {
                message: "no session url configured".into(),
            })?;
        let http = HttpConfig {
            tls: self.inner.config.tls.clone(),
            ..HttpConfig::default()
        };
        let probe = SessionProbe::new(url, &http)?;
        let session = probe
            .current_session(timeout.unwrap_or(SESSION_TIMEOUT))
            .await?;
        Ok(session)
    }
}

/// `(err, version, serverName)`, where old servers put the version into
/// the error slot.
fn version_reply(reply: Vec<Value>) -> Result<Value, ConnectionError> {
    let mut args = reply.into_iter();
    let err = args.next().unwrap_or(Value::Null);
    let version = args.next().unwrap_or(Value::Null);
    let server_name = args
        .next()
        .and_then(|name| name.as_str().map(str::to_owned))
        .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_owned());

    if let Some(text) = err.as_str() {
        if version.is_null() && VERSION_IN_ERROR.is_match(text) {
            return Ok(json!({ "version": text, "serverName": DEFAULT_SERVER_NAME }));
        }
    }
    let version = reply_value(vec![err, version])?;
    Ok(json!({ "version": version.as_str().unwrap_or_default(), "serverName": server_name }))
}
