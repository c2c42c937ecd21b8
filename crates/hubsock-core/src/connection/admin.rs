// ── Admin-only operations ──
//
// Adapter and instance listings, hosts, users, groups, certificates,
// host commands (logs, info, repository, installed list, base settings,
// diagnostics, notifications) and credentials. Everything here except
// instance and group listings is refused in web mode before any I/O.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info};

use super::objects::RANGE_END;
use super::{Connection, parse, reply_value};
use crate::error::ConnectionError;
use crate::model::admin::{host_ip_entries, host_object_id};
use crate::model::object::is_truthy;
use crate::model::{Certificate, IoObject, IpAddressEntry, fix_admin_ui};

/// Feature flag the controller reports when it can read and write its
/// base settings remotely.
const BASE_SETTINGS_FEATURE: &str = "CONTROLLER_READWRITE_BASE_SETTINGS";

const DEFAULT_LOG_LINES: u32 = 200;

impl Connection {
    // ── Adapters and instances ───────────────────────────────────────

    /// Instances of `adapter` (all instances when `None`).
    ///
    /// Servers that do not answer `getAdapterInstances` in time are
    /// queried through the `instance` object view instead.
    pub async fn get_adapter_instances(
        &self,
        adapter: Option<&str>,
        force: bool,
    ) -> Result<Vec<IoObject>, ConnectionError> {
        let adapter = adapter.unwrap_or_default().to_owned();
        let key = format!("instances_{adapter}");
        let value = self
            .memoized(&key, force, move |conn| async move {
                conn.ensure_connected()?;
                let prefix = if adapter.is_empty() {
                    "system.adapter.".to_owned()
                } else {
                    format!("system.adapter.{adapter}.")
                };
                conn.listing_with_fallback("getAdapterInstances", &adapter, "instance", &prefix)
                    .await
            })
            .await?;
        adapter_objects("getAdapterInstances", value)
    }

    /// Adapter objects for `adapter` (all adapters when `None`).
    pub async fn get_adapters(
        &self,
        adapter: Option<&str>,
        force: bool,
    ) -> Result<Vec<IoObject>, ConnectionError> {
        self.ensure_admin("getAdapters")?;
        let adapter = adapter.unwrap_or_default().to_owned();
        let key = format!("adapter_{adapter}");
        let value = self
            .memoized(&key, force, move |conn| async move {
                conn.ensure_connected()?;
                let prefix = if adapter.is_empty() {
                    "system.adapter.".to_owned()
                } else {
                    format!("system.adapter.{adapter}.")
                };
                conn.listing_with_fallback("getAdapters", &adapter, "adapter", &prefix)
                    .await
            })
            .await?;
        adapter_objects("getAdapters", value)
    }

    /// Ask for a listing and fall back to an object-view range query if
    /// no answer arrives within `list_fallback_after`.
    async fn listing_with_fallback(
        &self,
        command: &str,
        adapter: &str,
        view_type: &str,
        prefix: &str,
    ) -> Result<Value, ConnectionError> {
        let reply = self
            .inner
            .transport
            .emit_with_ack(command, vec![json!(adapter)]);
        match tokio::time::timeout(self.inner.config.list_fallback_after, reply).await {
            Ok(Ok(args)) => reply_value(args),
            Ok(Err(_)) => Err(ConnectionError::NotConnected),
            Err(_) => {
                debug!(command, view_type, "no answer, querying object view");
                let end = format!("{prefix}{RANGE_END}");
                let rows = self.object_view("system", view_type, prefix, &end).await?;
                Ok(Value::Array(rows.into_iter().map(|(_, obj)| obj).collect()))
            }
        }
    }

    pub async fn get_compact_adapters(&self, force: bool) -> Result<Value, ConnectionError> {
        self.ensure_admin("getCompactAdapters")?;
        self.memoized("compactAdapters", force, |conn| async move {
            conn.call_value("getCompactAdapters", Vec::new()).await
        })
        .await
    }

    pub async fn get_compact_instances(&self, force: bool) -> Result<Value, ConnectionError> {
        self.ensure_admin("getCompactInstances")?;
        self.memoized("compactInstances", force, |conn| async move {
            conn.call_value("getCompactInstances", Vec::new()).await
        })
        .await
    }

    /// Forget cached adapter listings.
    pub fn reset_adapters_cache(&self, adapter: Option<&str>) {
        self.inner.memo.remove("compactAdapters");
        self.inner
            .memo
            .remove(&format!("adapter_{}", adapter.unwrap_or_default()));
    }

    /// Forget cached instance listings.
    pub fn reset_instances_cache(&self, adapter: Option<&str>) {
        self.inner.memo.remove("compactInstances");
        self.inner
            .memo
            .remove(&format!("instances_{}", adapter.unwrap_or_default()));
    }

    /// Forget the cached installed-adapter lists of `host`.
    pub fn reset_installed_cache(&self, host: &str) {
        let host = host_object_id(host);
        self.inner.memo.remove(&format!("installedCompact_{host}"));
        self.inner.memo.remove(&format!("installed_{host}"));
    }

    /// Forget the cached repository listings.
    pub fn reset_repository_cache(&self) {
        self.inner.memo.remove("repoCompact");
        self.inner.memo.remove("repo");
    }

    // ── Hosts, users, groups ─────────────────────────────────────────

    pub async fn get_hosts(&self, force: bool) -> Result<Vec<IoObject>, ConnectionError> {
        self.ensure_admin("getHosts")?;
        self.system_listing("hosts", "host", force).await
    }

    pub async fn get_users(&self, force: bool) -> Result<Vec<IoObject>, ConnectionError> {
        self.ensure_admin("getUsers")?;
        self.system_listing("users", "user", force).await
    }

    pub async fn get_groups(&self, force: bool) -> Result<Vec<IoObject>, ConnectionError> {
        self.system_listing("groups", "group", force).await
    }

    pub async fn get_compact_hosts(&self, force: bool) -> Result<Value, ConnectionError> {
        self.ensure_admin("getCompactHosts")?;
        self.memoized("hostsCompact", force, |conn| async move {
            conn.call_value("getCompactHosts", Vec::new()).await
        })
        .await
    }

    /// Memoized `system.<kind>.*` object-view listing.
    async fn system_listing(
        &self,
        key: &str,
        kind: &'static str,
        force: bool,
    ) -> Result<Vec<IoObject>, ConnectionError> {
        let value = self
            .memoized(key, force, move |conn| async move {
                conn.ensure_connected()?;
                let start = format!("system.{kind}.");
                let end = format!("system.{kind}.{RANGE_END}");
                let rows = conn.object_view("system", kind, &start, &end).await?;
                Ok(Value::Array(rows.into_iter().map(|(_, obj)| obj).collect()))
            })
            .await?;
        parse("getObjectView", value)
    }

    /// Move group `id` (and every sub-group below it) to `new_id`,
    /// optionally renaming it.
    pub async fn rename_group(
        &self,
        id: &str,
        new_id: &str,
        new_name: Option<Value>,
    ) -> Result<(), ConnectionError> {
        self.ensure_admin("renameGroup")?;
        let groups = self.get_groups(true).await?;
        let prefix = format!("{id}.");

        for group in groups.iter().filter(|g| g.id.starts_with(&prefix)) {
            let old_id = group.id.clone();
            let mut moved = group.clone();
            moved.id = format!("{new_id}{}", &old_id[id.len()..]);
            self.set_object(&moved.id, &moved).await?;
            self.del_object(&old_id, false).await?;
        }

        if let Some(group) = groups.iter().find(|g| g.id == id) {
            let mut moved = group.clone();
            new_id.clone_into(&mut moved.id);
            if let Some(name) = new_name {
                moved.fill_sections();
                if let Some(common) = moved.common.as_object_mut() {
                    common.insert("name".into(), name);
                }
            }
            self.set_object(new_id, &moved).await?;
            self.del_object(id, false).await?;
        }
        info!(from = id, to = new_id, "group renamed");
        Ok(())
    }

    // ── Certificates ─────────────────────────────────────────────────

    /// Certificates stored in `system.certificates`, classified as
    /// public, private or chained.
    pub async fn get_certificates(&self, force: bool) -> Result<Vec<Certificate>, ConnectionError> {
        self.ensure_admin("getCertificates")?;
        let value = self
            .memoized("cert", force, |conn| async move {
                conn.ensure_connected()?;
                let obj = conn.get_object("system.certificates").await?;
                let certs: Vec<Certificate> = obj
                    .as_ref()
                    .and_then(|obj| obj.native.get("certificates"))
                    .and_then(Value::as_object)
                    .into_iter()
                    .flatten()
                    .filter(|(_, cert)| is_truthy(cert))
                    .map(|(name, cert)| {
                        let text = cert.as_str().map_or_else(|| cert.to_string(), str::to_owned);
                        Certificate::classify(name, &text)
                    })
                    .collect();
                serde_json::to_value(certs)
                    .map_err(|e| ConnectionError::invalid_response("getCertificates", e))
            })
            .await?;
        parse("getCertificates", value)
    }

    // ── Host commands ────────────────────────────────────────────────

    /// Last `lines` lines of the host log (200 when `None`).
    pub async fn get_logs(&self, host: &str, lines: Option<u32>) -> Result<Value, ConnectionError> {
        self.ensure_admin("getLogs")?;
        let reply = self
            .call(
                "sendToHost",
                vec![
                    json!(host),
                    json!("getLogs"),
                    json!(lines.unwrap_or(DEFAULT_LOG_LINES)),
                ],
            )
            .await?;
        Ok(reply.into_iter().next().unwrap_or(Value::Null))
    }

    pub async fn get_logs_files(&self, host: &str) -> Result<Value, ConnectionError> {
        self.ensure_admin("readLogs")?;
        self.call_value("readLogs", vec![json!(host)]).await
    }

    pub async fn del_logs(&self, host: &str) -> Result<(), ConnectionError> {
        self.ensure_admin("delLogs")?;
        self.call_unit("sendToHost", vec![json!(host), json!("delLogs"), Value::Null])
            .await
    }

    /// Full host information, bounded by `timeout` (or `cmd_timeout`).
    pub async fn get_host_info(
        &self,
        host: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<Value, ConnectionError> {
        self.host_query("getHostInfo", "hostInfo", host, force, timeout)
            .await
    }

    /// Reduced host information.
    pub async fn get_host_info_short(
        &self,
        host: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<Value, ConnectionError> {
        self.host_query("getHostInfoShort", "hostInfoShort", host, force, timeout)
            .await
    }

    async fn host_query(
        &self,
        command: &'static str,
        key_prefix: &str,
        host: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<Value, ConnectionError> {
        self.ensure_admin(command)?;
        let host = host_object_id(host);
        let key = format!("{key_prefix}{host}");
        self.memoized(&key, force, move |conn| async move {
            conn.call_host(
                "sendToHost",
                vec![json!(host), json!(command), Value::Null],
                command,
                timeout,
            )
            .await
        })
        .await
    }

    /// Adapter repository as seen by `host`.
    pub async fn get_repository(
        &self,
        host: &str,
        args: Value,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<Value, ConnectionError> {
        self.ensure_admin("getRepository")?;
        let host = host_object_id(host);
        self.memoized("repo", force, move |conn| async move {
            conn.call_host(
                "sendToHost",
                vec![json!(host), json!("getRepository"), args],
                "getRepository",
                timeout,
            )
            .await
        })
        .await
    }

    /// Adapters installed on `host`.
    pub async fn get_installed(
        &self,
        host: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<Value, ConnectionError> {
        self.ensure_admin("getInstalled")?;
        let host = host_object_id(host);
        let key = format!("installed_{host}");
        self.memoized(&key, force, move |conn| async move {
            conn.call_host(
                "sendToHost",
                vec![json!(host), json!("getInstalled"), Value::Null],
                "getInstalled",
                timeout,
            )
            .await
        })
        .await
    }

    /// Installed adapter versions only.
    pub async fn get_compact_installed(
        &self,
        host: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<Value, ConnectionError> {
        self.ensure_admin("getCompactInstalled")?;
        let host = host_object_id(host);
        let key = format!("installedCompact_{host}");
        self.memoized(&key, force, move |conn| async move {
            conn.call_host(
                "getCompactInstalled",
                vec![json!(host)],
                "getCompactInstalled",
                timeout,
            )
            .await
        })
        .await
    }

    /// Configured repositories. Always fetched fresh.
    pub async fn get_compact_system_repositories(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Value, ConnectionError> {
        self.ensure_admin("getCompactSystemRepositories")?;
        self.call_host(
            "getCompactSystemRepositories",
            Vec::new(),
            "getCompactSystemRepositories",
            timeout,
        )
        .await
    }

    pub async fn get_compact_repository(
        &self,
        host: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<Value, ConnectionError> {
        self.ensure_admin("getCompactRepository")?;
        let host = host_object_id(host);
        self.memoized("repoCompact", force, move |conn| async move {
            conn.call_host(
                "getCompactRepository",
                vec![json!(host)],
                "getCompactRepository",
                timeout,
            )
            .await
        })
        .await
    }

    /// Run a shell command on `host`. Output arrives through the cmd
    /// stdout/stderr/exit handlers tagged with `cmd_id`. Without a
    /// timeout the request is bounded by `io_timeout` only.
    pub async fn cmd_exec(
        &self,
        host: &str,
        cmd: &str,
        cmd_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), ConnectionError> {
        self.ensure_admin("cmdExec")?;
        let args = vec![
            json!(host_object_id(host)),
            json!(cmd_id),
            json!(cmd),
            Value::Null,
        ];
        match timeout {
            Some(timeout) => {
                self.ensure_connected()?;
                let reply = self
                    .call_within("cmdExec", args, timeout)
                    .await?;
                reply_value(reply).map(drop)
            }
            None => self.call_unit("cmdExec", args).await,
        }
    }

    /// Controller base settings (`iobroker.json`-style document).
    pub async fn read_base_settings(&self, host: &str) -> Result<Value, ConnectionError> {
        self.ensure_admin("readBaseSettings")?;
        self.require_feature(BASE_SETTINGS_FEATURE).await?;
        let host = host.strip_prefix("system.host.").unwrap_or(host);
        self.call_host(
            "sendToHost",
            vec![json!(host), json!("readBaseSettings"), Value::Null],
            "BaseSettings",
            None,
        )
        .await
    }

    pub async fn write_base_settings(
        &self,
        host: &str,
        config: Value,
    ) -> Result<Value, ConnectionError> {
        self.ensure_admin("writeBaseSettings")?;
        self.require_feature(BASE_SETTINGS_FEATURE).await?;
        self.call_host(
            "sendToHost",
            vec![json!(host), json!("writeBaseSettings"), config],
            "BaseSettings",
            None,
        )
        .await
    }

    async fn require_feature(&self, feature: &str) -> Result<(), ConnectionError> {
        if self.check_feature_supported(feature, false).await? {
            Ok(())
        } else {
            Err(ConnectionError::NotSupported {
                feature: feature.to_owned(),
            })
        }
    }

    pub async fn restart_controller(&self, host: &str) -> Result<(), ConnectionError> {
        self.ensure_admin("restartController")?;
        info!(host, "restarting controller");
        self.call_unit(
            "sendToHost",
            vec![json!(host), json!("restartController"), Value::Null],
        )
        .await
    }

    /// Diagnostic data of `kind` (`"normal"`, `"extended"`, ...).
    pub async fn get_diag_data(&self, host: &str, kind: &str) -> Result<Value, ConnectionError> {
        self.ensure_admin("getDiagData")?;
        let reply = self
            .call("sendToHost", vec![json!(host), json!("getDiagData"), json!(kind)])
            .await?;
        Ok(reply.into_iter().next().unwrap_or(Value::Null))
    }

    pub async fn get_notifications(
        &self,
        host: &str,
        category: Option<&str>,
    ) -> Result<Value, ConnectionError> {
        self.notification_request("getNotifications", host, category)
            .await
    }

    pub async fn clear_notifications(
        &self,
        host: &str,
        category: Option<&str>,
    ) -> Result<Value, ConnectionError> {
        self.notification_request("clearNotifications", host, category)
            .await
    }

    async fn notification_request(
        &self,
        command: &str,
        host: &str,
        category: Option<&str>,
    ) -> Result<Value, ConnectionError> {
        self.ensure_admin(command)?;
        let reply = self
            .call(
                "sendToHost",
                vec![json!(host), json!(command), json!({ "category": category })],
            )
            .await?;
        Ok(reply.into_iter().next().unwrap_or(Value::Null))
    }

    // ── Settings and misc ────────────────────────────────────────────

    pub async fn get_is_easy_mode_strict(&self) -> Result<bool, ConnectionError> {
        self.ensure_admin("getIsEasyModeStrict")?;
        let strict = self.call_value("getIsEasyModeStrict", Vec::new()).await?;
        Ok(is_truthy(&strict))
    }

    pub async fn get_easy_mode(&self) -> Result<Value, ConnectionError> {
        self.ensure_admin("getEasyMode")?;
        self.call_value("getEasyMode", Vec::new()).await
    }

    /// Adapter ratings; `force` asks the server to refresh them.
    pub async fn get_ratings(&self, force: bool) -> Result<Value, ConnectionError> {
        self.ensure_admin("getRatings")?;
        self.call_value("getRatings", vec![json!(force)]).await
    }

    /// Addresses recorded in the host object's `common.address`.
    pub async fn get_ip_addresses(
        &self,
        host: &str,
        force: bool,
    ) -> Result<Vec<String>, ConnectionError> {
        self.ensure_admin("getIpAddresses")?;
        let host = host_object_id(host);
        let key = format!("IPs_{host}");
        let value = self
            .memoized(&key, force, move |conn| async move {
                let obj = conn.get_object(&host).await?;
                Ok(obj
                    .and_then(|obj| obj.common.get("address").cloned())
                    .filter(Value::is_array)
                    .unwrap_or_else(|| json!([])))
            })
            .await?;
        parse("getIpAddresses", value)
    }

    /// Listen addresses of the host that owns `ip_or_host`, IPv4 first.
    pub async fn get_host_by_ip(
        &self,
        ip_or_host: &str,
        force: bool,
    ) -> Result<Vec<IpAddressEntry>, ConnectionError> {
        self.ensure_admin("getHostByIp")?;
        let target = ip_or_host
            .strip_prefix("system.host.")
            .unwrap_or(ip_or_host)
            .to_owned();
        let key = format!("rIPs_{target}");
        let value = self
            .memoized(&key, force, move |conn| async move {
                let reply = conn.call("getHostByIp", vec![json!(target)]).await?;
                let host = reply.into_iter().nth(1).unwrap_or(Value::Null);
                serde_json::to_value(host_ip_entries(&host))
                    .map_err(|e| ConnectionError::invalid_response("getHostByIp", e))
            })
            .await?;
        parse("getHostByIp", value)
    }

    // ── Credentials ──────────────────────────────────────────────────

    pub async fn encrypt(&self, text: &str) -> Result<String, ConnectionError> {
        self.ensure_admin("encrypt")?;
        let value = self.call_value("encrypt", vec![json!(text)]).await?;
        parse("encrypt", value)
    }

    pub async fn decrypt(&self, encrypted: &str) -> Result<String, ConnectionError> {
        self.ensure_admin("decrypt")?;
        let value = self.call_value("decrypt", vec![json!(encrypted)]).await?;
        parse("decrypt", value)
    }

    pub async fn change_password(&self, user: &str, password: &str) -> Result<(), ConnectionError> {
        self.ensure_admin("changePassword")?;
        self.call_unit("changePassword", vec![json!(user), json!(password)])
            .await
    }
}

/// Adapter/instance listings: arrays or `{id: obj}` maps, normalized to a
/// list with `common.adminUI` filled in.
fn adapter_objects(operation: &str, value: Value) -> Result<Vec<IoObject>, ConnectionError> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(map) => map.into_iter().map(|(_, obj)| obj).collect(),
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter(|item| !item.is_null())
        .map(|item| {
            let mut obj: IoObject = parse(operation, item)?;
            fix_admin_ui(&mut obj);
            Ok(obj)
        })
        .collect()
}
