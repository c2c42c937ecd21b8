// ── Runtime connection configuration ──
//
// Describes how the connection client behaves: timeouts, what to load
// on connect, retry policies and automatic subscriptions. Never touches
// disk; hubsock-config (or the embedding UI) builds one and hands it in.

use std::time::Duration;

use hubsock_api::{DeploymentMode, ReconnectConfig, TlsMode};
use url::Url;

/// Lower bound for the socket-level request timeout.
pub const MIN_IO_TIMEOUT: Duration = Duration::from_secs(20);
/// Lower bound for host command timeouts.
pub const MIN_CMD_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed-count retry with a base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub delay: Duration,
}

/// Configuration for a single [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Client name announced to the server.
    pub name: Option<String>,
    /// Admin or restricted web surface. Admin-only calls are refused in
    /// web mode before any I/O.
    pub mode: DeploymentMode,
    /// Socket-level timeout. Raised to at least 20s.
    pub io_timeout: Duration,
    /// Default deadline for host-targeted commands. Raised to at least 5s.
    pub cmd_timeout: Duration,
    /// Fetch the whole object tree before reporting ready.
    pub load_all_objects: bool,
    /// Fetch the user's permissions before the system config.
    pub load_acl: bool,
    /// Read the compact system config and start with an empty object set.
    pub admin5only: bool,
    /// Object patterns subscribed on every (re)connect.
    pub auto_subscribes: Vec<String>,
    /// Re-arm the log subscription on every (re)connect.
    pub auto_subscribe_log: bool,
    /// Servers at or above this version (`major*10000 + minor*100 + patch`)
    /// use the secure authenticate handshake; older ones skip it.
    pub secure_auth_since: u32,
    /// Delay before probing the server version after connect.
    pub version_probe_delay: Duration,
    /// Permission/config load after authentication.
    pub load_retry: RetryPolicy,
    /// Authenticate handshake; delay grows linearly per attempt.
    pub auth_retry: RetryPolicy,
    /// How long adapter/instance listings wait before falling back to an
    /// object-view query (servers without the dedicated command).
    pub list_fallback_after: Duration,
    /// Locale used when the system config carries no language.
    pub fallback_locale: Option<String>,
    /// WebSocket reconnection policy (used by [`Connection::open`](crate::Connection::open)).
    pub reconnect: ReconnectConfig,
    /// Keep-alive ping interval for the WebSocket transport.
    pub ping_interval: Duration,
    /// `./session` endpoint for [`Connection::get_current_session`](crate::Connection::get_current_session).
    pub session_url: Option<Url>,
    /// TLS verification for the HTTP session probe.
    pub tls: TlsMode,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: None,
            mode: DeploymentMode::Admin,
            io_timeout: MIN_IO_TIMEOUT,
            cmd_timeout: MIN_CMD_TIMEOUT,
            load_all_objects: false,
            load_acl: false,
            admin5only: false,
            auto_subscribes: Vec::new(),
            auto_subscribe_log: false,
            secure_auth_since: 40200,
            version_probe_delay: Duration::from_millis(500),
            load_retry: RetryPolicy {
                attempts: 10,
                delay: Duration::from_secs(1),
            },
            auth_retry: RetryPolicy {
                attempts: 3,
                delay: Duration::from_secs(1),
            },
            list_fallback_after: Duration::from_millis(1300),
            fallback_locale: None,
            reconnect: ReconnectConfig::default(),
            ping_interval: Duration::from_secs(5),
            session_url: None,
            tls: TlsMode::default(),
        }
    }
}

impl ConnectionConfig {
    /// Apply the lower bounds on timeouts and retry counts.
    pub fn normalized(mut self) -> Self {
        self.io_timeout = self.io_timeout.max(MIN_IO_TIMEOUT);
        self.cmd_timeout = self.cmd_timeout.max(MIN_CMD_TIMEOUT);
        self.load_retry.attempts = self.load_retry.attempts.max(1);
        self.auth_retry.attempts = self.auth_retry.attempts.max(1);
        self
    }

    pub fn is_web(&self) -> bool {
        self.mode == DeploymentMode::Web
    }
}
