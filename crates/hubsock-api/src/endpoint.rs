// ── Endpoint derivation ──
//
// The admin UI is served from the same origin as the socket, so the
// socket URL is computed from where the page was loaded plus a couple
// of markers set by the hosting adapter. Web adapters (vis, material,
// ...) live one directory deeper than the socket root and may point at
// a socket on another host/port entirely.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Development server port; maps to the real socket port.
const DEV_SERVER_PORT: u16 = 3000;
const DEV_WEB_PORT: u16 = 8082;
const DEV_ADMIN_PORT: u16 = 8081;

/// Hosted cloud front-ends serve the socket at the root.
const CLOUD_HOSTS: &[&str] = &["iobroker.net", "iobroker.pro"];

static VERSION_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+\.\d+").expect("static regex"));

/// Where the hosting page was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLocation {
    /// `http`, `https`, or either with a trailing colon.
    pub protocol: String,
    pub hostname: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "root_path")]
    pub pathname: String,
}

fn root_path() -> String {
    "/".into()
}

/// Markers the hosting adapter leaves for the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMarkers {
    /// Name of the adapter serving the page (`admin`, `vis-2`, ...).
    #[serde(default)]
    pub adapter_name: Option<String>,
    /// Explicit socket location: `host`, `host:port` or `proto://host:port`.
    #[serde(default)]
    pub socket_url: Option<String>,
}

/// Which surface the client is embedded in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Full administration UI; every operation is allowed.
    #[default]
    Admin,
    /// Restricted web adapter; admin-only operations are refused.
    Web,
}

impl HostMarkers {
    /// Web adapters identify themselves by name or by pointing at a
    /// foreign socket.
    pub fn deployment_mode(&self) -> DeploymentMode {
        let web_adapter = self.adapter_name.as_deref().is_some_and(|name| {
            matches!(name, "material" | "vis" | "echarts-show") || name.starts_with("vis-")
        });
        if web_adapter || self.socket_url.is_some() {
            DeploymentMode::Web
        } else {
            DeploymentMode::Admin
        }
    }
}

/// Computed socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: String,
    pub host: String,
    pub port: Option<u16>,
    /// Directory the socket is served from, always ends with `/` unless empty.
    pub path: String,
    pub mode: DeploymentMode,
}

impl Endpoint {
    /// Derive the endpoint for a page loaded at `location`.
    pub fn derive(location: &HostLocation, markers: &HostMarkers) -> Result<Self, Error> {
        let mode = markers.deployment_mode();

        let mut protocol = location.protocol.trim_end_matches(':').to_owned();
        let mut host = location.hostname.clone();
        let mut port = match location.port {
            Some(DEV_SERVER_PORT) => Some(match mode {
                DeploymentMode::Web => DEV_WEB_PORT,
                DeploymentMode::Admin => DEV_ADMIN_PORT,
            }),
            other => other,
        };

        let path = if CLOUD_HOSTS.contains(&location.hostname.as_str()) {
            String::new()
        } else {
            if let Some(socket_url) = markers.socket_url.as_deref() {
                let rest = match socket_url.split_once("://") {
                    Some((proto, rest)) => {
                        protocol = proto.to_owned();
                        rest
                    }
                    None => socket_url,
                };
                let (socket_host, socket_port) = match rest.split_once(':') {
                    Some((h, p)) => (h, Some(p)),
                    None => (rest, None),
                };
                if !socket_host.is_empty() {
                    host = socket_host.to_owned();
                }
                if let Some(p) = socket_port.filter(|p| !p.is_empty()) {
                    port = Some(p.trim_end_matches('/').parse().map_err(|_| {
                        Error::InvalidUrl(url::ParseError::InvalidPort)
                    })?);
                }
            }

            let dir = match location.pathname.rfind('/') {
                Some(pos) => &location.pathname[..=pos],
                None => location.pathname.as_str(),
            };
            match mode {
                DeploymentMode::Web => strip_web_level(dir),
                DeploymentMode::Admin => dir.to_owned(),
            }
        };

        let endpoint = Self {
            protocol,
            host,
            port,
            path,
            mode,
        };
        // Reject anything that cannot become a URL up front.
        endpoint.base_url()?;
        Ok(endpoint)
    }

    /// `protocol://host[:port]path`, as used for HTTP requests.
    pub fn base_url(&self) -> Result<Url, Error> {
        let authority = match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        };
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        Ok(Url::parse(&format!("{}://{authority}{path}", self.protocol))?)
    }

    /// WebSocket URL for this endpoint with the session id and client
    /// name the server expects in the query string.
    pub fn websocket_url(&self, sid: u64, client_name: Option<&str>) -> Result<Url, Error> {
        let mut url = self.base_url()?;
        let scheme = if self.protocol == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| Error::InvalidUrl(url::ParseError::RelativeUrlWithoutBase))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sid", &sid.to_string());
            if let Some(name) = client_name {
                query.append_pair("name", name);
            }
        }
        Ok(url)
    }

    /// Socket path below the endpoint directory.
    pub fn socket_path(&self) -> String {
        if self.path.ends_with('/') {
            format!("{}socket.io", self.path)
        } else {
            format!("{}/socket.io", self.path)
        }
    }

    /// URL of the HTTP session probe.
    pub fn session_url(&self) -> Result<Url, Error> {
        Ok(self.base_url()?.join("session")?)
    }
}

/// Drop the adapter's own directory (and a version directory below it).
fn strip_web_level(dir: &str) -> String {
    let mut parts: Vec<&str> = dir.split('/').collect();
    if parts.len() <= 2 {
        return dir.to_owned();
    }
    parts.pop();
    if parts.last().is_some_and(|last| VERSION_SEGMENT.is_match(last)) {
        parts.pop();
    }
    parts.pop();
    let mut path = parts.join("/");
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}
