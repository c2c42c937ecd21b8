// HTTP side channel: client construction and the session probe.
//
// The socket carries all data traffic; the only plain HTTP call the
// client makes is `GET ./session`, which reports the login session
// behind the page. It runs with its own deadline, independent of the
// socket's request timeouts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::Error;

/// TLS verification mode.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Use the system certificate store.
    #[default]
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (for self-signed installations).
    DangerAcceptInvalid,
}

/// Settings for building the HTTP client.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub tls: TlsMode,
    pub timeout: Duration,
    pub cookie_jar: Option<Arc<Jar>>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            timeout: Duration::from_secs(30),
            cookie_jar: None,
        }
    }
}

impl HttpConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("hubsock/", env!("CARGO_PKG_VERSION")));

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        if let Some(ref jar) = self.cookie_jar {
            builder = builder.cookie_provider(Arc::clone(jar));
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }

    /// Create a config with a fresh cookie jar (for session auth).
    pub fn with_cookie_jar(mut self) -> Self {
        self.cookie_jar = Some(Arc::new(Jar::default()));
        self
    }
}

/// Reads the current login session over HTTP.
#[derive(Debug, Clone)]
pub struct SessionProbe {
    http: reqwest::Client,
    url: Url,
}

impl SessionProbe {
    pub fn new(url: Url, config: &HttpConfig) -> Result<Self, Error> {
        Ok(Self {
            http: config.build_client()?,
            url,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// GET the session document, giving up after `deadline`.
    ///
    /// The in-flight request is dropped (aborted) when the deadline
    /// passes, so a late answer is never observed.
    pub async fn current_session(&self, deadline: Duration) -> Result<Value, Error> {
        debug!("GET {}", self.url);

        let fetch = async {
            let resp = self.http.get(self.url.clone()).send().await?;
            let resp = resp.error_for_status()?;
            let body = resp.text().await?;
            serde_json::from_str::<Value>(&body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body,
            })
        };

        tokio::time::timeout(deadline, fetch)
            .await
            .map_err(|_| Error::Timeout {
                timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            })?
    }
}
