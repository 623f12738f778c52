use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, WebDavError};

/// How requests authenticate against the server
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Credentials {
    Basic { username: String, password: String },
    /// A pre-built `Authorization` header value, e.g. `Bearer abc123`
    Header(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Credentials::Header(_) => f.debug_tuple("Header").field(&"***").finish(),
        }
    }
}

/// Connection settings for a [`WebDavClient`](crate::WebDavClient)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL, e.g. `https://cloud.example.com:443/remote.php/webdav`
    pub server_url: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// PEM file with an extra trusted root certificate
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    /// Whole-request timeout. `None` leaves long transfers unbounded.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn default_verify_tls() -> bool {
    true
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: Self::normalize_server_url(&server_url.into()),
            credentials: None,
            ca_cert_path: None,
            verify_tls: true,
            timeout_seconds: None,
        }
    }

    /// Builds the base URL from its parts.
    ///
    /// A `port` of 0 selects the protocol default (443 for https, 80 otherwise).
    pub fn from_parts(host: &str, port: u16, protocol: &str, path: Option<&str>) -> Self {
        let port = if port == 0 {
            if protocol == "https" { 443 } else { 80 }
        } else {
            port
        };
        let mut server_url = format!("{}://{}:{}", protocol, host, port);
        if let Some(path) = path.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
            server_url = format!("{}/{}", server_url, path);
        }
        Self::new(server_url)
    }

    /// Loads the configuration from `WEBDAV_*` environment variables
    pub fn from_env() -> Result<Self> {
        let server_url = env::var("WEBDAV_URL")
            .map_err(|_| WebDavError::Config("WEBDAV_URL must be set".to_string()))?;
        let mut config = Self::new(server_url);

        if let Ok(header) = env::var("WEBDAV_AUTH_HEADER") {
            config = config.with_auth_header(header);
        } else if let Ok(username) = env::var("WEBDAV_USERNAME") {
            let password = env::var("WEBDAV_PASSWORD").unwrap_or_default();
            config = config.with_basic_auth(username, password);
        }

        if let Ok(path) = env::var("WEBDAV_CA_CERT") {
            config = config.with_ca_cert(path);
        }

        if let Ok(value) = env::var("WEBDAV_VERIFY_TLS") {
            let verify = match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(WebDavError::Config(format!(
                        "WEBDAV_VERIFY_TLS must be a boolean, got '{}'",
                        other
                    )))
                }
            };
            config = config.with_verify_tls(verify);
        }

        if let Ok(value) = env::var("WEBDAV_TIMEOUT_SECONDS") {
            let seconds = value.parse::<u64>().map_err(|_| {
                WebDavError::Config(format!(
                    "WEBDAV_TIMEOUT_SECONDS must be a number, got '{}'",
                    value
                ))
            })?;
            config = config.with_timeout(seconds);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials::Basic {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_auth_header(mut self, value: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::Header(value.into()));
        self
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// Validates the configuration before a client is built
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.server_url)
            .map_err(|e| {
                WebDavError::Config(format!("invalid server URL '{}': {}", self.server_url, e))
            })?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(WebDavError::Config(format!(
                "server URL must use http or https, got '{}'",
                url.scheme()
            )));
        }

        if url.host_str().map_or(true, |h| h.is_empty()) {
            return Err(WebDavError::Config("server URL has no host".to_string()));
        }

        if let Some(Credentials::Basic { username, .. }) = &self.credentials {
            if username.is_empty() {
                return Err(WebDavError::Config("username cannot be empty".to_string()));
            }
        }

        Ok(())
    }

    /// Path component of the server URL without a trailing slash ("" at the root)
    pub fn base_path(&self) -> String {
        url::Url::parse(&self.server_url)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default()
    }

    /// Trims whitespace and trailing slashes
    pub fn normalize_server_url(url: &str) -> String {
        url.trim().trim_end_matches('/').to_string()
    }
}
