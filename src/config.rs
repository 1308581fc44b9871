//! Configuration for the Solid delegate client

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dotenvy::dotenv;
use rand_core::{OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Location of the Solid server that acts as OIDC issuer and pod host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host name, with or without a scheme (e.g. `http://solid` or `solid`)
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Use https instead of http
    pub secure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            secure: false,
        }
    }
}

impl ServerConfig {
    /// Base URL of the server, rebuilt from host, port and scheme
    pub fn url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let host = self
            .host
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        format!("{}://{}:{}", scheme, host, self.port)
    }
}

/// Flat shape of the `SOLID_*` environment, before secrets are wrapped
#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    secure: bool,
    #[serde(default = "default_client_name")]
    client_name: String,
    #[serde(default)]
    redirect_base_url: Option<String>,
    #[serde(default = "default_import_cap")]
    import_cap: usize,
    #[serde(default)]
    vault_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default)]
    store_path: Option<String>,
}

fn default_host() -> String {
    "http://solid".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_client_name() -> String {
    "Fleetbase".to_string()
}

fn default_import_cap() -> usize {
    100
}

fn default_timeout_secs() -> u64 {
    30
}

/// Top-level client configuration
#[derive(Clone)]
pub struct SolidConfig {
    /// Solid server location
    pub server: ServerConfig,
    /// Client name used for dynamic registration
    pub client_name: String,
    /// Public base URL of the host application, used to build redirect URIs
    pub redirect_base_url: String,
    /// Maximum number of entities imported per resource type
    pub import_cap: usize,
    /// Base64 encoded 256-bit key for the secret vault
    pub vault_key: SecretString,
    /// Transport timeout for outbound requests
    pub request_timeout: Duration,
    /// Directory of the persistent credential store, if any
    pub store_path: Option<PathBuf>,
}

impl SolidConfig {
    /// Load configuration from `.env` and `SOLID_*` environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env if present so local development picks up SOLID_VAULT_KEY
        let _ = dotenv();

        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("SOLID").try_parsing(true))
            .build()
            .map_err(|e| Error::config(format!("Failed to read environment: {}", e)))?;

        let raw: RawSettings = settings
            .try_deserialize()
            .map_err(|e| Error::config(format!("Invalid SOLID_* settings: {}", e)))?;

        let vault_key = raw
            .vault_key
            .ok_or_else(|| Error::config("SOLID_VAULT_KEY environment variable not set"))?;

        let server = ServerConfig {
            host: raw.host,
            port: raw.port,
            secure: raw.secure,
        };
        let redirect_base_url = raw.redirect_base_url.unwrap_or_else(|| server.url());

        Ok(Self {
            server,
            client_name: raw.client_name,
            redirect_base_url,
            import_cap: raw.import_cap,
            vault_key: SecretString::from(vault_key),
            request_timeout: Duration::from_secs(raw.timeout_secs),
            store_path: raw.store_path.map(PathBuf::from),
        })
    }

    /// Create a configuration pointing at `host`, with a fresh random vault key
    pub fn new(host: impl Into<String>) -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        let server = ServerConfig {
            host: host.into(),
            ..ServerConfig::default()
        };
        let redirect_base_url = server.url();

        Self {
            server,
            client_name: default_client_name(),
            redirect_base_url,
            import_cap: default_import_cap(),
            vault_key: SecretString::from(STANDARD.encode(key)),
            request_timeout: Duration::from_secs(default_timeout_secs()),
            store_path: None,
        }
    }

    /// Default OIDC issuer: the configured server URL
    pub fn server_url(&self) -> String {
        self.server.url()
    }

    /// Set the server port
    pub fn with_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    /// Use https for the server URL
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.server.secure = secure;
        self
    }

    /// Set the client name
    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    /// Set the redirect base URL
    pub fn with_redirect_base_url(mut self, url: impl Into<String>) -> Self {
        self.redirect_base_url = url.into();
        self
    }

    /// Set the per-type import cap
    pub fn with_import_cap(mut self, cap: usize) -> Self {
        self.import_cap = cap;
        self
    }

    /// Set the vault key (base64, 32 bytes)
    pub fn with_vault_key(mut self, key: impl Into<String>) -> Self {
        self.vault_key = SecretString::from(key.into());
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the store directory
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Get the vault key as a string
    pub fn vault_key(&self) -> &str {
        self.vault_key.expose_secret()
    }
}

impl Default for SolidConfig {
    fn default() -> Self {
        Self::new(default_host())
    }
}

impl std::fmt::Debug for SolidConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolidConfig")
            .field("server", &self.server)
            .field("client_name", &self.client_name)
            .field("redirect_base_url", &self.redirect_base_url)
            .field("import_cap", &self.import_cap)
            .field("vault_key", &"***REDACTED***")
            .field("request_timeout", &self.request_timeout)
            .field("store_path", &self.store_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_url_strips_scheme() {
        let config = SolidConfig::new("http://solid");
        assert_eq!(config.server_url(), "http://solid:3000");

        let config = SolidConfig::new("https://pods.example.org/")
            .with_port(8443)
            .with_secure(true);
        assert_eq!(config.server_url(), "https://pods.example.org:8443");
    }

    #[test]
    fn test_defaults() {
        let config = SolidConfig::default();
        assert_eq!(config.client_name, "Fleetbase");
        assert_eq!(config.import_cap, 100);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.store_path.is_none());
    }

    #[test]
    fn test_debug_redacts_vault_key() {
        let config = SolidConfig::new("solid").with_vault_key("super-secret-key");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("super-secret-key"));
        assert!(debug.contains("REDACTED"));
    }
}
