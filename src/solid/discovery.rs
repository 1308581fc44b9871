//! OIDC provider discovery

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Well-known path of the discovery document
pub const WELL_KNOWN_PATH: &str = "/.well-known/openid-configuration";

/// Subset of the provider metadata this client relies on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier
    pub issuer: String,
    /// Browser redirect target
    pub authorization_endpoint: String,
    /// Token endpoint
    pub token_endpoint: String,
    /// Dynamic client registration endpoint
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    /// Signing keys of the provider
    #[serde(default)]
    pub jwks_uri: Option<String>,
    /// Client authentication methods accepted at the token endpoint
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,
    /// Algorithms accepted for DPoP proofs
    #[serde(default)]
    pub dpop_signing_alg_values_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Fetch `{issuer}/.well-known/openid-configuration`
    pub async fn fetch(http: &reqwest::Client, issuer: &str) -> Result<Self> {
        let url = discovery_url(issuer);
        tracing::debug!(url = %url, "Fetching OIDC discovery document");

        let response = http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::discovery(format!("{}: {}", url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::discovery(format!("{}: {}", url, e)))?;
        if !status.is_success() {
            return Err(Error::discovery(format!("{} returned {}: {}", url, status, body)));
        }

        serde_json::from_str(&body).map_err(|e| Error::discovery(format!("Invalid discovery document from {}: {}", url, e)))
    }

    /// Registration endpoint, or a discovery error when the provider has none
    pub fn require_registration_endpoint(&self) -> Result<&str> {
        self.registration_endpoint
            .as_deref()
            .ok_or_else(|| Error::discovery(format!("{} does not support dynamic registration", self.issuer)))
    }
}

/// Discovery URL of an issuer
pub fn discovery_url(issuer: &str) -> String {
    format!("{}{}", issuer.trim_end_matches('/'), WELL_KNOWN_PATH)
}

/// How the client authenticates at the token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthMethod {
    /// HTTP Basic with id and secret
    Basic,
    /// `client_id` and `client_secret` in the form body
    Post,
    /// Public client, only `client_id` in the body
    None,
}

impl ClientAuthMethod {
    /// Pick the method from the provider's declared support
    ///
    /// An empty list means the OIDC default, `client_secret_basic`.
    pub fn select(metadata: &ProviderMetadata, has_secret: bool) -> Self {
        if !has_secret {
            return Self::None;
        }

        let supported = &metadata.token_endpoint_auth_methods_supported;
        if supported.is_empty() || supported.iter().any(|m| m == "client_secret_basic") {
            Self::Basic
        } else if supported.iter().any(|m| m == "client_secret_post") {
            Self::Post
        } else {
            Self::Basic
        }
    }
}
