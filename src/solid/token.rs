//! Token endpoint responses and access token resolution
//!
//! Every authenticated call goes through [`TokenResolver::resolve`]: the
//! identity's OIDC access token wins, the client-credentials grant is the
//! fallback, and anything else is [`Error::NoCredentialsAvailable`].

use crate::error::{Error, Result};
use crate::identity::{Identity, TokenSet};
use crate::solid::discovery::ProviderMetadata;
use crate::solid::dpop::DPoPManager;
use crate::vault::SecretVault;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Scopes requested by the client-credentials grant
pub const CLIENT_CREDENTIALS_SCOPE: &str = "openid webid";

/// Successful token endpoint payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// ID token
    #[serde(default)]
    pub id_token: Option<String>,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Token type
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Convert into the stored token set
    pub fn into_token_set(self) -> TokenSet {
        let mut tokens = TokenSet::new(
            self.access_token,
            self.token_type.unwrap_or_else(|| "DPoP".to_string()),
            self.expires_in,
        );
        tokens.id_token = self.id_token;
        tokens.refresh_token = self.refresh_token;
        tokens.scope = self.scope;
        tokens
    }
}

/// Parse a token endpoint response
///
/// An `error` field is a provider error whatever the HTTP status. JSON and
/// form-encoded bodies are both accepted. Token values never end up in the
/// returned error.
pub fn parse_token_response(status: StatusCode, body: &str) -> Result<TokenResponse> {
    let value = match serde_json::from_str::<Value>(body) {
        Ok(value) => value,
        Err(_) => {
            let pairs: serde_json::Map<String, Value> = url::form_urlencoded::parse(body.as_bytes())
                .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                .collect();
            Value::Object(pairs)
        }
    };

    if let Some(error) = value.get("error").and_then(|v| v.as_str()) {
        let description = value
            .get("error_description")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        return Err(Error::token_exchange(error, description));
    }

    if !status.is_success() {
        return Err(Error::token_exchange(
            format!("http_{}", status.as_u16()),
            Some("token endpoint returned a non-success status without an error code".to_string()),
        ));
    }

    let has_token = value
        .get("access_token")
        .and_then(|v| v.as_str())
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    if !has_token {
        return Err(Error::token_exchange(
            "invalid_response",
            Some("token endpoint response missing access_token".to_string()),
        ));
    }

    Ok(serde_json::from_value(normalize_numbers(value))?)
}

// Form bodies carry expires_in as a string
fn normalize_numbers(mut value: Value) -> Value {
    if let Some(expires) = value.get("expires_in").and_then(|v| v.as_str()).map(|s| s.parse::<u64>()) {
        if let Some(obj) = value.as_object_mut() {
            match expires {
                Ok(n) => obj.insert("expires_in".to_string(), Value::from(n)),
                Err(_) => obj.remove("expires_in"),
            };
        }
    }
    value
}

/// Which credential path produced a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    /// Stored OIDC token set
    Oidc,
    /// Fresh client-credentials grant
    ClientCredentials,
}

/// Access token chosen for one outbound request
#[derive(Clone)]
pub struct ResolvedToken {
    /// Access token
    pub access_token: String,
    /// Credential path used
    pub source: TokenSource,
}

impl std::fmt::Debug for ResolvedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedToken")
            .field("access_token", &"***REDACTED***")
            .field("source", &self.source)
            .finish()
    }
}

/// Header values that authorize one request
#[derive(Clone)]
pub struct AuthorizationHeaders {
    /// `Authorization` header value (`DPoP <token>`)
    pub authorization: String,
    /// `DPoP` header value, bound to method, URL and token
    pub dpop: String,
    /// Credential path used
    pub source: TokenSource,
}

impl std::fmt::Debug for AuthorizationHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationHeaders")
            .field("authorization", &"***REDACTED***")
            .field("dpop", &format!("{} bytes", self.dpop.len()))
            .field("source", &self.source)
            .finish()
    }
}

/// Picks the access token for an identity
pub struct TokenResolver {
    http: reqwest::Client,
    dpop: Arc<DPoPManager>,
    vault: SecretVault,
    default_issuer: String,
}

impl TokenResolver {
    /// Create a resolver; `default_issuer` is used when the identity has none
    pub fn new(
        http: reqwest::Client,
        dpop: Arc<DPoPManager>,
        vault: SecretVault,
        default_issuer: impl Into<String>,
    ) -> Self {
        Self {
            http,
            dpop,
            vault,
            default_issuer: default_issuer.into(),
        }
    }

    /// Resolve the access token for `identity`
    ///
    /// Nothing is cached: callers resolve once per outbound request.
    pub async fn resolve(&self, identity: &Identity) -> Result<ResolvedToken> {
        if let Some(token) = identity.access_token() {
            if identity.token_set.as_ref().map(|t| t.is_expired()).unwrap_or(false) {
                tracing::debug!(scope = %identity.scope, "Stored OIDC token is past its reported expiry");
            }
            return Ok(ResolvedToken {
                access_token: token.to_string(),
                source: TokenSource::Oidc,
            });
        }

        if identity.has_client_credentials() {
            let access_token = self.client_credentials_token(identity).await?;
            return Ok(ResolvedToken {
                access_token,
                source: TokenSource::ClientCredentials,
            });
        }

        Err(Error::NoCredentialsAvailable {
            scope: identity.scope.to_string(),
        })
    }

    /// Resolve a token and mint the proof for one request
    pub async fn authorize_request(&self, identity: &Identity, method: &str, url: &str) -> Result<AuthorizationHeaders> {
        let resolved = self.resolve(identity).await?;
        let dpop = self
            .dpop
            .mint_proof(&identity.scope, method, url, Some(&resolved.access_token))
            .await?;

        Ok(AuthorizationHeaders {
            authorization: format!("DPoP {}", resolved.access_token),
            dpop,
            source: resolved.source,
        })
    }

    /// Issuer for `identity`
    pub fn issuer_for(&self, identity: &Identity) -> String {
        identity.issuer.clone().unwrap_or_else(|| self.default_issuer.clone())
    }

    async fn client_credentials_token(&self, identity: &Identity) -> Result<String> {
        let credentials = identity.client_credentials.as_ref().ok_or_else(|| Error::NoCredentialsAvailable {
            scope: identity.scope.to_string(),
        })?;
        let secret = self.vault.open(&credentials.secret)?;

        let issuer = self.issuer_for(identity);
        let metadata = ProviderMetadata::fetch(&self.http, &issuer).await?;
        let proof = self
            .dpop
            .mint_proof(&identity.scope, "POST", &metadata.token_endpoint, None)
            .await?;

        tracing::info!(scope = %identity.scope, issuer = %issuer, "Requesting client-credentials token");

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .basic_auth(form_encode(&credentials.client_id), Some(form_encode(secret.expose_secret())))
            .header("DPoP", proof)
            .form(&[("grant_type", "client_credentials"), ("scope", CLIENT_CREDENTIALS_SCOPE)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let token = parse_token_response(status, &body)?;
        Ok(token.access_token)
    }
}

/// Client id and secret are form-encoded before Basic authentication
pub(crate) fn form_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
