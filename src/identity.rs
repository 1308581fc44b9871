//! Per (tenant, user) identity records and their repository

use crate::error::Result;
use crate::storage::{get_json, keys, set_json, CredentialStore};
use crate::types::IdentityScope;
use crate::vault::Sealed;
use chrono::{DateTime, Duration, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const REQUEST_CODE_LEN: usize = 16;
const REQUEST_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// OIDC tokens held by one identity
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    /// DPoP-bound access token
    pub access_token: String,
    /// Signed ID token
    pub id_token: Option<String>,
    /// Refresh token, when `offline_access` was granted
    pub refresh_token: Option<String>,
    /// Token type, normally `DPoP`
    pub token_type: String,
    /// Lifetime in seconds as reported by the provider
    pub expires_in: Option<u64>,
    /// Absolute expiry computed at exchange time
    pub expires_at: Option<DateTime<Utc>>,
    /// Granted scopes
    pub scope: Option<String>,
}

impl TokenSet {
    /// Build a token set, computing `expires_at` from `expires_in`
    pub fn new(access_token: impl Into<String>, token_type: impl Into<String>, expires_in: Option<u64>) -> Self {
        let expires_at = expires_in.map(|secs| Utc::now() + Duration::seconds(secs as i64));
        Self {
            access_token: access_token.into(),
            id_token: None,
            refresh_token: None,
            token_type: token_type.into(),
            expires_in,
            expires_at,
            scope: None,
        }
    }

    /// Whether the access token is present
    pub fn has_access_token(&self) -> bool {
        !self.access_token.trim().is_empty()
    }

    /// Whether the provider-reported lifetime has elapsed
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| at <= Utc::now()).unwrap_or(false)
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"***REDACTED***")
            .field("id_token", &self.id_token.as_ref().map(|_| "***REDACTED***"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***REDACTED***"))
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Client-credentials pair issued by the account API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCredentials {
    /// Client id
    pub client_id: String,
    /// Sealed client secret
    pub secret: Sealed,
    /// URL of the credential resource on the account server
    pub resource_url: Option<String>,
}

/// Service-account login used to obtain client credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAccount {
    /// Account email
    pub email: String,
    /// Sealed password
    pub password: Sealed,
}

/// One identity per (tenant, end-user) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Store namespace for everything owned by this identity
    pub scope: IdentityScope,
    /// Tenant (company) identifier
    pub tenant_id: String,
    /// End-user identifier
    pub user_id: String,
    /// Code embedded in the redirect URI so the callback can find this record
    pub request_code: String,
    /// WebID learned from the ID token
    pub web_id: Option<String>,
    /// Issuer the tokens were obtained from
    pub issuer: Option<String>,
    /// Current OIDC tokens
    pub token_set: Option<TokenSet>,
    /// Client-credentials pair for the fallback path
    pub client_credentials: Option<ClientCredentials>,
    /// Service-account login
    pub service_account: Option<ServiceAccount>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// Set by logout, cleared by the next successful exchange
    pub logged_out_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// Create a fresh identity
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let tenant_id = tenant_id.into();
        let user_id = user_id.into();
        let now = Utc::now();
        Self {
            scope: IdentityScope::new(&tenant_id, &user_id),
            tenant_id,
            user_id,
            request_code: generate_request_code(),
            web_id: None,
            issuer: None,
            token_set: None,
            client_credentials: None,
            service_account: None,
            created_at: now,
            updated_at: now,
            logged_out_at: None,
        }
    }

    /// Callback URI for the authorization code flow
    pub fn redirect_uri(&self, base_url: &str) -> String {
        format!(
            "{}/oidc/complete-registration/{}",
            base_url.trim_end_matches('/'),
            self.request_code
        )
    }

    /// Non-empty OIDC access token, if any
    pub fn access_token(&self) -> Option<&str> {
        self.token_set
            .as_ref()
            .filter(|t| t.has_access_token())
            .map(|t| t.access_token.as_str())
    }

    /// Whether the identity holds a usable client-credentials pair
    pub fn has_client_credentials(&self) -> bool {
        self.client_credentials
            .as_ref()
            .map(|c| !c.client_id.is_empty() && !c.secret.as_str().is_empty())
            .unwrap_or(false)
    }

    /// Bump the modification time
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Random alphanumeric code for redirect URIs
pub fn generate_request_code() -> String {
    let mut bytes = [0u8; REQUEST_CODE_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| REQUEST_CODE_ALPHABET[*b as usize % REQUEST_CODE_ALPHABET.len()] as char)
        .collect()
}

/// Identity persistence over the credential store
#[derive(Clone)]
pub struct IdentityRepository {
    store: Arc<dyn CredentialStore>,
}

impl IdentityRepository {
    /// Create a repository
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Load the identity for `(tenant, user)`, creating it on first use
    pub async fn find_or_create(&self, tenant_id: &str, user_id: &str) -> Result<Identity> {
        let scope = IdentityScope::new(tenant_id, user_id);
        if let Some(mut identity) = self.find(&scope).await? {
            if identity.request_code.is_empty() {
                identity.request_code = generate_request_code();
                self.save(&mut identity).await?;
            }
            return Ok(identity);
        }

        let candidate = Identity::new(tenant_id, user_id);
        let json = serde_json::to_string(&candidate)?;
        if self.store.set_if_absent(&keys::identity(&scope), json).await? {
            tracing::info!(scope = %scope, "Created identity");
            return Ok(candidate);
        }

        // Another caller created it first
        self.find(&scope).await?.ok_or_else(|| {
            crate::error::Error::storage(format!("Identity {} vanished after creation", scope))
        })
    }

    /// Load an identity by scope
    pub async fn find(&self, scope: &IdentityScope) -> Result<Option<Identity>> {
        get_json(self.store.as_ref(), &keys::identity(scope)).await
    }

    /// Load the identity whose redirect URI carries `request_code`
    pub async fn find_by_request_code(&self, request_code: &str) -> Result<Option<Identity>> {
        if request_code.is_empty() {
            return Ok(None);
        }

        for (key, value) in self.store.scan_prefix(keys::IDENTITY_PREFIX).await? {
            match serde_json::from_str::<Identity>(&value) {
                Ok(identity) if identity.request_code == request_code => return Ok(Some(identity)),
                Ok(_) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable identity record"),
            }
        }

        Ok(None)
    }

    /// Persist an identity, bumping `updated_at`
    pub async fn save(&self, identity: &mut Identity) -> Result<()> {
        identity.touch();
        set_json(self.store.as_ref(), &keys::identity(&identity.scope), &*identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCredentialStore;
    use crate::vault::SecretVault;

    fn repository() -> IdentityRepository {
        IdentityRepository::new(Arc::new(MemoryCredentialStore::new()))
    }

    #[tokio::test]
    async fn test_find_or_create_is_stable() {
        let repo = repository();
        let first = repo.find_or_create("acme", "alice").await.unwrap();
        let second = repo.find_or_create("acme", "alice").await.unwrap();

        assert_eq!(first.scope, second.scope);
        assert_eq!(first.request_code, second.request_code);
        assert_eq!(first.request_code.len(), REQUEST_CODE_LEN);
    }

    #[tokio::test]
    async fn test_find_by_request_code() {
        let repo = repository();
        let alice = repo.find_or_create("acme", "alice").await.unwrap();
        let _bob = repo.find_or_create("acme", "bob").await.unwrap();

        let found = repo.find_by_request_code(&alice.request_code).await.unwrap().unwrap();
        assert_eq!(found.user_id, "alice");
        assert!(repo.find_by_request_code("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_persists_fields() {
        let repo = repository();
        let vault = SecretVault::generate();
        let mut identity = repo.find_or_create("acme", "alice").await.unwrap();
        identity.web_id = Some("https://pod.example/alice/profile/card#me".to_string());
        identity.client_credentials = Some(ClientCredentials {
            client_id: "cid".to_string(),
            secret: vault.seal("csecret").unwrap(),
            resource_url: None,
        });
        repo.save(&mut identity).await.unwrap();

        let loaded = repo.find(&identity.scope).await.unwrap().unwrap();
        assert_eq!(loaded.web_id, identity.web_id);
        assert!(loaded.has_client_credentials());
    }

    #[tokio::test]
    async fn test_tenants_sharing_a_separator_stay_apart() {
        let repo = repository();
        let mut ops = repo.find_or_create("acme:ops", "alice").await.unwrap();
        ops.web_id = Some("https://pod.example/secret#me".to_string());
        repo.save(&mut ops).await.unwrap();

        let other = repo.find_or_create("acme", "ops:alice").await.unwrap();
        assert_eq!(other.tenant_id, "acme");
        assert_eq!(other.user_id, "ops:alice");
        assert!(other.web_id.is_none());
        assert_ne!(other.scope, ops.scope);
    }

    #[test]
    fn test_redirect_uri() {
        let identity = Identity::new("acme", "alice");
        let uri = identity.redirect_uri("https://api.example.com/");
        assert_eq!(
            uri,
            format!("https://api.example.com/oidc/complete-registration/{}", identity.request_code)
        );
    }

    #[test]
    fn test_token_set_debug_redacts() {
        let tokens = TokenSet::new("AT-secret", "DPoP", Some(3600));
        let debug = format!("{:?}", tokens);
        assert!(!debug.contains("AT-secret"));
        assert!(!tokens.is_expired());
    }

    #[test]
    fn test_blank_access_token_is_ignored() {
        let mut identity = Identity::new("acme", "alice");
        identity.token_set = Some(TokenSet::new("  ", "DPoP", None));
        assert!(identity.access_token().is_none());
    }
}
