//! Solid-OIDC Authentication Client
//!
//! Drives one identity through
//! `Unregistered -> Registered -> AuthorizationRequested -> Authenticated -> Revoked`:
//! dynamic registration, a PKCE authorization redirect, the DPoP-bound code
//! exchange and logout. Registrations, pending requests and token sets are
//! persisted per identity scope.

use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityRepository, TokenSet};
use crate::solid::discovery::{ClientAuthMethod, ProviderMetadata};
use crate::solid::dpop::DPoPManager;
use crate::solid::profile::extract_web_id;
use crate::solid::token::{form_encode, parse_token_response};
use crate::storage::{get_json, keys, set_json, CredentialStore};
use crate::types::IdentityScope;
use crate::vault::{Sealed, SecretVault};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use url::Url;

/// Scopes requested at the authorization endpoint
pub const AUTHORIZATION_SCOPE: &str = "openid webid offline_access";

/// Result of dynamic client registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// Client id issued by the provider
    pub client_id: String,
    /// Sealed client secret; public clients have none
    pub client_secret: Option<Sealed>,
    /// Registered client name
    pub client_name: String,
    /// Registered redirect URI
    pub redirect_uri: String,
    /// Issuer the client is registered with
    pub issuer: String,
    /// Registration time
    pub registered_at: DateTime<Utc>,
}

/// Authorization request awaiting its callback
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingAuthorization {
    state: String,
    code_verifier: Sealed,
    redirect_uri: String,
    client_name: String,
    issuer: String,
    created_at: DateTime<Utc>,
}

/// Redirect for the end-user's browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// Authorization endpoint URL with all query parameters
    pub url: String,
    /// Opaque state echoed back on the callback
    pub state: String,
}

/// Authentication state of one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// No client registration
    Unregistered,
    /// Registered, no authorization requested yet
    Registered,
    /// Redirect issued, waiting for the code
    AuthorizationRequested,
    /// Token set stored
    Authenticated,
    /// Logged out
    Revoked,
}

/// Solid-OIDC authentication client
pub struct SolidOidcClient {
    http: reqwest::Client,
    store: Arc<dyn CredentialStore>,
    vault: SecretVault,
    dpop: Arc<DPoPManager>,
    identities: IdentityRepository,
    issuer: String,
    client_name: String,
}

impl SolidOidcClient {
    /// Create a client for `issuer`; `client_name` is the default registration name
    pub fn new(
        http: reqwest::Client,
        store: Arc<dyn CredentialStore>,
        vault: SecretVault,
        dpop: Arc<DPoPManager>,
        identities: IdentityRepository,
        issuer: impl Into<String>,
        client_name: impl Into<String>,
    ) -> Self {
        Self {
            http,
            store,
            vault,
            dpop,
            identities,
            issuer: issuer.into(),
            client_name: client_name.into(),
        }
    }

    /// Issuer this client authenticates against
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Default client name
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Register a client for `identity` and store the registration
    ///
    /// `extra_params` are merged into the registration body.
    #[tracing::instrument(skip_all, fields(scope = %identity.scope))]
    pub async fn register(
        &self,
        identity: &Identity,
        client_name: &str,
        redirect_uri: &str,
        extra_params: Map<String, Value>,
    ) -> Result<ClientRegistration> {
        let metadata = ProviderMetadata::fetch(&self.http, &self.issuer).await?;
        let endpoint = metadata.require_registration_endpoint()?;

        let mut body = Map::new();
        body.insert("client_name".to_string(), Value::from(client_name));
        body.insert("redirect_uris".to_string(), Value::from(vec![redirect_uri.to_string()]));
        body.extend(extra_params);

        let response = self
            .http
            .post(endpoint)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::error!(scope = %identity.scope, status = %status, body = %text, "Client registration rejected");
            return Err(Error::ClientRegistrationFailed {
                status: Some(status.as_u16()),
                body: text,
            });
        }

        let issued: RegistrationResponse = serde_json::from_str(&text).map_err(|_| Error::ClientRegistrationFailed {
            status: Some(status.as_u16()),
            body: text.clone(),
        })?;

        let client_secret = match issued.client_secret.filter(|s| !s.is_empty()) {
            Some(secret) => Some(self.vault.seal(&secret)?),
            None => None,
        };

        let registration = ClientRegistration {
            client_id: issued.client_id,
            client_secret,
            client_name: client_name.to_string(),
            redirect_uri: redirect_uri.to_string(),
            issuer: metadata.issuer,
            registered_at: Utc::now(),
        };

        set_json(
            self.store.as_ref(),
            &keys::client_registration(client_name, &identity.scope),
            &registration,
        )
        .await?;

        tracing::info!(scope = %identity.scope, client_name = %client_name, "Registered OIDC client");
        Ok(registration)
    }

    /// Load a stored registration; `None` when the client was never registered
    pub async fn restore(&self, identity: &Identity, client_name: &str) -> Result<Option<ClientRegistration>> {
        get_json(
            self.store.as_ref(),
            &keys::client_registration(client_name, &identity.scope),
        )
        .await
    }

    /// Authorization redirect for the default client name
    pub async fn authorize(&self, identity: &Identity) -> Result<AuthorizationRequest> {
        let client_name = self.client_name.clone();
        self.authorize_client(identity, &client_name).await
    }

    /// Authorization redirect (PKCE S256) for a registered client
    pub async fn authorize_client(&self, identity: &Identity, client_name: &str) -> Result<AuthorizationRequest> {
        let registration = self
            .restore(identity, client_name)
            .await?
            .ok_or_else(|| Error::ClientNotRegistered {
                client_name: client_name.to_string(),
            })?;
        let metadata = ProviderMetadata::fetch(&self.http, &registration.issuer).await?;

        let code_verifier = random_token(32);
        let state = random_token(16);

        let mut url = Url::parse(&metadata.authorization_endpoint)?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &registration.client_id)
            .append_pair("redirect_uri", &registration.redirect_uri)
            .append_pair("scope", AUTHORIZATION_SCOPE)
            .append_pair("state", &state)
            .append_pair("code_challenge", &pkce_challenge(&code_verifier))
            .append_pair("code_challenge_method", "S256")
            .append_pair("prompt", "consent");

        let pending = PendingAuthorization {
            state: state.clone(),
            code_verifier: self.vault.seal(&code_verifier)?,
            redirect_uri: registration.redirect_uri.clone(),
            client_name: client_name.to_string(),
            issuer: registration.issuer.clone(),
            created_at: Utc::now(),
        };
        set_json(
            self.store.as_ref(),
            &keys::pending_authorization(&identity.scope),
            &pending,
        )
        .await?;

        tracing::info!(scope = %identity.scope, client_name = %client_name, "Issued authorization request");
        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
        })
    }

    /// Exchange an authorization code for a DPoP-bound token set
    ///
    /// The identity is only modified and persisted once the exchange has
    /// fully succeeded.
    #[tracing::instrument(skip_all, fields(scope = %identity.scope))]
    pub async fn exchange_code(&self, identity: &mut Identity, code: &str, state: Option<&str>) -> Result<TokenSet> {
        let pending_key = keys::pending_authorization(&identity.scope);
        let pending: PendingAuthorization = get_json(self.store.as_ref(), &pending_key)
            .await?
            .ok_or(Error::NoPendingAuthorization)?;

        if let Some(state) = state {
            if state != pending.state {
                return Err(Error::invalid_input("Authorization state does not match the pending request"));
            }
        }

        let registration = self
            .restore(identity, &pending.client_name)
            .await?
            .ok_or_else(|| Error::ClientNotRegistered {
                client_name: pending.client_name.clone(),
            })?;
        let metadata = ProviderMetadata::fetch(&self.http, &pending.issuer).await?;

        let proof = self
            .dpop
            .mint_proof(&identity.scope, "POST", &metadata.token_endpoint, None)
            .await?;
        let code_verifier = self.vault.open(&pending.code_verifier)?;
        let client_secret = match &registration.client_secret {
            Some(sealed) => Some(self.vault.open(sealed)?),
            None => None,
        };

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", pending.redirect_uri.as_str()),
            ("code_verifier", code_verifier.expose_secret()),
        ];

        let method = ClientAuthMethod::select(&metadata, client_secret.is_some());
        let mut request = self.http.post(&metadata.token_endpoint).header("DPoP", proof);
        match (method, client_secret.as_ref()) {
            (ClientAuthMethod::Basic, Some(secret)) => {
                request = request.basic_auth(
                    form_encode(&registration.client_id),
                    Some(form_encode(secret.expose_secret())),
                );
            }
            (ClientAuthMethod::Post, Some(secret)) => {
                form.push(("client_id", registration.client_id.as_str()));
                form.push(("client_secret", secret.expose_secret()));
            }
            _ => form.push(("client_id", registration.client_id.as_str())),
        }

        tracing::info!(scope = %identity.scope, auth_method = ?method, "Exchanging authorization code");

        let response = request.form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        let tokens = match parse_token_response(status, &body) {
            Ok(tokens) => tokens.into_token_set(),
            Err(e) => {
                tracing::error!(scope = %identity.scope, status = %status, error = %e, "Token exchange failed");
                return Err(e);
            }
        };

        let claims = tokens.id_token.as_deref().and_then(decode_claims);
        let mut updated = identity.clone();
        if let Some(web_id) = claims.as_ref().and_then(extract_web_id) {
            updated.web_id = Some(web_id);
        }
        updated.issuer = Some(
            claims
                .as_ref()
                .and_then(|c| c.get("iss"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(metadata.issuer),
        );
        updated.token_set = Some(tokens.clone());
        updated.logged_out_at = None;

        self.identities.save(&mut updated).await?;
        self.store.delete(&pending_key).await?;
        *identity = updated;

        tracing::info!(scope = %identity.scope, has_web_id = identity.web_id.is_some(), "Identity authenticated");
        Ok(tokens)
    }

    /// Clear the token set and DPoP key pair; the registration is kept
    #[tracing::instrument(skip_all, fields(scope = %identity.scope))]
    pub async fn logout(&self, identity: &mut Identity) -> Result<()> {
        let mut updated = identity.clone();
        updated.token_set = None;
        updated.logged_out_at = Some(Utc::now());

        self.identities.save(&mut updated).await?;
        self.dpop.clear_key_pair(&identity.scope).await?;
        self.store.delete(&keys::pending_authorization(&identity.scope)).await?;
        *identity = updated;

        tracing::info!(scope = %identity.scope, "Identity logged out");
        Ok(())
    }

    /// Current state for the default client name
    pub async fn state(&self, identity: &Identity) -> Result<AuthState> {
        if identity.access_token().is_some() {
            return Ok(AuthState::Authenticated);
        }
        if self
            .store
            .get(&keys::pending_authorization(&identity.scope))
            .await?
            .is_some()
        {
            return Ok(AuthState::AuthorizationRequested);
        }
        if identity.logged_out_at.is_some() {
            return Ok(AuthState::Revoked);
        }
        if self.restore(identity, &self.client_name).await?.is_some() {
            return Ok(AuthState::Registered);
        }
        Ok(AuthState::Unregistered)
    }

    /// DPoP proof for `scope`, forwarded to the key manager
    pub async fn create_dpop(
        &self,
        scope: &IdentityScope,
        method: &str,
        url: &str,
        access_token: Option<&str>,
    ) -> Result<String> {
        self.dpop.mint_proof(scope, method, url, access_token).await
    }

    /// The DPoP key manager behind this client
    pub fn dpop(&self) -> &Arc<DPoPManager> {
        &self.dpop
    }
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

/// Claims of a compact JWT, without verifying its signature
pub fn decode_claims(jwt: &str) -> Option<Value> {
    let payload = jwt.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 code challenge for a PKCE verifier
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
