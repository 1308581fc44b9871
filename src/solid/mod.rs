//! Solid protocol client
//!
//! Components are layered leaf first: DPoP proofs, OIDC sessions, token
//! resolution, the authenticated request layer and, on top of it, profiles,
//! resources, access control and imports. [`Solid`] wires them together and
//! hands each one out through its own accessor.

pub mod account;
pub mod acl;
pub mod auth;
pub mod client;
pub mod discovery;
pub mod dpop;
pub mod profile;
pub mod rdf;
pub mod resources;
pub mod sync;
pub mod token;

pub use self::{
    account::AccountClient,
    acl::{AclManager, AclPolicy, WacAllow},
    auth::{AuthState, AuthorizationRequest, ClientRegistration, SolidOidcClient},
    client::{SolidClient, SolidResponse},
    dpop::DPoPManager,
    profile::{ProfileResolver, WebIdProfile},
    resources::{ContainerEntry, CreatedContainer, CreationStrategy, ResourceOrchestrator},
    sync::{EntitySource, ImportBatch, ImportEngine, ImportOutcome, ImportRecord},
    token::{AuthorizationHeaders, ResolvedToken, TokenResolver, TokenSource},
};

use crate::config::SolidConfig;
use crate::error::{Error, Result};
use crate::identity::IdentityRepository;
use crate::storage::{CredentialStore, SledCredentialStore};
use crate::vault::SecretVault;
use secrecy::ExposeSecret;
use std::sync::Arc;

/// Composition root of the Solid client
pub struct Solid {
    config: SolidConfig,
    identities: IdentityRepository,
    dpop: Arc<DPoPManager>,
    auth: Arc<SolidOidcClient>,
    tokens: Arc<TokenResolver>,
    client: Arc<SolidClient>,
    accounts: Arc<AccountClient>,
    profiles: Arc<ProfileResolver>,
    resources: Arc<ResourceOrchestrator>,
    acl: Arc<AclManager>,
    imports: Arc<ImportEngine>,
}

impl Solid {
    /// Build every component over the given store and vault
    pub fn new(config: SolidConfig, store: Arc<dyn CredentialStore>, vault: SecretVault) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;
        let issuer = config.server_url();

        let identities = IdentityRepository::new(store.clone());
        let dpop = Arc::new(DPoPManager::new(store.clone(), vault.clone()));
        let auth = Arc::new(SolidOidcClient::new(
            http.clone(),
            store,
            vault.clone(),
            dpop.clone(),
            identities.clone(),
            issuer.clone(),
            config.client_name.clone(),
        ));
        let tokens = Arc::new(TokenResolver::new(http.clone(), dpop.clone(), vault.clone(), issuer.clone()));
        let client = Arc::new(SolidClient::new(http.clone(), tokens.clone()));
        let accounts = Arc::new(AccountClient::new(http, vault, identities.clone(), issuer.clone()));
        let profiles = Arc::new(ProfileResolver::new(client.clone()));
        let resources = Arc::new(ResourceOrchestrator::new(client.clone(), profiles.clone(), accounts.clone()));
        let acl = Arc::new(AclManager::new(resources.clone()));
        let imports = Arc::new(ImportEngine::new(resources.clone(), config.import_cap));

        tracing::info!(issuer = %issuer, client_name = %config.client_name, "Solid client ready");

        Ok(Self {
            config,
            identities,
            dpop,
            auth,
            tokens,
            client,
            accounts,
            profiles,
            resources,
            acl,
            imports,
        })
    }

    /// Build from configuration alone: the vault key comes from the config
    /// and the store is sled at `store_path`, or a temporary sled database
    pub fn from_config(config: SolidConfig) -> Result<Self> {
        let vault = SecretVault::from_base64_key(config.vault_key.expose_secret())?;
        let store: Arc<dyn CredentialStore> = match &config.store_path {
            Some(path) => Arc::new(SledCredentialStore::open(path)?),
            None => Arc::new(SledCredentialStore::temporary()?),
        };
        Self::new(config, store, vault)
    }

    /// Active configuration
    pub fn config(&self) -> &SolidConfig {
        &self.config
    }

    /// Identity records
    pub fn identities(&self) -> &IdentityRepository {
        &self.identities
    }

    /// DPoP key and proof manager
    pub fn dpop(&self) -> &Arc<DPoPManager> {
        &self.dpop
    }

    /// OIDC registration, authorization and code exchange
    pub fn auth(&self) -> &Arc<SolidOidcClient> {
        &self.auth
    }

    /// Access token resolution
    pub fn tokens(&self) -> &Arc<TokenResolver> {
        &self.tokens
    }

    /// Authenticated request layer
    pub fn client(&self) -> &Arc<SolidClient> {
        &self.client
    }

    /// Service-account API
    pub fn accounts(&self) -> &Arc<AccountClient> {
        &self.accounts
    }

    /// WebID profiles
    pub fn profiles(&self) -> &Arc<ProfileResolver> {
        &self.profiles
    }

    /// Pods, containers and resources
    pub fn resources(&self) -> &Arc<ResourceOrchestrator> {
        &self.resources
    }

    /// Access-control policies
    pub fn acl(&self) -> &Arc<AclManager> {
        &self.acl
    }

    /// Entity import
    pub fn imports(&self) -> &Arc<ImportEngine> {
        &self.imports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCredentialStore;

    #[tokio::test]
    async fn test_components_share_one_store() {
        let config = SolidConfig::new("pod.example").with_port(8443).with_secure(true);
        let solid = Solid::new(config, Arc::new(MemoryCredentialStore::new()), SecretVault::generate()).unwrap();

        assert_eq!(solid.auth().issuer(), "https://pod.example:8443");
        assert_eq!(solid.imports().cap(), 100);

        let identity = solid.identities().find_or_create("acme", "alice").await.unwrap();
        let jwk = solid.dpop().public_jwk(&identity.scope).await.unwrap();
        let again = solid.auth().dpop().public_jwk(&identity.scope).await.unwrap();
        assert_eq!(jwk, again);
    }

    #[test]
    fn test_from_config_uses_vault_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = SolidConfig::new("localhost").with_store_path(dir.path().join("creds"));
        assert!(Solid::from_config(config).is_ok());

        let bad = SolidConfig::new("localhost").with_vault_key("too-short");
        assert!(Solid::from_config(bad).is_err());
    }
}
