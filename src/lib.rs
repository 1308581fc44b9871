//! # Solid Delegate
//!
//! Multi-tenant Solid Pod client: a backend acts on behalf of its end-users
//! against a Solid server.
//!
//! ## Features
//!
//! - **DPoP**: per-identity P-256 keys, proofs bound to method, URL and access token
//! - **Solid-OIDC**: dynamic registration, PKCE authorization and code exchange
//! - **Token resolution**: user tokens first, client-credentials as fallback
//! - **Resources**: pods and containers with ordered creation strategies
//! - **Access control**: `WAC-Allow` probes and owner policies
//! - **Profiles and imports**: WebID storage discovery, entity import as Turtle
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use solid_delegate::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     init_tracing(LogFormat::Pretty);
//!
//!     let solid = Solid::from_config(SolidConfig::from_env()?)?;
//!     let identity = solid.identities().find_or_create("acme", "alice").await?;
//!
//!     let redirect = identity.redirect_uri(&solid.config().redirect_base_url);
//!     solid
//!         .auth()
//!         .register(&identity, "Fleetbase", &redirect, Default::default())
//!         .await?;
//!     let request = solid.auth().authorize(&identity).await?;
//!     println!("Send the user to {}", request.url);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod identity;
pub mod solid;
pub mod storage;
pub mod tracing_ext;
pub mod types;
pub mod vault;

// Re-exports for convenience
pub use config::{ServerConfig, SolidConfig};
pub use error::{Error, Result};
pub use identity::{ClientCredentials, Identity, IdentityRepository, ServiceAccount, TokenSet};
pub use solid::Solid;
pub use storage::{CredentialStore, MemoryCredentialStore, SledCredentialStore};
pub use tracing_ext::{init_tracing, LogFormat};
pub use types::{EntryKind, IdentityScope};
pub use vault::{Sealed, SecretVault};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::SolidConfig;
    pub use crate::error::{Error, Result};
    pub use crate::identity::{Identity, TokenSet};
    pub use crate::solid::{
        AclManager, AuthState, CreationStrategy, ImportRecord, ResourceOrchestrator, Solid, SolidOidcClient,
        TokenResolver,
    };
    pub use crate::storage::CredentialStore;
    pub use crate::tracing_ext::{init_tracing, LogFormat};
    pub use crate::types::*;
    pub use crate::vault::SecretVault;
}
