//! Error types for the Solid delegate client

use crate::solid::resources::CreationAttempt;
use thiserror::Error;

/// Result type alias for Solid delegate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Solid delegate client
#[derive(Debug, Error)]
pub enum Error {
    /// DPoP key generation or proof signing failed
    #[error("DPoP proof generation failed: {0}")]
    ProofGenerationFailed(String),

    /// Dynamic client registration was rejected by the authorization server
    #[error("Client registration failed (status {status:?}): {body}")]
    ClientRegistrationFailed {
        /// HTTP status returned by the registration endpoint, if any
        status: Option<u16>,
        /// Response body kept for diagnostics
        body: String,
    },

    /// The token endpoint answered with an OAuth error payload
    #[error("Token exchange failed: {error}{}", description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    TokenExchangeFailed {
        /// OAuth `error` code
        error: String,
        /// OAuth `error_description`
        description: Option<String>,
    },

    /// Neither an OIDC token nor a client-credentials pair is available
    #[error("No credentials available for identity {scope}")]
    NoCredentialsAvailable {
        /// Identity scope that was resolved
        scope: String,
    },

    /// Every container creation strategy failed
    #[error("Resource creation failed for {url} after {} attempts", attempts.len())]
    ResourceCreationFailed {
        /// Target container URL
        url: String,
        /// Per-strategy diagnostics in the order they were tried
        attempts: Vec<CreationAttempt>,
    },

    /// Access-control probe could not be completed
    #[error("Permission check failed for {url}: {reason}")]
    PermissionCheckFailed {
        /// Resource that was probed
        url: String,
        /// What went wrong
        reason: String,
    },

    /// A single item of an import batch could not be written
    #[error("Import of {item} failed: {reason}")]
    ImportPartialFailure {
        /// Item identifier
        item: String,
        /// Failure message
        reason: String,
    },

    /// No stored client registration for the requested client name
    #[error("Client '{client_name}' is not registered for this identity")]
    ClientNotRegistered {
        /// Client name that was looked up
        client_name: String,
    },

    /// Authorization code arrived without a matching pending authorization
    #[error("No pending authorization request for this identity")]
    NoPendingAuthorization,

    /// OIDC discovery document could not be fetched or parsed
    #[error("OIDC discovery error: {0}")]
    Discovery(String),

    /// Account management API error
    #[error("Account API error: {0}")]
    AccountApi(String),

    /// Non-success response from a resource server
    #[error("Remote error {status} from {url}: {body}")]
    Remote {
        /// HTTP status code
        status: u16,
        /// Requested URL
        url: String,
        /// Response body
        body: String,
    },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Credential store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Sealing or opening a secret failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a proof generation error
    pub fn proof(msg: impl Into<String>) -> Self {
        Self::ProofGenerationFailed(msg.into())
    }

    /// Create a token exchange error from an OAuth error payload
    pub fn token_exchange(error: impl Into<String>, description: Option<String>) -> Self {
        Self::TokenExchangeFailed {
            error: error.into(),
            description,
        }
    }

    /// Create a remote error
    pub fn remote(status: u16, url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Remote {
            status,
            url: url.into(),
            body: body.into(),
        }
    }

    /// Create a discovery error
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create an account API error
    pub fn account(msg: impl Into<String>) -> Self {
        Self::AccountApi(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a crypto error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an other error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the error came from the network layer rather than from
    /// credentials, proofs or local state
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_exchange_message_contains_description() {
        let err = Error::token_exchange("invalid_grant", Some("expired".to_string()));
        let msg = err.to_string();
        assert!(msg.contains("invalid_grant"));
        assert!(msg.contains("expired"));
    }

    #[test]
    fn test_token_exchange_message_without_description() {
        let err = Error::token_exchange("invalid_client", None);
        assert_eq!(err.to_string(), "Token exchange failed: invalid_client");
    }
}
