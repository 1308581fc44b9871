//! DPoP (Demonstrating Proof of Possession)
//!
//! Implements RFC 9449 proofs with one ES256 key pair per identity scope.
//! Key material lives in the credential store, sealed by the vault, so the
//! same key survives restarts and is shared by every worker of a tenant.

use crate::error::{Error, Result};
use crate::storage::{keys, CredentialStore};
use crate::types::IdentityScope;
use crate::vault::{Sealed, SecretVault};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters, EllipticCurveKeyType, Jwk,
};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rand_core::{OsRng, RngCore};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

/// Public half of a DPoP key in JWK form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    /// Key type, always `EC`
    pub kty: String,
    /// Curve, always `P-256`
    pub crv: String,
    /// X coordinate, base64url
    pub x: String,
    /// Y coordinate, base64url
    pub y: String,
}

impl PublicJwk {
    fn from_verifying_key(key: &VerifyingKey) -> Result<Self> {
        let point = key.to_encoded_point(false);
        let x = point.x().ok_or_else(|| Error::proof("Public key has no x coordinate"))?;
        let y = point.y().ok_or_else(|| Error::proof("Public key has no y coordinate"))?;

        Ok(Self {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
        })
    }

    fn to_header_jwk(&self) -> Jwk {
        Jwk {
            common: CommonParameters::default(),
            algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                key_type: EllipticCurveKeyType::EC,
                curve: EllipticCurve::P256,
                x: self.x.clone(),
                y: self.y.clone(),
            }),
        }
    }
}

/// Persisted DPoP key pair of one identity scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DPoPKeyPair {
    /// Sealed base64 PKCS#8 DER private key
    pub private_key: Sealed,
    /// Public key
    pub public_jwk: PublicJwk,
    /// Generation time
    pub created_at: DateTime<Utc>,
}

/// DPoP proof claims (JWT payload)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DPoPClaims {
    /// Unique proof ID (prevents replay)
    pub jti: String,
    /// HTTP method
    pub htm: String,
    /// HTTP URI without query or fragment
    pub htu: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Access token hash (for resource server requests)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
}

enum StoredKey {
    Valid(DPoPKeyPair),
    Corrupt,
    Missing,
}

/// DPoP Manager handles per-scope key pairs and proof creation
pub struct DPoPManager {
    store: Arc<dyn CredentialStore>,
    vault: SecretVault,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DPoPManager {
    /// Create a manager over a store and vault
    pub fn new(store: Arc<dyn CredentialStore>, vault: SecretVault) -> Self {
        Self {
            store,
            vault,
            locks: DashMap::new(),
        }
    }

    /// Return the persisted key pair for `scope`, generating it on first use
    ///
    /// Concurrent first calls for one scope converge on a single key pair.
    pub async fn get_or_create_key_pair(&self, scope: &IdentityScope) -> Result<DPoPKeyPair> {
        if let StoredKey::Valid(pair) = self.load(scope).await? {
            return Ok(pair);
        }

        let lock_key = scope.to_string();
        let lock = self
            .locks
            .entry(lock_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.create_key_pair(scope).await
        };

        // Last waiter drops the entry
        let released = Arc::downgrade(&lock);
        drop(lock);
        self.locks.remove_if(&lock_key, |_, held| {
            std::ptr::eq(Arc::as_ptr(held), released.as_ptr()) && Arc::strong_count(held) == 1
        });
        result
    }

    async fn create_key_pair(&self, scope: &IdentityScope) -> Result<DPoPKeyPair> {
        let key = keys::dpop_key_pair(scope);
        match self.load(scope).await? {
            StoredKey::Valid(pair) => return Ok(pair),
            StoredKey::Corrupt => {
                tracing::warn!(scope = %scope, "Replacing unreadable DPoP key material");
                self.store.delete(&key).await?;
            }
            StoredKey::Missing => {}
        }

        let generated = self.generate()?;
        let json = serde_json::to_string(&generated)?;
        if self.store.set_if_absent(&key, json).await? {
            tracing::info!(scope = %scope, "Generated DPoP key pair");
            return Ok(generated);
        }

        // Another process persisted first; its key wins
        match self.load(scope).await? {
            StoredKey::Valid(pair) => Ok(pair),
            _ => Err(Error::proof(format!("DPoP key for {} could not be read back", scope))),
        }
    }

    /// Public JWK for `scope`
    pub async fn public_jwk(&self, scope: &IdentityScope) -> Result<PublicJwk> {
        Ok(self.get_or_create_key_pair(scope).await?.public_jwk)
    }

    /// Create a DPoP proof JWT for one HTTP request
    ///
    /// # Arguments
    /// * `method` - HTTP method, uppercased into `htm`
    /// * `url` - request URL; query and fragment are dropped for `htu`
    /// * `access_token` - when given, its hash is bound as `ath`
    pub async fn mint_proof(
        &self,
        scope: &IdentityScope,
        method: &str,
        url: &str,
        access_token: Option<&str>,
    ) -> Result<String> {
        let pair = self.get_or_create_key_pair(scope).await?;
        let signing_key = self.unseal(&pair)?;

        let der = signing_key
            .to_pkcs8_der()
            .map_err(|e| Error::proof(format!("Failed to encode signing key: {}", e)))?;
        let encoding_key = EncodingKey::from_ec_der(der.as_bytes());

        let mut header = Header::new(Algorithm::ES256);
        header.typ = Some("dpop+jwt".to_string());
        header.jwk = Some(pair.public_jwk.to_header_jwk());

        let claims = DPoPClaims {
            jti: generate_jti(),
            htm: method.to_ascii_uppercase(),
            htu: normalize_htu(url)?,
            iat: Utc::now().timestamp(),
            ath: access_token.map(compute_ath),
        };

        encode(&header, &claims, &encoding_key).map_err(|e| Error::proof(format!("Failed to sign DPoP proof: {}", e)))
    }

    /// Delete the key pair of `scope`; the next proof generates a new one
    pub async fn clear_key_pair(&self, scope: &IdentityScope) -> Result<()> {
        self.store.delete(&keys::dpop_key_pair(scope)).await?;
        tracing::info!(scope = %scope, "Cleared DPoP key pair");
        Ok(())
    }

    async fn load(&self, scope: &IdentityScope) -> Result<StoredKey> {
        let Some(raw) = self.store.get(&keys::dpop_key_pair(scope)).await? else {
            return Ok(StoredKey::Missing);
        };

        let pair: DPoPKeyPair = match serde_json::from_str(&raw) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(scope = %scope, error = %e, "Stored DPoP key is not valid JSON");
                return Ok(StoredKey::Corrupt);
            }
        };

        match self.unseal(&pair) {
            Ok(_) => Ok(StoredKey::Valid(pair)),
            Err(e) => {
                tracing::warn!(scope = %scope, error = %e, "Stored DPoP key cannot be opened");
                Ok(StoredKey::Corrupt)
            }
        }
    }

    fn generate(&self) -> Result<DPoPKeyPair> {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);

        let der = signing_key
            .to_pkcs8_der()
            .map_err(|e| Error::proof(format!("Failed to encode generated key: {}", e)))?;
        let private_key = self
            .vault
            .seal(&STANDARD.encode(der.as_bytes()))
            .map_err(|e| Error::proof(format!("Failed to seal generated key: {}", e)))?;

        Ok(DPoPKeyPair {
            private_key,
            public_jwk: PublicJwk::from_verifying_key(&verifying_key)?,
            created_at: Utc::now(),
        })
    }

    fn unseal(&self, pair: &DPoPKeyPair) -> Result<SigningKey> {
        let encoded = self
            .vault
            .open(&pair.private_key)
            .map_err(|e| Error::proof(format!("Failed to open DPoP key: {}", e)))?;
        let der = STANDARD
            .decode(encoded.expose_secret())
            .map_err(|e| Error::proof(format!("Failed to decode DPoP key: {}", e)))?;
        SigningKey::from_pkcs8_der(&der).map_err(|e| Error::proof(format!("Failed to parse DPoP key: {}", e)))
    }
}

/// Compute access token hash for DPoP proof
pub fn compute_ath(access_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(access_token.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Target URI as bound into `htu`: scheme, authority and path only
pub fn normalize_htu(url: &str) -> Result<String> {
    let mut parsed = Url::parse(url).map_err(|e| Error::proof(format!("Invalid proof target {}: {}", url, e)))?;
    parsed.set_query(None);
    parsed.set_fragment(None);
    Ok(parsed.to_string())
}

fn generate_jti() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCredentialStore;
    use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
    use std::collections::HashSet;

    fn manager() -> DPoPManager {
        DPoPManager::new(Arc::new(MemoryCredentialStore::new()), SecretVault::generate())
    }

    fn payload(proof: &str) -> serde_json::Value {
        let segment = proof.split('.').nth(1).unwrap();
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segment).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_key_pair_is_reused() {
        let manager = manager();
        let scope = IdentityScope::new("acme", "alice");

        let first = manager.get_or_create_key_pair(&scope).await.unwrap();
        let second = manager.get_or_create_key_pair(&scope).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_concurrent_first_calls_converge() {
        let manager = Arc::new(manager());
        let scope = IdentityScope::new("acme", "alice");

        let tasks = (0..8).map(|_| {
            let manager = manager.clone();
            let scope = scope.clone();
            tokio::spawn(async move { manager.get_or_create_key_pair(&scope).await.unwrap() })
        });
        let pairs: Vec<DPoPKeyPair> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(pairs.windows(2).all(|w| w[0] == w[1]));
        assert!(manager.locks.is_empty());
    }

    #[tokio::test]
    async fn test_creation_locks_are_released() {
        let manager = manager();
        for user in ["alice", "bob", "carol"] {
            manager.get_or_create_key_pair(&IdentityScope::new("acme", user)).await.unwrap();
        }
        assert!(manager.locks.is_empty());
    }

    #[tokio::test]
    async fn test_scopes_do_not_share_keys() {
        let manager = manager();
        let a = manager.public_jwk(&IdentityScope::new("t1", "u")).await.unwrap();
        let b = manager.public_jwk(&IdentityScope::new("t2", "u")).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_jti_unique_per_proof() {
        let manager = manager();
        let scope = IdentityScope::process_default();

        let mut seen = HashSet::new();
        for _ in 0..20 {
            let proof = manager
                .mint_proof(&scope, "GET", "https://pod.example/alice/", Some("AT1"))
                .await
                .unwrap();
            assert!(seen.insert(payload(&proof)["jti"].as_str().unwrap().to_string()));
        }
    }

    #[tokio::test]
    async fn test_ath_only_with_token() {
        let manager = manager();
        let scope = IdentityScope::process_default();

        let without = manager.mint_proof(&scope, "post", "https://idp.example/token", None).await.unwrap();
        let claims = payload(&without);
        assert!(claims.get("ath").is_none());
        assert_eq!(claims["htm"], "POST");

        let with = manager.mint_proof(&scope, "GET", "https://pod.example/a", Some("AT1")).await.unwrap();
        assert_eq!(payload(&with)["ath"], compute_ath("AT1"));
    }

    #[tokio::test]
    async fn test_proof_header_and_signature() {
        let manager = manager();
        let scope = IdentityScope::new("acme", "alice");

        let proof = manager
            .mint_proof(&scope, "GET", "https://pod.example/a?x=1#frag", None)
            .await
            .unwrap();

        let header = decode_header(&proof).unwrap();
        assert_eq!(header.typ.as_deref(), Some("dpop+jwt"));
        assert_eq!(header.alg, Algorithm::ES256);
        assert!(header.jwk.is_some());

        let jwk = manager.public_jwk(&scope).await.unwrap();
        let key = DecodingKey::from_ec_components(&jwk.x, &jwk.y).unwrap();
        let mut validation = Validation::new(Algorithm::ES256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        let data = decode::<DPoPClaims>(&proof, &key, &validation).unwrap();
        assert_eq!(data.claims.htu, "https://pod.example/a");
    }

    #[tokio::test]
    async fn test_clear_then_regenerate() {
        let manager = manager();
        let scope = IdentityScope::new("acme", "alice");

        let first = manager.get_or_create_key_pair(&scope).await.unwrap();
        manager.clear_key_pair(&scope).await.unwrap();
        let second = manager.get_or_create_key_pair(&scope).await.unwrap();
        assert_ne!(first.public_jwk, second.public_jwk);
    }

    #[tokio::test]
    async fn test_corrupt_key_is_replaced() {
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = DPoPManager::new(store.clone(), SecretVault::generate());
        let scope = IdentityScope::new("acme", "alice");
        store.set(&keys::dpop_key_pair(&scope), "not json".to_string()).await.unwrap();

        let pair = manager.get_or_create_key_pair(&scope).await.unwrap();
        assert_eq!(pair.public_jwk.crv, "P-256");
    }

    #[test]
    fn test_ath_computation() {
        let ath = compute_ath("test_access_token");
        assert!(!ath.contains('+'));
        assert!(!ath.contains('/'));
        assert!(!ath.contains('='));
        assert_eq!(ath.len(), 43);
    }

    #[test]
    fn test_normalize_htu() {
        assert_eq!(
            normalize_htu("https://pod.example/a/b?c=d#e").unwrap(),
            "https://pod.example/a/b"
        );
        assert!(normalize_htu("not a url").is_err());
    }
}
