//! Credential store backends
//!
//! This module provides:
//! - `CredentialStore` trait, a key-value seam with per-key atomicity
//! - In-memory backend for tests and single-process deployments
//! - Sled backend for local persistence
//! - JSON helpers and the key layout shared by every component

use crate::error::{Error, Result};
use crate::types::IdentityScope;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Key-value persistence for tokens, keys and registrations
///
/// Implementations only guarantee atomicity per key. Every key written by
/// this crate embeds an identity scope, see [`keys`].
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write or overwrite a value
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove a value; absent keys are not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Write only if no value exists yet. Returns `true` when this call wrote.
    ///
    /// The provided implementation is not atomic; backends override it.
    async fn set_if_absent(&self, key: &str, value: String) -> Result<bool> {
        if self.get(key).await?.is_some() {
            return Ok(false);
        }
        self.set(key, value).await?;
        Ok(true)
    }
}

/// Read and decode a JSON value
pub async fn get_json<T: DeserializeOwned>(store: &dyn CredentialStore, key: &str) -> Result<Option<T>> {
    let Some(value) = store.get(key).await? else {
        return Ok(None);
    };

    let parsed = serde_json::from_str(&value)?;
    Ok(Some(parsed))
}

/// Encode and write a JSON value
pub async fn set_json<T: Serialize + Sync>(store: &dyn CredentialStore, key: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)?;
    store.set(key, json).await
}

/// Key layout
pub mod keys {
    use super::IdentityScope;
    use crate::types::slugify;

    /// Prefix of identity records
    pub const IDENTITY_PREFIX: &str = "identity:";

    /// Identity record
    pub fn identity(scope: &IdentityScope) -> String {
        format!("{IDENTITY_PREFIX}{scope}")
    }

    /// DPoP key pair of one identity
    pub fn dpop_key_pair(scope: &IdentityScope) -> String {
        format!("dpop:keypair:{scope}")
    }

    /// Dynamic client registration of one identity for one client name
    pub fn client_registration(client_name: &str, scope: &IdentityScope) -> String {
        format!("oidc:client:{}:{scope}", slugify(client_name))
    }

    /// Pending authorization request (PKCE verifier and state)
    pub fn pending_authorization(scope: &IdentityScope) -> String {
        format!("oidc:session:{scope}:authorization")
    }
}

/// In-memory credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryCredentialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set_if_absent(&self, key: &str, value: String) -> Result<bool> {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }
}

/// Sled-backed credential store
#[derive(Debug, Clone)]
pub struct SledCredentialStore {
    db: sled::Db,
}

impl SledCredentialStore {
    /// Open or create a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| Error::storage(format!("Failed to open store at {}: {}", path.as_ref().display(), e)))?;
        Ok(Self { db })
    }

    /// Open a store that is removed when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::storage(format!("Non UTF-8 value: {}", e)))
    }
}

#[async_trait]
impl CredentialStore for SledCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.db.get(key.as_bytes())? {
            Some(value) => Ok(Some(Self::decode(&value)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.db.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (k, v) = entry?;
            out.push((Self::decode(&k)?, Self::decode(&v)?));
        }
        Ok(out)
    }

    async fn set_if_absent(&self, key: &str, value: String) -> Result<bool> {
        let swapped = self
            .db
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(value.as_bytes()))?;
        Ok(swapped.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    async fn exercise(store: &dyn CredentialStore) {
        store.set("identity:a:1", "one".to_string()).await.unwrap();
        store.set("identity:a:2", "two".to_string()).await.unwrap();
        store.set("dpop:keypair:a:1", "key".to_string()).await.unwrap();

        assert_eq!(store.get("identity:a:1").await.unwrap().as_deref(), Some("one"));

        let scanned = store.scan_prefix("identity:").await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, "identity:a:1");

        assert!(!store.set_if_absent("identity:a:1", "other".to_string()).await.unwrap());
        assert!(store.set_if_absent("identity:b:1", "fresh".to_string()).await.unwrap());
        assert_eq!(store.get("identity:a:1").await.unwrap().as_deref(), Some("one"));

        store.delete("identity:a:1").await.unwrap();
        store.delete("identity:missing").await.unwrap();
        assert!(store.get("identity:a:1").await.unwrap().is_none());

        let sample = Sample {
            name: "x".to_string(),
            count: 3,
        };
        set_json(store, "json:key", &sample).await.unwrap();
        let loaded: Option<Sample> = get_json(store, "json:key").await.unwrap();
        assert_eq!(loaded, Some(sample));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCredentialStore::new();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sled_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledCredentialStore::open(dir.path().join("creds")).unwrap();
        exercise(&store).await;
        store.flush().await.unwrap();
    }

    #[test]
    fn test_keys_are_scoped() {
        let a = IdentityScope::new("t1", "u1");
        let b = IdentityScope::new("t2", "u1");
        assert_ne!(keys::dpop_key_pair(&a), keys::dpop_key_pair(&b));
        assert_eq!(keys::client_registration("My Client", &a), "oidc:client:my-client:t1:u1");
        assert_eq!(keys::pending_authorization(&a), "oidc:session:t1:u1:authorization");
    }
}
