//! Encryption at rest for passwords, client secrets and private keys

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::{OsRng, RngCore};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

const NONCE_LEN: usize = 12;

/// Base64 ciphertext produced by [`SecretVault::seal`], nonce first
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sealed(String);

impl Sealed {
    /// Wrap an already sealed value
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Encoded ciphertext
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Sealed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sealed({} bytes)", self.0.len())
    }
}

/// AES-256-GCM sealing of secrets before they reach the credential store
#[derive(Clone)]
pub struct SecretVault {
    cipher: Aes256Gcm,
}

impl SecretVault {
    /// Create a vault from a raw 256-bit key
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::crypto(format!("Failed to create cipher: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Create a vault from a base64 encoded key
    pub fn from_base64_key(key: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(key.trim())
            .map_err(|e| Error::config(format!("Vault key is not valid base64: {}", e)))?;
        if bytes.len() != 32 {
            return Err(Error::config(format!(
                "Vault key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Self::new(&bytes)
    }

    /// Create a vault with a fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let cipher = Aes256Gcm::new(&Key::<Aes256Gcm>::from(key));
        Self { cipher }
    }

    /// Encrypt a secret
    pub fn seal(&self, plaintext: &str) -> Result<Sealed> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::crypto(format!("Encryption failed: {}", e)))?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(Sealed(STANDARD.encode(out)))
    }

    /// Decrypt a sealed secret
    pub fn open(&self, sealed: &Sealed) -> Result<SecretString> {
        let bytes = STANDARD
            .decode(&sealed.0)
            .map_err(|e| Error::crypto(format!("Sealed value is not valid base64: {}", e)))?;
        if bytes.len() < NONCE_LEN {
            return Err(Error::crypto("Ciphertext too short"));
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::from(
            <[u8; NONCE_LEN]>::try_from(nonce_bytes).map_err(|_| Error::crypto("Malformed nonce"))?,
        );
        let plaintext = self
            .cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|e| Error::crypto(format!("Decryption failed: {}", e)))?;

        let text = String::from_utf8(plaintext)
            .map_err(|e| Error::crypto(format!("Decrypted value is not UTF-8: {}", e)))?;
        Ok(SecretString::from(text))
    }
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVault").field("key", &"***REDACTED***").finish()
    }
}
