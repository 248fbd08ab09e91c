//! Credential vault for provider OAuth tokens at rest.
//!
//! Tokens are sealed with AES-256-GCM under a key derived (SHA-256) from the configured
//! secret. The stored form is `base64(nonce || ciphertext)`. Decryption never fails
//! loudly: a payload that cannot be opened yields an empty string, which callers treat
//! as "token unusable".

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

/// Minimum length of the configured secret, in characters.
pub const MIN_KEY_CHARS: usize = 32;

const NONCE_LEN: usize = 12;

/// Vault construction and sealing errors
#[derive(Error, Debug)]
pub enum VaultError {
    /// Secret shorter than [`MIN_KEY_CHARS`]
    #[error("Vault key must be at least {MIN_KEY_CHARS} characters (got {0})")]
    KeyTooShort(usize),

    /// Cipher failure while sealing
    #[error("Encryption failed: {0}")]
    Encryption(String),
}

impl From<VaultError> for crate::error::PipelineError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::KeyTooShort(_) => Self::InvalidConfig(err.to_string()),
            VaultError::Encryption(_) => Self::Vault(err.to_string()),
        }
    }
}

/// Symmetric token encryption.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").field("key", &"[REDACTED]").finish()
    }
}

impl CredentialVault {
    /// Build a vault from the configured secret.
    pub fn new(secret: &str) -> Result<Self, VaultError> {
        let chars = secret.chars().count();
        if chars < MIN_KEY_CHARS {
            return Err(VaultError::KeyTooShort(chars));
        }

        let digest = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(digest.as_slice())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        Ok(Self { cipher })
    }

    /// Seal a token. The empty string stays empty.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&sealed);
        Ok(BASE64.encode(payload))
    }

    /// Open a sealed token, returning `""` when it cannot be opened.
    #[must_use]
    pub fn decrypt(&self, ciphertext: &str) -> String {
        if ciphertext.is_empty() {
            return String::new();
        }

        match self.open(ciphertext) {
            Ok(plaintext) => plaintext,
            Err(reason) => {
                warn!(reason = %reason, "Stored credential could not be decrypted");
                String::new()
            }
        }
    }

    fn open(&self, ciphertext: &str) -> Result<String, String> {
        let payload = BASE64.decode(ciphertext).map_err(|e| e.to_string())?;
        if payload.len() <= NONCE_LEN {
            return Err("payload too short".to_string());
        }

        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        let opened = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| "authentication tag mismatch".to_string())?;

        String::from_utf8(opened).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "a-very-long-test-secret-of-40-characters!";

    #[test]
    fn test_short_key_rejected() {
        let err = CredentialVault::new("short").unwrap_err();
        assert!(matches!(err, VaultError::KeyTooShort(5)));
    }

    #[test]
    fn test_seal_and_open() {
        let vault = CredentialVault::new(SECRET).unwrap();
        let sealed = vault.encrypt("ya29.access-token").unwrap();
        assert_ne!(sealed, "ya29.access-token");
        assert_eq!(vault.decrypt(&sealed), "ya29.access-token");
    }

    #[test]
    fn test_nonce_is_random() {
        let vault = CredentialVault::new(SECRET).unwrap();
        let first = vault.encrypt("token").unwrap();
        let second = vault.encrypt("token").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_empty_passthrough() {
        let vault = CredentialVault::new(SECRET).unwrap();
        assert_eq!(vault.encrypt("").unwrap(), "");
        assert_eq!(vault.decrypt(""), "");
    }

    #[test]
    fn test_wrong_key_yields_empty() {
        let vault = CredentialVault::new(SECRET).unwrap();
        let other = CredentialVault::new("another-secret-that-is-long-enough-000").unwrap();
        let sealed = vault.encrypt("refresh-token").unwrap();
        assert_eq!(other.decrypt(&sealed), "");
    }

    #[test]
    fn test_garbage_yields_empty() {
        let vault = CredentialVault::new(SECRET).unwrap();
        assert_eq!(vault.decrypt("not base64 at all!"), "");
        assert_eq!(vault.decrypt(&BASE64.encode([1u8; 8])), "");
    }

    #[test]
    fn test_debug_redacts_key() {
        let vault = CredentialVault::new(SECRET).unwrap();
        assert!(!format!("{vault:?}").contains(SECRET));
    }
}
