//! Encryption of access tokens at rest.
//!
//! Facebook user tokens, backup-app tokens and system-user tokens are stored
//! as `ENC:` + base64(nonce || ciphertext || tag) using AES-256-GCM with a key
//! derived from the configured secret via PBKDF2.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::pbkdf2;
use std::num::NonZeroU32;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const PBKDF2_SALT: &[u8] = b"adpilot-token-vault-v1";

/// Prefix that marks a stored value as encrypted
pub const ENCRYPTED_PREFIX: &str = "ENC:";

/// Symmetric cipher for access tokens.
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Derive the cipher key from a human-readable secret.
    pub fn from_secret(secret: &str) -> Self {
        let mut key = [0u8; KEY_LENGTH];
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            PBKDF2_SALT,
            secret.as_bytes(),
            &mut key,
        );
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        use rand::RngCore;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.key).context("Failed to create cipher")?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(&combined)))
    }

    pub fn decrypt(&self, value: &str) -> Result<String> {
        let encoded = value
            .strip_prefix(ENCRYPTED_PREFIX)
            .context("Stored token is missing the encryption prefix")?;
        let combined = BASE64.decode(encoded).context("Failed to decode base64")?;

        if combined.len() <= NONCE_LENGTH {
            anyhow::bail!("Ciphertext too short");
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);
        let cipher = Aes256Gcm::new_from_slice(&self.key).context("Failed to create cipher")?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

        String::from_utf8(plaintext).context("Decrypted token is not valid UTF-8")
    }

    /// Decrypt values written by this cipher, pass through legacy plaintext.
    pub fn reveal(&self, value: &str) -> Result<String> {
        if value.starts_with(ENCRYPTED_PREFIX) {
            self.decrypt(value)
        } else {
            Ok(value.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_secret_same_key() {
        let a = TokenCipher::from_secret("vault-secret");
        let b = TokenCipher::from_secret("vault-secret");
        assert_eq!(a.key, b.key);
        assert_ne!(a.key, TokenCipher::from_secret("other").key);
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let cipher = TokenCipher::from_secret("vault-secret");
        let stored = cipher.encrypt("EAAGm0PX4ZCpsBA").unwrap();
        assert!(stored.starts_with(ENCRYPTED_PREFIX));
        assert!(!stored.contains("EAAGm0PX4ZCpsBA"));
        assert_eq!(cipher.decrypt(&stored).unwrap(), "EAAGm0PX4ZCpsBA");
    }

    #[test]
    fn test_nonce_differs_per_call() {
        let cipher = TokenCipher::from_secret("vault-secret");
        let a = cipher.encrypt("token").unwrap();
        let b = cipher.encrypt("token").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let stored = TokenCipher::from_secret("one").encrypt("token").unwrap();
        assert!(TokenCipher::from_secret("two").decrypt(&stored).is_err());
    }

    #[test]
    fn test_reveal_passes_plaintext_through() {
        let cipher = TokenCipher::from_secret("vault-secret");
        assert_eq!(cipher.reveal("plain-token").unwrap(), "plain-token");
        assert!(cipher.decrypt("plain-token").is_err());
    }
}
