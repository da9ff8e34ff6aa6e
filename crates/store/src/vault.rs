//! At-rest encryption for stored BYOK secrets.
//!
//! AES-256-GCM with a key derived from the server-side master secret and
//! a random 96-bit nonce per record. The plaintext never leaves the
//! application process; only nonce + ciphertext are persisted.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use kiln_domain::entities::EncryptedSecret;
use kiln_domain::{Error, Result};
use sha2::{Digest, Sha256};

pub struct KeyVault {
    cipher: Aes256Gcm,
}

impl KeyVault {
    pub fn new(master_secret: &str) -> Self {
        let key = Sha256::digest(master_secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key).expect("SHA-256 digest is a valid AES key");
        Self { cipher }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::Internal(format!("encryption failed: {e}")))?;
        Ok(EncryptedSecret {
            nonce: B64.encode(nonce),
            ciphertext: B64.encode(ciphertext),
        })
    }

    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<String> {
        let nonce_bytes = B64
            .decode(&secret.nonce)
            .map_err(|e| Error::Internal(format!("invalid nonce encoding: {e}")))?;
        let ciphertext = B64
            .decode(&secret.ciphertext)
            .map_err(|e| Error::Internal(format!("invalid ciphertext encoding: {e}")))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| Error::Internal(format!("decryption failed: {e}")))?;
        String::from_utf8(plaintext).map_err(|e| Error::Internal(format!("invalid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let vault = KeyVault::new("master-secret");
        let secret = vault.encrypt("sk-or-v1-abcdef").unwrap();
        assert_ne!(secret.ciphertext, "sk-or-v1-abcdef");
        assert_eq!(vault.decrypt(&secret).unwrap(), "sk-or-v1-abcdef");
    }

    #[test]
    fn nonces_are_unique_per_record() {
        let vault = KeyVault::new("master-secret");
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_master_key_fails_closed() {
        let vault = KeyVault::new("right");
        let secret = vault.encrypt("payload").unwrap();
        let other = KeyVault::new("wrong");
        assert!(other.decrypt(&secret).is_err());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let vault = KeyVault::new("k");
        let mut secret = vault.encrypt("payload").unwrap();
        secret.ciphertext = B64.encode(b"tampered-bytes-here");
        assert!(vault.decrypt(&secret).is_err());
    }
}
