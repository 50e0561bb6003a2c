//! AES-256-GCM session encryption.
//!
//! Every call to [`Encryptor::encrypt`] draws a fresh random nonce and
//! prepends it to the ciphertext:
//!
//! ```text
//! +-------------+------------------------------+
//! | nonce (12)  | ciphertext || tag (16)       |
//! +-------------+------------------------------+
//! ```

use crate::random::random_array;
use crate::{CryptoError, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use std::fmt;

/// Symmetric cipher derived from the SRP shared key.
pub struct Encryptor {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl Encryptor {
    /// Build an encryptor from a 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if `key` is not 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key.len(),
            });
        }
        let digest = Sha256::digest(key);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Ok(Self {
            cipher,
            fingerprint: hex::encode(&digest[..8]),
        })
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] or [`CryptoError::EncryptionFailed`].
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = random_array::<NONCE_SIZE>()?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt data produced by [`Encryptor::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if the input is truncated or
    /// fails authentication.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Short hex identifier of the key, safe to log.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Bytes added to every encrypted payload.
    pub const fn overhead() -> usize {
        NONCE_SIZE + TAG_SIZE
    }
}

impl fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encryptor")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encryptor() -> Encryptor {
        Encryptor::new(&[0x42u8; KEY_SIZE]).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let enc = encryptor();
        let ciphertext = enc.encrypt(b"hello tether").unwrap();
        assert_eq!(ciphertext.len(), b"hello tether".len() + Encryptor::overhead());
        assert_eq!(enc.decrypt(&ciphertext).unwrap(), b"hello tether");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let enc = encryptor();
        let a = enc.encrypt(b"same").unwrap();
        let b = enc.encrypt(b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let enc = encryptor();
        let mut ciphertext = enc.encrypt(b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(matches!(
            enc.decrypt(&ciphertext),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_truncated_input_rejected() {
        let enc = encryptor();
        assert!(enc.decrypt(&[0u8; NONCE_SIZE]).is_err());
        assert!(enc.decrypt(&[]).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let a = encryptor();
        let b = Encryptor::new(&[0x24u8; KEY_SIZE]).unwrap();
        let ciphertext = a.encrypt(b"payload").unwrap();
        assert!(b.decrypt(&ciphertext).is_err());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            Encryptor::new(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_debug_hides_key() {
        let text = format!("{:?}", encryptor());
        assert!(text.contains("fingerprint"));
        assert!(!text.contains("cipher"));
    }
}
