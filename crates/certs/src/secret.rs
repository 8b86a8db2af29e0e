//! Symmetric sealing of the account signing key.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;

use crate::error::SecretError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypts secrets at rest
pub trait SecretBox: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecretError>;
    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SecretError>;
}

/// AES-256-GCM secret box
///
/// Sealed output is `nonce (12 bytes) || ciphertext || tag`, with a fresh
/// random nonce per call.
#[derive(Clone)]
pub struct AesGcmBox {
    cipher: Aes256Gcm,
}

impl AesGcmBox {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(key)),
        }
    }

    /// Build from a base64-encoded 256-bit key, as printed by `newkey`
    pub fn from_key_string(encoded: &str) -> Result<Self, SecretError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| SecretError::InvalidKey(format!("not valid base64: {}", e)))?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            SecretError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self::new(&key))
    }
}

impl SecretBox for AesGcmBox {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecretError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| SecretError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SecretError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(SecretError::Open("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        self.cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::Open("authentication failed".to_string()))
    }
}

impl std::fmt::Debug for AesGcmBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmBox").finish_non_exhaustive()
    }
}

/// Generate a random base64-encoded key for [`AesGcmBox::from_key_string`]
pub fn generate_key_string() -> String {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    STANDARD.encode(key)
}
