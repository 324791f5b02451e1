use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

use crate::core::error::OracleError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
const DELIMITER: char = ':';

/// Per-conversation symmetric key. Lives only for one handler invocation;
/// the bytes are wiped when it is dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, OracleError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            OracleError::Malformed(format!(
                "session key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Parse a hex key with or without the `0x` prefix.
    pub fn from_hex(raw: &str) -> Result<Self, OracleError> {
        let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
            .map_err(|e| OracleError::Malformed(format!("session key is not hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(self.0.as_slice().into())
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Encrypt `plaintext` into `base64(nonce):base64(ciphertext || tag)`.
pub fn encrypt(plaintext: &[u8], key: &SessionKey) -> Result<String, OracleError> {
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| OracleError::Decryption(format!("encryption failed: {}", e)))?;

    Ok(format!(
        "{}{}{}",
        STANDARD.encode(nonce_bytes),
        DELIMITER,
        STANDARD.encode(ciphertext)
    ))
}

/// Split and verify an envelope produced by [`encrypt`]. Fails closed on
/// any shape problem or tag mismatch.
pub fn decrypt(envelope: &str, key: &SessionKey) -> Result<Vec<u8>, OracleError> {
    let fields: Vec<&str> = envelope.trim().split(DELIMITER).collect();
    if fields.len() != 2 {
        return Err(OracleError::Decryption(format!(
            "envelope must have 2 fields, found {}",
            fields.len()
        )));
    }

    let nonce_bytes = STANDARD
        .decode(fields[0])
        .map_err(|e| OracleError::Decryption(format!("nonce is not base64: {}", e)))?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(OracleError::Decryption(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LEN,
            nonce_bytes.len()
        )));
    }
    let ciphertext = STANDARD
        .decode(fields[1])
        .map_err(|e| OracleError::Decryption(format!("ciphertext is not base64: {}", e)))?;

    key.cipher()
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|_| OracleError::Decryption("authentication tag mismatch".to_string()))
}

pub fn decrypt_text(envelope: &str, key: &SessionKey) -> Result<String, OracleError> {
    let bytes = decrypt(envelope, key)?;
    String::from_utf8(bytes)
        .map_err(|e| OracleError::Decryption(format!("plaintext is not UTF-8: {}", e)))
}

pub fn seal_json<T: Serialize>(value: &T, key: &SessionKey) -> Result<String, OracleError> {
    let bytes = serde_json::to_vec(value)?;
    encrypt(&bytes, key)
}

pub fn open_json<T: DeserializeOwned>(envelope: &str, key: &SessionKey) -> Result<T, OracleError> {
    let bytes = decrypt(envelope, key)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| OracleError::Decryption(format!("decrypted payload is not valid: {}", e)))
}
