//! Session keys sealed for the oracle's secp256k1 public key.
//!
//! Layout (hex, `0x`-prefixed): `ephemeral_pubkey[33] || nonce[12] || ciphertext+tag[48]`.
//! The wrapping key is HKDF-SHA256 over the ECDH shared x-coordinate, salted
//! with the ephemeral public key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::Sha256;

use super::cipher::{KEY_LEN, NONCE_LEN, SessionKey};
use crate::core::error::OracleError;

const EPHEMERAL_LEN: usize = 33;
const TAG_LEN: usize = 16;
const SEALED_LEN: usize = EPHEMERAL_LEN + NONCE_LEN + KEY_LEN + TAG_LEN;
const HKDF_INFO: &[u8] = b"chat-oracle/session-key/v1";

fn wrapping_cipher(
    secret: &SecretKey,
    peer: &PublicKey,
    ephemeral_bytes: &[u8],
) -> Result<Aes256Gcm, OracleError> {
    let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    let hk = Hkdf::<Sha256>::new(Some(ephemeral_bytes), shared.raw_secret_bytes().as_slice());
    let mut okm = [0u8; KEY_LEN];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|e| OracleError::Decryption(format!("hkdf expand failed: {:?}", e)))?;
    let cipher = Aes256Gcm::new_from_slice(&okm)
        .map_err(|e| OracleError::Decryption(format!("wrapping key rejected: {}", e)));
    okm.iter_mut().for_each(|b| *b = 0);
    cipher
}

/// Seal `key` so only the holder of `recipient`'s secret can recover it.
pub fn seal_session_key(key: &SessionKey, recipient: &PublicKey) -> Result<String, OracleError> {
    let ephemeral = SecretKey::random(&mut OsRng);
    let ephemeral_point = ephemeral.public_key().to_encoded_point(true);
    let ephemeral_bytes = ephemeral_point.as_bytes();

    let cipher = wrapping_cipher(&ephemeral, recipient, ephemeral_bytes)?;
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), key.as_bytes().as_slice())
        .map_err(|e| OracleError::Decryption(format!("sealing failed: {}", e)))?;

    let mut out = Vec::with_capacity(SEALED_LEN);
    out.extend_from_slice(ephemeral_bytes);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(format!("0x{}", hex::encode(out)))
}

/// Recover a session key sealed by [`seal_session_key`].
pub fn unseal_session_key(sealed: &str, secret: &SecretKey) -> Result<SessionKey, OracleError> {
    let raw = hex::decode(sealed.trim().trim_start_matches("0x"))
        .map_err(|e| OracleError::Decryption(format!("sealed key is not hex: {}", e)))?;
    if raw.len() != SEALED_LEN {
        return Err(OracleError::Decryption(format!(
            "sealed key must be {} bytes, got {}",
            SEALED_LEN,
            raw.len()
        )));
    }

    let (ephemeral_bytes, rest) = raw.split_at(EPHEMERAL_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
    let ephemeral = PublicKey::from_sec1_bytes(ephemeral_bytes)
        .map_err(|_| OracleError::Decryption("invalid ephemeral public key".to_string()))?;

    let cipher = wrapping_cipher(secret, &ephemeral, ephemeral_bytes)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| OracleError::Decryption("sealed key failed authentication".to_string()))?;
    SessionKey::from_slice(&plaintext)
}
