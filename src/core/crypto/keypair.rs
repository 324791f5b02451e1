use alloy_primitives::{Address, B256, U256, keccak256};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use std::fmt;

use super::cipher::SessionKey;
use super::sealed::unseal_session_key;
use crate::core::error::OracleError;

/// The oracle's secp256k1 identity: signs transactions and unseals session
/// keys addressed to it.
pub struct OracleKeypair {
    secret: SecretKey,
    address: Address,
}

/// Recoverable ECDSA signature split into its RLP fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub y_parity: u8,
    pub r: U256,
    pub s: U256,
}

pub fn address_of(public_key: &PublicKey) -> Address {
    let uncompressed = public_key.to_encoded_point(false);
    let digest = keccak256(&uncompressed.as_bytes()[1..]);
    Address::from_slice(&digest[12..])
}

impl OracleKeypair {
    pub fn from_hex(raw: &str) -> Result<Self, OracleError> {
        let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
            .map_err(|e| OracleError::Malformed(format!("private key is not hex: {}", e)))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|_| OracleError::Malformed("private key is not a valid scalar".to_string()))?;
        Ok(Self::from_secret(secret))
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let address = address_of(&secret.public_key());
        Self { secret, address }
    }

    pub fn random() -> Self {
        Self::from_secret(SecretKey::random(&mut rand::rngs::OsRng))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    pub fn unseal(&self, sealed: &str) -> Result<SessionKey, OracleError> {
        unseal_session_key(sealed, &self.secret)
    }

    pub fn sign_prehash(&self, digest: &B256) -> Result<RecoverableSignature, OracleError> {
        let signing_key = SigningKey::from(&self.secret);
        let (signature, recovery_id) = signing_key
            .sign_prehash_recoverable(digest.as_slice())
            .map_err(|e| OracleError::Malformed(format!("signing failed: {}", e)))?;
        let bytes = signature.to_bytes();
        Ok(RecoverableSignature {
            y_parity: recovery_id.to_byte(),
            r: U256::from_be_slice(&bytes[..32]),
            s: U256::from_be_slice(&bytes[32..]),
        })
    }
}

impl fmt::Debug for OracleKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OracleKeypair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
