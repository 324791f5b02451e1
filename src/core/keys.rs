use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::crypto::{OracleKeypair, SessionKey};
use crate::core::error::OracleError;
use crate::interfaces::storage::{CONTENT_KEY_FILE, ContentStore, tags_for};

/// Key material a request payload may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMaterial {
    /// Hex key; only honoured on a confidential chain where calldata is
    /// already encrypted in transit.
    #[serde(default)]
    pub session_key: Option<String>,
    /// Hex blob sealed for the oracle's public key.
    #[serde(default)]
    pub encrypted_session_key: Option<String>,
}

impl KeyMaterial {
    pub fn is_empty(&self) -> bool {
        self.session_key.is_none() && self.encrypted_session_key.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Inline,
    Sealed,
    Stored,
}

#[derive(Debug)]
pub struct ResolvedKey {
    pub key: SessionKey,
    pub source: KeySource,
}

pub struct SessionKeyResolver {
    storage: Arc<dyn ContentStore>,
    keypair: Arc<OracleKeypair>,
    confidential: bool,
    chain_id: u64,
}

impl SessionKeyResolver {
    pub fn new(
        storage: Arc<dyn ContentStore>,
        keypair: Arc<OracleKeypair>,
        confidential: bool,
        chain_id: u64,
    ) -> Self {
        Self {
            storage,
            keypair,
            confidential,
            chain_id,
        }
    }

    pub async fn resolve(
        &self,
        conversation_id: &str,
        material: &KeyMaterial,
    ) -> Result<ResolvedKey, OracleError> {
        if let Some(inline) = &material.session_key {
            if self.confidential {
                return Ok(ResolvedKey {
                    key: SessionKey::from_hex(inline)?,
                    source: KeySource::Inline,
                });
            }
            warn!(
                conversation = conversation_id,
                "Ignoring plaintext session key on a public chain"
            );
        }

        if let Some(sealed) = &material.encrypted_session_key {
            return Ok(ResolvedKey {
                key: self.keypair.unseal(sealed)?,
                source: KeySource::Sealed,
            });
        }

        let tags = tags_for(CONTENT_KEY_FILE, self.chain_id, conversation_id);
        let cid = self
            .storage
            .query_by_tags(&tags)
            .await?
            .ok_or_else(|| OracleError::KeyUnavailable(conversation_id.to_string()))?;
        debug!(conversation = conversation_id, %cid, "Loading stored key file");
        let blob = self.storage.get(&cid).await?;
        let sealed = String::from_utf8(blob)
            .map_err(|_| OracleError::Malformed(format!("key file {} is not text", cid)))?;
        Ok(ResolvedKey {
            key: self.keypair.unseal(&sealed)?,
            source: KeySource::Stored,
        })
    }
}
