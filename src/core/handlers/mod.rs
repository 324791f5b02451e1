//! Request handlers. One `impl HandlerSet` block per request kind lives in
//! the sibling modules; dispatch is a plain `match` on the event variant.

mod branch;
mod metadata;
mod prompt;
mod regenerate;

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::crypto::{SessionKey, seal_json};
use crate::core::error::OracleError;
use crate::core::events::RequestEvent;
use crate::core::history::HistoryWalker;
use crate::core::keys::{KeyMaterial, SessionKeyResolver};
use crate::core::llm::AiDispatcher;
use crate::core::model::{ConversationMetadata, ConversationRecord, Message};
use crate::core::timing::Clock;
use crate::interfaces::chain::ChainClient;
use crate::interfaces::storage::{
    CONTENT_CONVERSATION, CONTENT_KEY_FILE, CONTENT_METADATA, CONTENT_MESSAGE, ContentStore,
    tags_for,
};

pub use branch::BranchPayload;
pub use metadata::MetadataPayload;
pub use prompt::PromptPayload;
pub use regenerate::RegenerationPayload;

/// Executes one decoded request end to end. Errors always propagate; the
/// caller decides whether they are worth retrying.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &RequestEvent) -> Result<(), OracleError>;
}

pub struct HandlerSet {
    chain: Arc<dyn ChainClient>,
    storage: Arc<dyn ContentStore>,
    keys: SessionKeyResolver,
    history: HistoryWalker,
    ai: AiDispatcher,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl EventHandler for HandlerSet {
    async fn handle(&self, event: &RequestEvent) -> Result<(), OracleError> {
        debug!(kind = %event.kind(), conversation = %event.conversation_id(), "Handling request");
        match event {
            RequestEvent::Prompt(request) => self.handle_prompt(request).await,
            RequestEvent::Regeneration(request) => self.handle_regeneration(request).await,
            RequestEvent::Branch(request) => self.handle_branch(request).await,
            RequestEvent::Metadata(request) => self.handle_metadata(request).await,
        }
    }
}

pub(crate) fn parse_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, OracleError> {
    serde_json::from_slice(payload)
        .map_err(|e| OracleError::Malformed(format!("request payload: {}", e)))
}

impl HandlerSet {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        storage: Arc<dyn ContentStore>,
        keys: SessionKeyResolver,
        history: HistoryWalker,
        ai: AiDispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            chain,
            storage,
            keys,
            history,
            ai,
            clock,
        }
    }

    fn chain_id(&self) -> u64 {
        self.chain.chain_id()
    }

    /// Encrypt `value` under `key` and store it tagged for `conversation_id`.
    async fn upload_sealed<T: Serialize + Sync>(
        &self,
        value: &T,
        key: &SessionKey,
        content_type: &str,
        conversation_id: &str,
    ) -> Result<String, OracleError> {
        let envelope = seal_json(value, key)?;
        let cid = self
            .storage
            .put(
                envelope.into_bytes(),
                &tags_for(content_type, self.chain_id(), conversation_id),
            )
            .await?;
        debug!(%cid, content_type, conversation = conversation_id, "Stored encrypted record");
        Ok(cid)
    }

    async fn upload_message(
        &self,
        message: &Message,
        key: &SessionKey,
    ) -> Result<String, OracleError> {
        self.upload_sealed(message, key, CONTENT_MESSAGE, &message.conversation_id)
            .await
    }

    async fn upload_conversation(
        &self,
        record: &ConversationRecord,
        key: &SessionKey,
    ) -> Result<String, OracleError> {
        self.upload_sealed(record, key, CONTENT_CONVERSATION, &record.id)
            .await
    }

    async fn upload_metadata(
        &self,
        conversation_id: &str,
        metadata: &ConversationMetadata,
        key: &SessionKey,
    ) -> Result<String, OracleError> {
        self.upload_sealed(metadata, key, CONTENT_METADATA, conversation_id)
            .await
    }

    /// Persist the sealed key so later requests without key material can
    /// still be served. Skipped when the request carried no sealed key.
    async fn upload_key_file(
        &self,
        conversation_id: &str,
        keys: &KeyMaterial,
    ) -> Result<Option<String>, OracleError> {
        let Some(sealed) = &keys.encrypted_session_key else {
            return Ok(None);
        };
        let cid = self
            .storage
            .put(
                sealed.clone().into_bytes(),
                &tags_for(CONTENT_KEY_FILE, self.chain_id(), conversation_id),
            )
            .await?;
        info!(conversation = conversation_id, %cid, "Stored key file");
        Ok(Some(cid))
    }
}

fn id_string(id: &U256) -> String {
    id.to_string()
}

fn new_message_id(requested: Option<&str>) -> String {
    requested
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
