use serde::Deserialize;
use tracing::info;

use super::{HandlerSet, id_string, parse_payload};
use crate::core::crypto::decrypt_text;
use crate::core::error::OracleError;
use crate::core::events::MetadataRequest;
use crate::core::keys::KeyMaterial;
use crate::core::model::ConversationMetadata;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub encrypted_title: Option<String>,
    #[serde(default)]
    pub is_deleted: Option<bool>,
    #[serde(flatten)]
    pub keys: KeyMaterial,
}

impl HandlerSet {
    pub(super) async fn handle_metadata(
        &self,
        request: &MetadataRequest,
    ) -> Result<(), OracleError> {
        let payload: MetadataPayload = parse_payload(&request.payload)?;
        let conversation_id = id_string(&request.conversation_id);
        let resolved = self.keys.resolve(&conversation_id, &payload.keys).await?;

        let title = match (&payload.title, &payload.encrypted_title) {
            (Some(plain), _) => plain.clone(),
            (None, Some(envelope)) => decrypt_text(envelope, &resolved.key)?,
            (None, None) => String::new(),
        };
        let metadata = ConversationMetadata {
            title,
            is_deleted: payload.is_deleted.unwrap_or(false),
            updated_at: self.clock.now_ms(),
        };

        let metadata_cid = self
            .upload_metadata(&conversation_id, &metadata, &resolved.key)
            .await?;
        let tx_hash = self
            .chain
            .submit_metadata(request.conversation_id, &metadata_cid)
            .await?;
        info!(
            conversation = %conversation_id,
            deleted = metadata.is_deleted,
            %tx_hash,
            "Metadata submitted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::EventHandler;
    use super::super::fixtures::*;
    use super::*;
    use crate::core::crypto::{SessionKey, encrypt};
    use crate::core::error::{Disposition, classify};
    use crate::core::events::RequestEvent;
    use crate::interfaces::storage::{
        CONTENT_METADATA, TAG_CONTENT_TYPE, TAG_CONVERSATION_SCOPE, conversation_scope,
    };
    use crate::test_support::Submission;
    use alloy_primitives::U256;
    use serde_json::json;

    fn metadata_event(body: serde_json::Value) -> RequestEvent {
        RequestEvent::Metadata(MetadataRequest {
            user: user(),
            conversation_id: U256::from(77u64),
            payload: payload(body),
        })
    }

    fn submitted_cid(fx: &Fixture) -> String {
        match fx.chain.submissions().pop() {
            Some(Submission::Metadata {
                conversation_id,
                metadata_cid,
            }) => {
                assert_eq!(conversation_id, U256::from(77u64));
                metadata_cid
            }
            other => panic!("expected metadata submission, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn encrypted_title_is_decrypted_and_resealed() {
        let fx = Fixture::new("unused");
        let key = SessionKey::generate();
        fx.set
            .handle(&metadata_event(json!({
                "encryptedTitle": encrypt(b"Renamed", &key).unwrap(),
                "encryptedSessionKey": fx.sealed(&key),
            })))
            .await
            .unwrap();

        let cid = submitted_cid(&fx);
        let metadata: ConversationMetadata = fx.open(&cid, &key);
        assert_eq!(metadata.title, "Renamed");
        assert!(!metadata.is_deleted);
        assert_eq!(metadata.updated_at, NOW_MS);

        let blob = fx.storage.blob(&cid).unwrap();
        assert_eq!(blob.tag(TAG_CONTENT_TYPE), Some(CONTENT_METADATA));
        assert_eq!(
            blob.tag(TAG_CONVERSATION_SCOPE),
            Some(conversation_scope(CHAIN_ID, "77").as_str())
        );
        assert!(fx.inference.calls().is_empty());
    }

    #[tokio::test]
    async fn deletion_without_title_keeps_empty_title() {
        let fx = Fixture::new("unused");
        let key = SessionKey::generate();
        fx.set
            .handle(&metadata_event(json!({
                "isDeleted": true,
                "encryptedSessionKey": fx.sealed(&key),
            })))
            .await
            .unwrap();

        let metadata: ConversationMetadata = fx.open(&submitted_cid(&fx), &key);
        assert_eq!(metadata.title, "");
        assert!(metadata.is_deleted);
    }

    #[tokio::test]
    async fn submit_revert_is_fatal() {
        let fx = Fixture::new("unused");
        fx.chain.fail_next_submit(OracleError::Reverted {
            tx_hash: "0xdead".to_string(),
        });
        let key = SessionKey::generate();
        let err = fx
            .set
            .handle(&metadata_event(json!({
                "title": "t",
                "encryptedSessionKey": fx.sealed(&key),
            })))
            .await
            .unwrap_err();
        assert_eq!(classify(&err), Disposition::Fatal);
    }
}
