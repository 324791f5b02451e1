use futures_util::future::try_join3;
use serde::Deserialize;
use tracing::{debug, info};

use super::{HandlerSet, id_string, parse_payload};
use crate::core::error::OracleError;
use crate::core::events::BranchRequest;
use crate::core::keys::KeyMaterial;
use crate::core::model::{
    BranchOrigin, CidBundle, ConversationMetadata, ConversationRecord, Role, title_from_prompt,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchPayload {
    /// Newest message of the source conversation to carry over.
    pub branch_point_message_cid: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Key material for the new conversation.
    #[serde(flatten)]
    pub keys: KeyMaterial,
    /// Key material for the source conversation. Without it the source
    /// conversation's stored key file is used.
    #[serde(default)]
    pub source_keys: Option<KeyMaterial>,
}

impl HandlerSet {
    pub(super) async fn handle_branch(&self, request: &BranchRequest) -> Result<(), OracleError> {
        let payload: BranchPayload = parse_payload(&request.payload)?;
        if payload.branch_point_message_cid.trim().is_empty() {
            return Err(OracleError::Malformed(
                "branch payload has no branchPointMessageCid".to_string(),
            ));
        }
        let source_id = id_string(&request.original_conversation_id);
        let target_id = id_string(&request.new_conversation_id);

        let target = self.keys.resolve(&target_id, &payload.keys).await?;
        let source_material = payload.source_keys.clone().unwrap_or_default();
        let source = self.keys.resolve(&source_id, &source_material).await?;

        let history = self
            .history
            .walk(Some(&payload.branch_point_message_cid), &source.key)
            .await;
        if history.is_empty() {
            return Err(OracleError::Malformed(format!(
                "branch point {} could not be read",
                payload.branch_point_message_cid
            )));
        }

        let now = self.clock.now_ms();
        let first_prompt = history
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        // Parents must be known before a child can reference them.
        let mut parent: Option<String> = None;
        let mut head_role = Role::User;
        for message in history {
            let mut copy = message;
            copy.conversation_id = target_id.clone();
            copy.parent_id = parent.take();
            head_role = copy.role;
            let cid = self.upload_message(&copy, &target.key).await?;
            debug!(conversation = %target_id, %cid, "Copied message into branch");
            parent = Some(cid);
        }
        let head = parent.unwrap_or_default();

        let record = ConversationRecord {
            id: target_id.clone(),
            owner: request.user.to_string(),
            created_at: now,
            branched_from: Some(BranchOrigin {
                conversation_id: source_id.clone(),
                message_cid: payload.branch_point_message_cid.clone(),
            }),
        };
        let metadata = ConversationMetadata {
            title: payload
                .title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| title_from_prompt(&first_prompt)),
            is_deleted: false,
            updated_at: now,
        };

        let (conversation_cid, metadata_cid, _key_file) = try_join3(
            self.upload_conversation(&record, &target.key),
            self.upload_metadata(&target_id, &metadata, &target.key),
            self.upload_key_file(&target_id, &payload.keys),
        )
        .await?;

        let mut bundle = CidBundle {
            conversation_cid,
            metadata_cid,
            ..Default::default()
        };
        match head_role {
            Role::Assistant => bundle.answer_message_cid = head,
            Role::User => bundle.prompt_message_cid = head,
        }

        let tx_hash = self
            .chain
            .submit_branch(request.new_conversation_id, &bundle)
            .await?;
        info!(
            source = %source_id,
            branch = %target_id,
            %tx_hash,
            "Branch submitted"
        );
        Ok(())
    }
}
