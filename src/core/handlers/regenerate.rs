use serde::Deserialize;
use tracing::info;

use super::{HandlerSet, id_string, new_message_id, parse_payload};
use crate::core::error::OracleError;
use crate::core::events::JobRequest;
use crate::core::keys::KeyMaterial;
use crate::core::model::{CidBundle, Message, Role, to_chat_history};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerationPayload {
    /// The user turn whose answer is being replaced.
    pub prompt_message_cid: String,
    #[serde(default)]
    pub answer_message_id: Option<String>,
    #[serde(flatten)]
    pub keys: KeyMaterial,
}

impl HandlerSet {
    pub(super) async fn handle_regeneration(
        &self,
        request: &JobRequest,
    ) -> Result<(), OracleError> {
        let payload: RegenerationPayload = parse_payload(&request.payload)?;
        if payload.prompt_message_cid.trim().is_empty() {
            return Err(OracleError::Malformed(
                "regeneration payload has no promptMessageCid".to_string(),
            ));
        }
        let conversation_id = id_string(&request.conversation_id);
        let resolved = self.keys.resolve(&conversation_id, &payload.keys).await?;
        let key = &resolved.key;

        let history = self
            .history
            .walk(Some(&payload.prompt_message_cid), key)
            .await;
        match history.last() {
            Some(last) if last.role == Role::User => {}
            Some(_) => {
                return Err(OracleError::Malformed(format!(
                    "{} is not a user message",
                    payload.prompt_message_cid
                )));
            }
            None => {
                return Err(OracleError::Malformed(format!(
                    "prompt {} could not be read",
                    payload.prompt_message_cid
                )));
            }
        }

        let answer = self.ai.ask(&to_chat_history(&history)).await?;
        let assistant_message = Message::assistant(
            new_message_id(payload.answer_message_id.as_deref()),
            conversation_id.clone(),
            payload.prompt_message_cid.clone(),
            self.clock.now_ms(),
            answer,
        );
        let answer_cid = self.upload_message(&assistant_message, key).await?;

        let bundle = CidBundle {
            answer_message_cid: answer_cid,
            ..Default::default()
        };
        let tx_hash = self.chain.submit_answer(request.job_id, &bundle).await?;
        info!(
            conversation = %conversation_id,
            job = %request.job_id,
            %tx_hash,
            "Regenerated answer submitted"
        );
        Ok(())
    }
}
