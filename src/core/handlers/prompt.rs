use futures_util::future::try_join4;
use serde::Deserialize;
use tracing::info;

use super::{HandlerSet, id_string, new_message_id, parse_payload};
use crate::core::crypto::decrypt_text;
use crate::core::error::OracleError;
use crate::core::events::JobRequest;
use crate::core::keys::KeyMaterial;
use crate::core::llm::ChatMessage;
use crate::core::model::{
    CidBundle, ConversationMetadata, ConversationRecord, Message, title_from_prompt,
    to_chat_history,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPayload {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub encrypted_prompt: Option<String>,
    #[serde(default)]
    pub parent_message_cid: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub prompt_message_id: Option<String>,
    #[serde(default)]
    pub answer_message_id: Option<String>,
    #[serde(flatten)]
    pub keys: KeyMaterial,
}

impl PromptPayload {
    fn parent(&self) -> Option<&str> {
        self.parent_message_cid
            .as_deref()
            .filter(|cid| !cid.is_empty())
    }
}

impl HandlerSet {
    pub(super) async fn handle_prompt(&self, request: &JobRequest) -> Result<(), OracleError> {
        let payload: PromptPayload = parse_payload(&request.payload)?;
        let conversation_id = id_string(&request.conversation_id);
        let resolved = self.keys.resolve(&conversation_id, &payload.keys).await?;
        let key = &resolved.key;

        let prompt = match (&payload.prompt, &payload.encrypted_prompt) {
            (_, Some(envelope)) => decrypt_text(envelope, key)?,
            (Some(plain), None) => plain.clone(),
            (None, None) => {
                return Err(OracleError::Malformed(
                    "prompt payload carries no prompt".to_string(),
                ));
            }
        };

        let parent = payload.parent();
        let is_new_conversation = parent.is_none();
        let history = self.history.walk(parent, key).await;
        let mut chat = to_chat_history(&history);
        chat.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.clone(),
        });
        let answer = self.ai.ask(&chat).await?;

        let now = self.clock.now_ms();
        let user_message = Message::user(
            new_message_id(payload.prompt_message_id.as_deref()),
            conversation_id.clone(),
            parent.map(str::to_string),
            now,
            prompt.clone(),
        );
        let prompt_cid = self.upload_message(&user_message, key).await?;

        let assistant_message = Message::assistant(
            new_message_id(payload.answer_message_id.as_deref()),
            conversation_id.clone(),
            prompt_cid.clone(),
            now,
            answer,
        );

        let record = ConversationRecord {
            id: conversation_id.clone(),
            owner: request.user.to_string(),
            created_at: now,
            branched_from: None,
        };
        let metadata = ConversationMetadata {
            title: payload
                .title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| title_from_prompt(&prompt)),
            is_deleted: false,
            updated_at: now,
        };

        let (answer_cid, conversation_cid, metadata_cid, _key_file) = try_join4(
            self.upload_message(&assistant_message, key),
            async {
                if is_new_conversation {
                    self.upload_conversation(&record, key).await
                } else {
                    Ok(String::new())
                }
            },
            async {
                if is_new_conversation {
                    self.upload_metadata(&conversation_id, &metadata, key).await
                } else {
                    Ok(String::new())
                }
            },
            async {
                if is_new_conversation {
                    self.upload_key_file(&conversation_id, &payload.keys).await
                } else {
                    Ok(None)
                }
            },
        )
        .await?;

        let bundle = CidBundle {
            conversation_cid,
            metadata_cid,
            prompt_message_cid: prompt_cid,
            answer_message_cid: answer_cid,
            search_delta_cid: String::new(),
        };
        let tx_hash = self.chain.submit_answer(request.job_id, &bundle).await?;
        info!(
            conversation = %conversation_id,
            job = %request.job_id,
            %tx_hash,
            new_conversation = is_new_conversation,
            "Answer submitted"
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
    use crate::core::llm::InferenceError;
    use crate::core::model::Role;
    use crate::interfaces::storage::{CONTENT_KEY_FILE, TAG_CONTENT_TYPE};
    use crate::test_support::Submission;
    use alloy_primitives::U256;
    use serde_json::json;

    fn prompt_event(payload: serde_json::Value) -> RequestEvent {
        RequestEvent::Prompt(JobRequest {
            user: user(),
            conversation_id: U256::from(42u64),
            job_id: U256::from(7u64),
            payload: super::super::fixtures::payload(payload),
        })
    }

    fn answer_bundle(fx: &Fixture) -> CidBundle {
        match fx.chain.submissions().as_slice() {
            [Submission::Answer { job_id, bundle }] => {
                assert_eq!(*job_id, U256::from(7u64));
                bundle.clone()
            }
            other => panic!("unexpected submissions: {:?}", other),
        }
    }

    #[tokio::test]
    async fn new_conversation_uploads_everything() {
        let fx = Fixture::new("<think>hmm</think>Paris.");
        let key = SessionKey::generate();
        let event = prompt_event(json!({
            "encryptedPrompt": encrypt(b"Capital of France?", &key).unwrap(),
            "encryptedSessionKey": fx.sealed(&key),
        }));

        fx.set.handle(&event).await.unwrap();

        let bundle = answer_bundle(&fx);
        assert!(!bundle.conversation_cid.is_empty());
        assert!(!bundle.metadata_cid.is_empty());
        assert_eq!(bundle.search_delta_cid, "");

        let prompt: Message = fx.open(&bundle.prompt_message_cid, &key);
        assert_eq!(prompt.content, "Capital of France?");
        assert_eq!(prompt.parent_id, None);

        let answer: Message = fx.open(&bundle.answer_message_cid, &key);
        assert_eq!(answer.role, Role::Assistant);
        assert_eq!(answer.content, "Paris.");
        assert_eq!(answer.reasoning.as_deref(), Some("hmm"));
        assert_eq!(answer.parent_id.as_deref(), Some(bundle.prompt_message_cid.as_str()));

        let metadata: ConversationMetadata = fx.open(&bundle.metadata_cid, &key);
        assert_eq!(metadata.title, "Capital of France?");
        let record: ConversationRecord = fx.open(&bundle.conversation_cid, &key);
        assert_eq!(record.id, "42");

        assert_eq!(fx.storage.with_tag(TAG_CONTENT_TYPE, CONTENT_KEY_FILE).len(), 1);
    }

    #[tokio::test]
    async fn continued_conversation_sends_history_and_skips_records() {
        let fx = Fixture::new("second answer");
        let key = SessionKey::generate();
        let sealed = fx.sealed(&key);

        fx.set
            .handle(&prompt_event(json!({
                "prompt": "first",
                "encryptedSessionKey": sealed,
                "title": "Trip"
            })))
            .await
            .unwrap();
        let first = answer_bundle(&fx);

        let fx_chain_before = fx.chain.submissions().len();
        fx.set
            .handle(&prompt_event(json!({
                "prompt": "second",
                "parentMessageCid": first.answer_message_cid,
                "encryptedSessionKey": sealed,
            })))
            .await
            .unwrap();

        let submissions = fx.chain.submissions();
        assert_eq!(submissions.len(), fx_chain_before + 1);
        let Submission::Answer { bundle, .. } = &submissions[1] else {
            panic!("expected answer");
        };
        assert_eq!(bundle.conversation_cid, "");
        assert_eq!(bundle.metadata_cid, "");

        let calls = fx.inference.calls();
        let last_call: Vec<&str> = calls[1].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(last_call, vec!["first", "second answer", "second"]);

        let prompt: Message = fx.open(&bundle.prompt_message_cid, &key);
        assert_eq!(prompt.parent_id.as_deref(), Some(first.answer_message_cid.as_str()));
    }

    #[tokio::test]
    async fn missing_key_is_fatal() {
        let fx = Fixture::new("x");
        let err = fx
            .set
            .handle(&prompt_event(json!({ "prompt": "hi" })))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::KeyUnavailable(_)));
        assert_eq!(classify(&err), Disposition::Fatal);
        assert!(fx.storage.is_empty());
    }

    #[tokio::test]
    async fn storage_outage_is_retryable_and_submits_nothing() {
        let fx = Fixture::new("x");
        let key = SessionKey::generate();
        fx.storage.fail_writes(true);
        let err = fx
            .set
            .handle(&prompt_event(json!({
                "prompt": "hi",
                "encryptedSessionKey": fx.sealed(&key),
            })))
            .await
            .unwrap_err();
        assert_eq!(classify(&err), Disposition::Retryable);
        assert!(fx.chain.submissions().is_empty());
    }

    #[tokio::test]
    async fn inference_outage_is_retryable() {
        let fx = Fixture::new("x");
        fx.inference
            .push(Err(InferenceError::Transport("connection reset".into())));
        let key = SessionKey::generate();
        let err = fx
            .set
            .handle(&prompt_event(json!({
                "prompt": "hi",
                "encryptedSessionKey": fx.sealed(&key),
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::InferenceUnavailable(_)));
        assert!(fx.storage.is_empty());
    }

    #[tokio::test]
    async fn payload_without_prompt_is_malformed() {
        let fx = Fixture::new("x");
        let key = SessionKey::generate();
        let err = fx
            .set
            .handle(&prompt_event(json!({ "encryptedSessionKey": fx.sealed(&key) })))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Malformed(_)));
    }
}
