use serde::{Deserialize, Serialize};

use crate::core::llm::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One node of a conversation's history chain. `parent_id` is the CID of the
/// previous message, so a chain can only be read newest-to-oldest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub created_at: u64,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Message {
    pub fn user(
        id: String,
        conversation_id: String,
        parent_id: Option<String>,
        created_at: u64,
        content: String,
    ) -> Self {
        Self {
            id,
            conversation_id,
            parent_id,
            created_at,
            role: Role::User,
            content,
            sources: Vec::new(),
            reasoning: None,
        }
    }

    pub fn assistant(
        id: String,
        conversation_id: String,
        parent_id: String,
        created_at: u64,
        answer: crate::core::llm::Answer,
    ) -> Self {
        Self {
            id,
            conversation_id,
            parent_id: Some(parent_id),
            created_at,
            role: Role::Assistant,
            content: answer.content,
            sources: answer.sources,
            reasoning: answer.reasoning,
        }
    }
}

pub fn to_chat_history(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| ChatMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        })
        .collect()
}

/// Content addresses produced by one handler invocation. The on-chain schema
/// is fixed, so fields not produced in a call stay as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidBundle {
    #[serde(rename = "conversationCID")]
    pub conversation_cid: String,
    #[serde(rename = "metadataCID")]
    pub metadata_cid: String,
    #[serde(rename = "promptMessageCID")]
    pub prompt_message_cid: String,
    #[serde(rename = "answerMessageCID")]
    pub answer_message_cid: String,
    #[serde(rename = "searchDeltaCID")]
    pub search_delta_cid: String,
}

impl CidBundle {
    pub fn fields(&self) -> [&str; 5] {
        [
            &self.conversation_cid,
            &self.metadata_cid,
            &self.prompt_message_cid,
            &self.answer_message_cid,
            &self.search_delta_cid,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchOrigin {
    pub conversation_id: String,
    pub message_cid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: String,
    pub owner: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branched_from: Option<BranchOrigin>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetadata {
    pub title: String,
    #[serde(default)]
    pub is_deleted: bool,
    pub updated_at: u64,
}

const TITLE_MAX_CHARS: usize = 60;

/// Derive a conversation title from the opening prompt.
pub fn title_from_prompt(prompt: &str) -> String {
    let line = prompt.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.is_empty() {
        return "New conversation".to_string();
    }
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let truncated: String = line.chars().take(TITLE_MAX_CHARS - 1).collect();
    format!("{}…", truncated.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bundle_serializes_empty_strings_not_nulls() {
        let bundle = CidBundle {
            answer_message_cid: "bafy-answer".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["conversationCID"], "");
        assert_eq!(json["answerMessageCID"], "bafy-answer");
        assert_eq!(json["searchDeltaCID"], "");
    }

    #[test]
    fn message_uses_camel_case_and_skips_assistant_fields_for_user() {
        let msg = Message::user(
            "m1".into(),
            "7".into(),
            Some("parent-cid".into()),
            1_700_000_000_000,
            "hi".into(),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["conversationId"], "7");
        assert_eq!(json["parentId"], "parent-cid");
        assert_eq!(json["role"], "user");
        assert!(json.get("sources").is_none());
        assert!(json.get("reasoning").is_none());
    }

    #[test]
    fn titles_are_trimmed_and_truncated() {
        assert_eq!(title_from_prompt("\n  Plan a trip  \nmore"), "Plan a trip");
        assert_eq!(title_from_prompt("   "), "New conversation");
        let long = "x".repeat(100);
        let title = title_from_prompt(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
        assert!(title.ends_with('…'));
    }
}
