use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::warn;

use super::{ChatMessage, Inference};
use crate::core::error::OracleError;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Answer {
    pub content: String,
    pub reasoning: Option<String>,
    pub sources: Vec<String>,
}

/// Wraps the inference backend for the handlers. Transient backend failures
/// surface as retryable errors; anything else becomes a placeholder answer so
/// the request still gets a response on-chain.
pub struct AiDispatcher {
    inference: Arc<dyn Inference>,
    system_prompt: Option<String>,
}

impl AiDispatcher {
    pub fn new(inference: Arc<dyn Inference>, system_prompt: Option<String>) -> Self {
        Self {
            inference,
            system_prompt: system_prompt.filter(|p| !p.trim().is_empty()),
        }
    }

    pub async fn ask(&self, history: &[ChatMessage]) -> Result<Answer, OracleError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: prompt.clone(),
            });
        }
        messages.extend_from_slice(history);

        match self.inference.infer(&messages).await {
            Ok(text) => Ok(parse_answer(&text)),
            Err(e) if e.is_transient() => Err(OracleError::InferenceUnavailable(e.to_string())),
            Err(e) => {
                warn!(error = %e, "inference failed permanently, answering with placeholder");
                Ok(Answer {
                    content: placeholder(&e.to_string()),
                    ..Default::default()
                })
            }
        }
    }
}

pub fn placeholder(reason: &str) -> String {
    format!("[The assistant could not generate a response: {}]", reason)
}

fn think_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\s*<think>(.*?)</think>").expect("valid regex"))
}

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s)\]>"']+"#).expect("valid regex"))
}

/// Split a leading `<think>` block into `reasoning` and collect cited URLs.
pub fn parse_answer(raw: &str) -> Answer {
    let (reasoning, content) = match think_block().captures(raw) {
        Some(caps) => {
            let whole = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let thought = caps
                .get(1)
                .map(|m| m.as_str().trim().to_string())
                .filter(|t| !t.is_empty());
            (thought, raw[whole..].trim().to_string())
        }
        None => (None, raw.trim().to_string()),
    };

    let mut sources: Vec<String> = Vec::new();
    for m in url_pattern().find_iter(&content) {
        let url = m.as_str().trim_end_matches(['.', ',', ';']).to_string();
        if !sources.contains(&url) {
            sources.push(url);
        }
    }

    Answer {
        content,
        reasoning,
        sources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::InferenceError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        result: Mutex<Option<Result<String, InferenceError>>>,
        seen: Mutex<Vec<ChatMessage>>,
    }

    impl Scripted {
        fn new(result: Result<String, InferenceError>) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Some(result)),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Inference for Scripted {
        async fn infer(&self, history: &[ChatMessage]) -> Result<String, InferenceError> {
            *self.seen.lock().unwrap() = history.to_vec();
            self.result.lock().unwrap().take().unwrap()
        }
    }

    fn user(content: &str) -> ChatMessage {
        ChatMessage {
            role: "user".into(),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn system_prompt_is_prepended() {
        let backend = Scripted::new(Ok("fine".into()));
        let ai = AiDispatcher::new(backend.clone(), Some("be brief".into()));
        let answer = ai.ask(&[user("hi")]).await.unwrap();
        assert_eq!(answer.content, "fine");
        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].role, "system");
    }

    #[tokio::test]
    async fn transient_failure_is_retryable() {
        let backend = Scripted::new(Err(InferenceError::Transport("reset".into())));
        let ai = AiDispatcher::new(backend, None);
        assert!(matches!(
            ai.ask(&[user("hi")]).await,
            Err(OracleError::InferenceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn permanent_failure_becomes_placeholder() {
        let backend = Scripted::new(Err(InferenceError::Status {
            provider: "OpenAI".into(),
            status: 400,
            body: "context too long".into(),
        }));
        let ai = AiDispatcher::new(backend, None);
        let answer = ai.ask(&[user("hi")]).await.unwrap();
        assert!(answer.content.starts_with("[The assistant could not generate a response"));
        assert!(answer.content.contains("context too long"));
    }

    #[test]
    fn think_block_becomes_reasoning() {
        let answer = parse_answer("<think>\nweigh options\n</think>\n\nGo with B.");
        assert_eq!(answer.reasoning.as_deref(), Some("weigh options"));
        assert_eq!(answer.content, "Go with B.");
    }

    #[test]
    fn urls_are_collected_once() {
        let answer =
            parse_answer("See https://example.org/a. Also (https://example.org/a) and https://x.io");
        assert_eq!(answer.sources, vec!["https://example.org/a", "https://x.io"]);
        assert!(answer.reasoning.is_none());
    }
}
