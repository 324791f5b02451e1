pub mod dispatch;
pub mod generic_provider;
pub mod registry;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

pub use dispatch::{AiDispatcher, Answer};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("no inference provider configured: {0}")]
    NotConfigured(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl InferenceError {
    /// Transport failures, rate limiting and upstream 5xx are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::Transport(_) => true,
            InferenceError::Status { status, .. } => *status == 429 || *status >= 500,
            InferenceError::NotConfigured(_) | InferenceError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            InferenceError::Decode(err.to_string())
        } else {
            InferenceError::Transport(err.to_string())
        }
    }
}

/// The opaque "ask(history) -> text" seam used by the handlers.
#[async_trait]
pub trait Inference: Send + Sync {
    async fn infer(&self, history: &[ChatMessage]) -> Result<String, InferenceError>;
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
    ) -> Result<String, InferenceError>;
}

pub struct LlmManager {
    providers: Vec<Box<dyn LlmProvider>>,
    selected_provider: Option<String>,
    selected_model: Option<String>,
}

impl Default for LlmManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmManager {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            selected_provider: None,
            selected_model: None,
        }
    }

    pub fn register_provider(&mut self, provider: Box<dyn LlmProvider>) {
        info!("Registered LLM provider: {}", provider.provider_id());
        self.providers.push(provider);
    }

    pub fn set_active(&mut self, provider_id: &str, model_id: String) {
        info!("Setting active LLM: {} ({})", provider_id, model_id);
        self.selected_provider = Some(provider_id.to_string());
        self.selected_model = Some(model_id);
    }

    pub fn get_provider(&self, provider_id: &str) -> Option<&dyn LlmProvider> {
        self.providers
            .iter()
            .find(|p| p.provider_id() == provider_id)
            .map(|p| p.as_ref())
    }

    pub fn get_active_info(&self) -> (Option<&String>, Option<&String>) {
        (self.selected_provider.as_ref(), self.selected_model.as_ref())
    }

    pub async fn generate_with_selected(
        &self,
        messages: &[ChatMessage],
    ) -> Result<String, InferenceError> {
        let provider_id = self.selected_provider.as_ref().ok_or_else(|| {
            InferenceError::NotConfigured("no provider selected (set AI_PROVIDER)".to_string())
        })?;
        let model_id = self
            .selected_model
            .as_ref()
            .ok_or_else(|| InferenceError::NotConfigured("no model selected".to_string()))?;
        let provider = self.get_provider(provider_id).ok_or_else(|| {
            InferenceError::NotConfigured(format!("provider '{}' is not registered", provider_id))
        })?;

        provider.generate(model_id, messages).await
    }
}

#[async_trait]
impl Inference for LlmManager {
    async fn infer(&self, history: &[ChatMessage]) -> Result<String, InferenceError> {
        self.generate_with_selected(history).await
    }
}
