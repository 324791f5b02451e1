use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::registry::{ApiFormat, AuthType, ProviderDef};
use super::{ChatMessage, InferenceError, LlmProvider};

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageOwned,
}

#[derive(Deserialize)]
struct OpenAiMessageOwned {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

// ── Gemini request/response ──

#[derive(Serialize)]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiResContent,
}

#[derive(Deserialize)]
struct GeminiResContent {
    #[serde(default)]
    parts: Vec<GeminiResPart>,
}

#[derive(Deserialize)]
struct GeminiResPart {
    #[serde(default)]
    text: String,
}

// ── Generic Provider ──

pub struct GenericProvider {
    provider_def: ProviderDef,
    api_key: String,
    client: Client,
}

impl GenericProvider {
    pub fn new(provider_def: ProviderDef, api_key: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            provider_def,
            api_key,
            client,
        }
    }

    fn authorize(&self, mut request: RequestBuilder) -> RequestBuilder {
        for (name, value) in &self.provider_def.extra_headers {
            request = request.header(name, value);
        }
        if self.api_key.is_empty() {
            return request;
        }
        match self.provider_def.auth.auth_type {
            AuthType::Bearer => request.header("Authorization", format!("Bearer {}", self.api_key)),
            AuthType::Header => {
                let name = self
                    .provider_def
                    .auth
                    .header_name
                    .as_deref()
                    .unwrap_or("Authorization");
                request.header(name, &self.api_key)
            }
            // Carried in the URL, see `gemini_url`.
            AuthType::QueryParam => request,
        }
    }

    async fn check_status(&self, res: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
        if res.status().is_success() {
            return Ok(res);
        }
        Err(InferenceError::Status {
            provider: self.provider_def.name.clone(),
            status: res.status().as_u16(),
            body: res.text().await.unwrap_or_default(),
        })
    }

    async fn generate_openai(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
    ) -> Result<String, InferenceError> {
        let req = OpenAiRequest {
            model: model_id,
            messages: messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
        };

        let request = self.authorize(self.client.post(&self.provider_def.base_url).json(&req));
        let res = self.check_status(request.send().await?).await?;
        let parsed: OpenAiResponse = res.json().await?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| InferenceError::Decode("response contained no choices".to_string()))?;

        let content = message.content.unwrap_or_default();
        // Some OpenAI-compatible hosts return reasoning out of band; fold it
        // back in so the dispatcher can split it uniformly.
        Ok(match message.reasoning_content {
            Some(reasoning) if !reasoning.trim().is_empty() => {
                format!("<think>{}</think>{}", reasoning, content)
            }
            _ => content,
        })
    }

    fn gemini_url(&self, model_id: &str) -> String {
        let base = self.provider_def.base_url.replace("{model}", model_id);
        match self.provider_def.auth.auth_type {
            AuthType::QueryParam if !self.api_key.is_empty() => {
                let param_name = self
                    .provider_def
                    .auth
                    .param_name
                    .as_deref()
                    .unwrap_or("key");
                format!("{}?{}={}", base, param_name, self.api_key)
            }
            _ => base,
        }
    }

    async fn generate_gemini(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
    ) -> Result<String, InferenceError> {
        let mut contents: Vec<GeminiContent> = Vec::new();
        let mut system_instruction: Option<GeminiContent> = None;

        for m in messages {
            if m.role == "system" {
                match system_instruction.as_mut().and_then(|si| si.parts.first_mut()) {
                    Some(part) => {
                        part.text.push('\n');
                        part.text.push_str(&m.content);
                    }
                    None => {
                        system_instruction = Some(GeminiContent {
                            role: "user".to_string(),
                            parts: vec![GeminiPart {
                                text: m.content.clone(),
                            }],
                        });
                    }
                }
                continue;
            }

            let gemini_role = if m.role == "assistant" { "model" } else { "user" };
            // Gemini requires strictly alternating roles.
            match contents.last_mut() {
                Some(last) if last.role == gemini_role => {
                    if let Some(part) = last.parts.first_mut() {
                        part.text.push('\n');
                        part.text.push_str(&m.content);
                    }
                }
                _ => contents.push(GeminiContent {
                    role: gemini_role.to_string(),
                    parts: vec![GeminiPart {
                        text: m.content.clone(),
                    }],
                }),
            }
        }

        let req = GeminiRequest {
            system_instruction,
            contents,
        };
        let request = self.authorize(self.client.post(self.gemini_url(model_id)).json(&req));
        let res = self.check_status(request.send().await?).await?;
        let parsed: GeminiResponse = res.json().await?;
        parsed
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| InferenceError::Decode("response contained no candidates".to_string()))
    }
}

#[async_trait]
impl LlmProvider for GenericProvider {
    fn provider_id(&self) -> &str {
        &self.provider_def.id
    }

    async fn generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
    ) -> Result<String, InferenceError> {
        match self.provider_def.api_format {
            ApiFormat::Openai => self.generate_openai(model_id, messages).await,
            ApiFormat::Gemini => self.generate_gemini(model_id, messages).await,
        }
    }
}
