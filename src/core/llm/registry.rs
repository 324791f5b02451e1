use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const PROVIDERS_JSON: &str = include_str!("providers.json");

/// Inference providers compiled into the binary.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDef {
    pub id: String,
    pub name: String,
    pub api_format: ApiFormat,
    pub base_url: String,
    pub auth: AuthConfig,
    pub default_model: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFormat {
    Openai,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub param_name: Option<String>,
    /// Header carrying a raw key when `auth_type` is `header`.
    #[serde(default)]
    pub header_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Bearer,
    QueryParam,
    Header,
}

impl ProviderRegistry {
    pub fn embedded() -> Result<Self, serde_json::Error> {
        serde_json::from_str(PROVIDERS_JSON)
    }

    /// The provider configured as `key` (its id or display name, any case),
    /// pointed at `base_url` when the deployment overrides the endpoint.
    pub fn resolve(&self, key: &str, base_url: Option<&str>) -> Option<ProviderDef> {
        let key = key.trim();
        let mut def = self
            .providers
            .iter()
            .find(|p| p.id.eq_ignore_ascii_case(key) || p.name.eq_ignore_ascii_case(key))?
            .clone();
        if let Some(url) = base_url {
            def.base_url = url.to_string();
        }
        Some(def)
    }
}
