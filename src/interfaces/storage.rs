use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::core::error::OracleError;

pub const TAG_CONTENT_TYPE: &str = "Content-Type";
pub const TAG_CONVERSATION_SCOPE: &str = "Conversation-Scope";
pub const TAG_APP_NAME: &str = "App-Name";

pub const CONTENT_MESSAGE: &str = "message";
pub const CONTENT_CONVERSATION: &str = "conversation";
pub const CONTENT_METADATA: &str = "metadata";
pub const CONTENT_KEY_FILE: &str = "key-file";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// `<chain-id>/<conversation-id>`, the scope key-file records are tagged with.
pub fn conversation_scope(chain_id: u64, conversation_id: &str) -> String {
    format!("{}/{}", chain_id, conversation_id)
}

pub fn tags_for(content_type: &str, chain_id: u64, conversation_id: &str) -> Vec<Tag> {
    vec![
        Tag::new(TAG_CONTENT_TYPE, content_type),
        Tag::new(
            TAG_CONVERSATION_SCOPE,
            conversation_scope(chain_id, conversation_id),
        ),
    ]
}

/// Content-addressed blob storage.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, data: Vec<u8>, tags: &[Tag]) -> Result<String, OracleError>;
    async fn get(&self, cid: &str) -> Result<Vec<u8>, OracleError>;
    /// Most recent record carrying every tag in `tags`.
    async fn query_by_tags(&self, tags: &[Tag]) -> Result<Option<String>, OracleError>;
}

#[derive(Serialize)]
struct UploadRequest<'a> {
    data: String,
    tags: &'a [Tag],
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(alias = "cid")]
    id: String,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    tags: &'a [Tag],
    limit: u32,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<String>,
}

/// HTTP client for the storage gateway: `POST /upload`, `GET /{cid}`,
/// `POST /query`.
pub struct GatewayStore {
    client: reqwest::Client,
    base: Url,
    api_key: Option<String>,
    app_name: String,
}

impl GatewayStore {
    pub fn new(
        gateway_url: &str,
        api_key: Option<String>,
        app_name: String,
        timeout: Duration,
    ) -> Result<Self, OracleError> {
        let mut base = Url::parse(gateway_url)
            .map_err(|e| OracleError::Malformed(format!("invalid storage gateway url: {}", e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base,
            api_key,
            app_name,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, OracleError> {
        self.base
            .join(path)
            .map_err(|e| OracleError::Malformed(format!("invalid storage path '{}': {}", path, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn check(res: reqwest::Response, op: &str) -> Result<reqwest::Response, OracleError> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(OracleError::Storage(format!(
            "{} returned HTTP {}: {}",
            op, status, body
        )))
    }
}

#[async_trait]
impl ContentStore for GatewayStore {
    async fn put(&self, data: Vec<u8>, tags: &[Tag]) -> Result<String, OracleError> {
        let mut all_tags = Vec::with_capacity(tags.len() + 1);
        all_tags.push(Tag::new(TAG_APP_NAME, self.app_name.clone()));
        all_tags.extend_from_slice(tags);

        let body = UploadRequest {
            data: STANDARD.encode(&data),
            tags: &all_tags,
        };
        let res = self
            .authorize(self.client.post(self.endpoint("upload")?).json(&body))
            .send()
            .await
            .map_err(|e| OracleError::Storage(format!("upload failed: {}", e)))?;
        let res = Self::check(res, "upload").await?;
        let parsed: UploadResponse = res.json().await?;
        debug!(cid = %parsed.id, bytes = data.len(), "uploaded content");
        Ok(parsed.id)
    }

    async fn get(&self, cid: &str) -> Result<Vec<u8>, OracleError> {
        let res = self
            .authorize(self.client.get(self.endpoint(cid)?))
            .send()
            .await
            .map_err(|e| OracleError::Storage(format!("fetch {} failed: {}", cid, e)))?;
        let res = Self::check(res, "fetch").await?;
        let bytes = res
            .bytes()
            .await
            .map_err(|e| OracleError::Storage(format!("fetch {} failed: {}", cid, e)))?;
        Ok(bytes.to_vec())
    }

    async fn query_by_tags(&self, tags: &[Tag]) -> Result<Option<String>, OracleError> {
        let body = QueryRequest { tags, limit: 1 };
        let res = self
            .authorize(self.client.post(self.endpoint("query")?).json(&body))
            .send()
            .await
            .map_err(|e| OracleError::Storage(format!("query failed: {}", e)))?;
        let res = Self::check(res, "query").await?;
        let parsed: QueryResponse = res.json().await?;
        Ok(parsed.ids.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_tag_combines_chain_and_conversation() {
        let tags = tags_for(CONTENT_KEY_FILE, 23295, "42");
        assert_eq!(tags[0], Tag::new("Content-Type", "key-file"));
        assert_eq!(tags[1], Tag::new("Conversation-Scope", "23295/42"));
    }

    #[test]
    fn endpoints_keep_the_base_path() {
        let store = GatewayStore::new(
            "https://gateway.example/v1",
            None,
            "chat-oracle".into(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            store.endpoint("upload").unwrap().as_str(),
            "https://gateway.example/v1/upload"
        );
        assert_eq!(
            store.endpoint("bafybeigdyr").unwrap().as_str(),
            "https://gateway.example/v1/bafybeigdyr"
        );
    }

    #[test]
    fn invalid_gateway_url_is_rejected() {
        assert!(GatewayStore::new("not a url", None, "x".into(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn upload_response_accepts_cid_alias() {
        let parsed: UploadResponse = serde_json::from_str(r#"{"cid":"bafy"}"#).unwrap();
        assert_eq!(parsed.id, "bafy");
    }
}
