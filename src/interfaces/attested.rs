use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::OracleError;

/// A signer running inside an attested environment, trusted by the contract
/// to perform privileged calls such as `setOracle`.
#[async_trait]
pub trait AttestedSigner: Send + Sync {
    async fn submit(&self, to: Address, calldata: &[u8]) -> Result<B256, OracleError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    to: String,
    data: String,
    chain_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    tx_hash: String,
}

pub struct HttpAttestedSigner {
    client: reqwest::Client,
    url: String,
    chain_id: u64,
}

impl HttpAttestedSigner {
    pub fn new(url: String, chain_id: u64, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url,
            chain_id,
        }
    }
}

#[async_trait]
impl AttestedSigner for HttpAttestedSigner {
    async fn submit(&self, to: Address, calldata: &[u8]) -> Result<B256, OracleError> {
        let body = SubmitRequest {
            to: to.to_string(),
            data: format!("0x{}", hex::encode(calldata)),
            chain_id: self.chain_id,
        };
        let res = self.client.post(&self.url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(OracleError::Rpc(format!(
                "attested signer returned HTTP {}: {}",
                status, text
            )));
        }
        let parsed: SubmitResponse = res.json().await?;
        B256::from_str(&parsed.tx_hash)
            .map_err(|e| OracleError::Malformed(format!("attested signer tx hash: {}", e)))
    }
}
