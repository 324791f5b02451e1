use alloy_primitives::{Address, B256, U256};
use serde::Deserialize;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::Receipt;
use crate::core::error::OracleError;
use crate::core::events::ChainLog;

/// Thin JSON-RPC 2.0 client over HTTP.
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    transaction_index: Option<String>,
    log_index: Option<String>,
    transaction_hash: Option<String>,
    #[serde(default)]
    block_timestamp: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: String,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

pub(crate) fn parse_hex_u64(raw: &str, field: &str) -> Result<u64, OracleError> {
    let value = raw.trim();
    let without_prefix = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| OracleError::Malformed(format!("{field} must be 0x-prefixed hex")))?;
    u64::from_str_radix(without_prefix, 16)
        .map_err(|e| OracleError::Malformed(format!("failed to parse {field} as hex u64: {e}")))
}

pub(crate) fn parse_hex_u256(raw: &str, field: &str) -> Result<U256, OracleError> {
    U256::from_str(raw.trim())
        .map_err(|e| OracleError::Malformed(format!("failed to parse {field} as u256: {e}")))
}

fn parse_b256(raw: &str, field: &str) -> Result<B256, OracleError> {
    B256::from_str(raw.trim())
        .map_err(|e| OracleError::Malformed(format!("failed to parse {field}: {e}")))
}

fn parse_hex_bytes(raw: &str, field: &str) -> Result<Vec<u8>, OracleError> {
    hex::decode(raw.trim().trim_start_matches("0x"))
        .map_err(|e| OracleError::Malformed(format!("{field} must be valid hex: {e}")))
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, OracleError> {
    value
        .as_deref()
        .ok_or_else(|| OracleError::Malformed(format!("log is missing {field}")))
}

impl RpcLog {
    fn into_chain_log(self) -> Result<ChainLog, OracleError> {
        Ok(ChainLog {
            address: Address::from_str(&self.address)
                .map_err(|e| OracleError::Malformed(format!("log address: {e}")))?,
            topics: self
                .topics
                .iter()
                .map(|t| parse_b256(t, "topic"))
                .collect::<Result<_, _>>()?,
            data: parse_hex_bytes(&self.data, "log data")?,
            block_number: parse_hex_u64(required(&self.block_number, "blockNumber")?, "blockNumber")?,
            transaction_index: parse_hex_u64(
                required(&self.transaction_index, "transactionIndex")?,
                "transactionIndex",
            )?,
            log_index: parse_hex_u64(required(&self.log_index, "logIndex")?, "logIndex")?,
            transaction_hash: parse_b256(
                required(&self.transaction_hash, "transactionHash")?,
                "transactionHash",
            )?,
            block_timestamp: self
                .block_timestamp
                .as_deref()
                .map(|t| parse_hex_u64(t, "blockTimestamp"))
                .transpose()?,
        })
    }
}

impl RpcClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Network(e.to_string()))?;
        Ok(Self {
            client,
            url,
            next_id: AtomicU64::new(1),
        })
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, OracleError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });
        let res = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Network(format!("{method}: {e}")))?;
        if !res.status().is_success() {
            return Err(OracleError::Rpc(format!(
                "{method} returned HTTP {}",
                res.status().as_u16()
            )));
        }
        let mut value: Value = res.json().await?;
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(OracleError::Rpc(format!("{method}: {message}")));
        }
        value
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| OracleError::Malformed(format!("{method} result was missing")))
    }

    async fn call_str(&self, method: &str, params: Value) -> Result<String, OracleError> {
        self.call(method, params)
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| OracleError::Malformed(format!("{method} result was not a string")))
    }

    pub async fn block_number(&self) -> Result<u64, OracleError> {
        let raw = self.call_str("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&raw, "eth_blockNumber")
    }

    pub async fn block_timestamp(&self, block: u64) -> Result<u64, OracleError> {
        let block_value = self
            .call("eth_getBlockByNumber", json!([format!("0x{block:x}"), false]))
            .await?;
        let raw = block_value
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| OracleError::Malformed(format!("block {block} has no timestamp")))?;
        parse_hex_u64(raw, "timestamp")
    }

    pub async fn base_fee(&self) -> Result<Option<U256>, OracleError> {
        let block_value = self
            .call("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        block_value
            .get("baseFeePerGas")
            .and_then(Value::as_str)
            .map(|raw| parse_hex_u256(raw, "baseFeePerGas"))
            .transpose()
    }

    /// `eth_getLogs` for `address`, where `topic0` is any of the given
    /// signatures.
    pub async fn get_logs(
        &self,
        address: Address,
        topic0: &[B256],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainLog>, OracleError> {
        let topics: Vec<String> = topic0.iter().map(|t| t.to_string()).collect();
        let filter = json!({
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
            "address": address.to_string(),
            "topics": [topics],
        });
        let raw = self.call("eth_getLogs", json!([filter])).await?;
        let logs: Vec<RpcLog> = serde_json::from_value(raw)?;
        logs.into_iter().map(RpcLog::into_chain_log).collect()
    }

    pub async fn eth_call(&self, to: Address, calldata: &[u8]) -> Result<Vec<u8>, OracleError> {
        let raw = self
            .call_str(
                "eth_call",
                json!([{ "to": to.to_string(), "data": format!("0x{}", hex::encode(calldata)) }, "latest"]),
            )
            .await?;
        parse_hex_bytes(&raw, "eth_call result")
    }

    pub async fn transaction_count(&self, address: Address) -> Result<u64, OracleError> {
        let raw = self
            .call_str(
                "eth_getTransactionCount",
                json!([address.to_string(), "pending"]),
            )
            .await?;
        parse_hex_u64(&raw, "eth_getTransactionCount")
    }

    pub async fn gas_price(&self) -> Result<U256, OracleError> {
        let raw = self.call_str("eth_gasPrice", json!([])).await?;
        parse_hex_u256(&raw, "eth_gasPrice")
    }

    pub async fn max_priority_fee(&self) -> Result<U256, OracleError> {
        let raw = self.call_str("eth_maxPriorityFeePerGas", json!([])).await?;
        parse_hex_u256(&raw, "eth_maxPriorityFeePerGas")
    }

    pub async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        calldata: &[u8],
    ) -> Result<u64, OracleError> {
        let raw = self
            .call_str(
                "eth_estimateGas",
                json!([{
                    "from": from.to_string(),
                    "to": to.to_string(),
                    "data": format!("0x{}", hex::encode(calldata)),
                }]),
            )
            .await?;
        parse_hex_u64(&raw, "eth_estimateGas")
    }

    pub async fn send_raw_transaction(&self, raw_tx: &[u8]) -> Result<B256, OracleError> {
        let raw = self
            .call_str(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw_tx))]),
            )
            .await?;
        parse_b256(&raw, "eth_sendRawTransaction result")
    }

    pub async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, OracleError> {
        let raw = self
            .call("eth_getTransactionReceipt", json!([tx_hash.to_string()]))
            .await?;
        if raw.is_null() {
            return Ok(None);
        }
        let receipt: RpcReceipt = serde_json::from_value(raw)?;
        Ok(Some(Receipt {
            transaction_hash: parse_b256(&receipt.transaction_hash, "transactionHash")?,
            block_number: parse_hex_u64(&receipt.block_number, "blockNumber")?,
            success: receipt.status.as_deref().map(|s| s == "0x1").unwrap_or(true),
            logs: receipt
                .logs
                .into_iter()
                .map(RpcLog::into_chain_log)
                .collect::<Result<_, _>>()?,
        }))
    }
}
