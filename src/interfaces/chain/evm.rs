use alloy_primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rpc::RpcClient;
use super::tx::Eip1559Tx;
use super::{ChainClient, Receipt, contract};
use crate::core::config::ChainConfig;
use crate::core::crypto::OracleKeypair;
use crate::core::error::OracleError;
use crate::core::events::{ChainLog, EventKind, ObservedEvent, decode_log};
use crate::core::model::CidBundle;

const SUBSCRIPTION_BUFFER: usize = 256;
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Gas estimate headroom, in percent.
const GAS_LIMIT_MARGIN_PCT: u64 = 120;

/// JSON-RPC backed [`ChainClient`] that signs its own transactions.
pub struct EvmChain {
    rpc: Arc<RpcClient>,
    keypair: Arc<OracleKeypair>,
    contract: Address,
    chain_id: u64,
    poll_interval: Duration,
    max_block_range: u64,
    receipt_timeout: Duration,
    // Serializes nonce allocation and broadcast.
    send_lock: Mutex<()>,
}

impl EvmChain {
    pub fn new(config: &ChainConfig, keypair: Arc<OracleKeypair>) -> Result<Self, OracleError> {
        let contract = Address::from_str(config.contract_address.trim())
            .map_err(|e| OracleError::Malformed(format!("invalid contract address: {}", e)))?;
        let rpc = RpcClient::new(
            config.rpc_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(Self {
            rpc: Arc::new(rpc),
            keypair,
            contract,
            chain_id: config.chain_id,
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            max_block_range: config.max_block_range.max(1),
            receipt_timeout: Duration::from_secs(config.receipt_timeout_secs),
            send_lock: Mutex::new(()),
        })
    }

    async fn fees(&self) -> Result<(U256, U256), OracleError> {
        let gas_price = self.rpc.gas_price().await?;
        let priority = match self.rpc.max_priority_fee().await {
            Ok(fee) => fee.min(gas_price),
            Err(e) => {
                debug!("eth_maxPriorityFeePerGas unavailable ({}), using gas price", e);
                gas_price
            }
        };
        let base_fee = self.rpc.base_fee().await?.unwrap_or(gas_price);
        let max_fee = base_fee.saturating_mul(U256::from(2u64)).saturating_add(priority);
        Ok((priority, max_fee))
    }

    async fn send(&self, calldata: Vec<u8>) -> Result<B256, OracleError> {
        let _guard = self.send_lock.lock().await;
        let from = self.keypair.address();
        let nonce = self.rpc.transaction_count(from).await?;
        let gas = self.rpc.estimate_gas(from, self.contract, &calldata).await?;
        let (priority, max_fee) = self.fees().await?;

        let tx = Eip1559Tx {
            chain_id: U256::from(self.chain_id),
            nonce: U256::from(nonce),
            max_priority_fee_per_gas: priority,
            max_fee_per_gas: max_fee,
            gas_limit: U256::from(gas.saturating_mul(GAS_LIMIT_MARGIN_PCT) / 100),
            to: self.contract,
            value: U256::ZERO,
            data: Bytes::from(calldata),
        };
        let signed = tx.sign(&self.keypair)?;
        let tx_hash = self.rpc.send_raw_transaction(&signed.raw).await?;
        debug!(%tx_hash, nonce, "broadcast transaction");
        self.wait_for_receipt(tx_hash).await
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<B256, OracleError> {
        let deadline = tokio::time::Instant::now() + self.receipt_timeout;
        loop {
            if let Some(receipt) = self.rpc.transaction_receipt(tx_hash).await? {
                if !receipt.success {
                    return Err(OracleError::Reverted {
                        tx_hash: tx_hash.to_string(),
                    });
                }
                return Ok(tx_hash);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OracleError::Rpc(format!(
                    "timed out waiting for receipt of {}",
                    tx_hash
                )));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

/// Decode logs, dropping any that do not match the contract ABI. A log that
/// can never be decoded can never be handled either.
fn decode_all(logs: Vec<ChainLog>) -> Vec<ObservedEvent> {
    logs.iter()
        .filter_map(|log| match decode_log(log) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(
                    block = log.block_number,
                    tx = %log.transaction_hash,
                    "Skipping undecodable log: {}",
                    e
                );
                None
            }
        })
        .collect()
}

/// Split `[from, to]` into windows of at most `max_range` blocks.
pub(crate) fn block_windows(from: u64, to: u64, max_range: u64) -> Vec<(u64, u64)> {
    let mut windows = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(max_range - 1).min(to);
        windows.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    windows
}

#[async_trait]
impl ChainClient for EvmChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn contract_address(&self) -> Address {
        self.contract
    }

    fn signer_address(&self) -> Address {
        self.keypair.address()
    }

    async fn latest_block(&self) -> Result<u64, OracleError> {
        self.rpc.block_number().await
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, OracleError> {
        self.rpc.block_timestamp(block).await
    }

    async fn registered_oracle(&self) -> Result<Address, OracleError> {
        let returned = self.rpc.eth_call(self.contract, &contract::oracle()).await?;
        contract::decode_oracle(&returned)
    }

    async fn set_oracle(&self, oracle: Address) -> Result<B256, OracleError> {
        self.send(contract::set_oracle(oracle)).await
    }

    async fn submit_answer(&self, job_id: U256, bundle: &CidBundle) -> Result<B256, OracleError> {
        self.send(contract::submit_answer(job_id, bundle)).await
    }

    async fn submit_branch(
        &self,
        conversation_id: U256,
        bundle: &CidBundle,
    ) -> Result<B256, OracleError> {
        self.send(contract::submit_branch(conversation_id, bundle))
            .await
    }

    async fn submit_metadata(
        &self,
        conversation_id: U256,
        metadata_cid: &str,
    ) -> Result<B256, OracleError> {
        self.send(contract::submit_metadata(conversation_id, metadata_cid))
            .await
    }

    async fn query_events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<ObservedEvent>, OracleError> {
        let mut events = Vec::new();
        for (start, end) in block_windows(from, to, self.max_block_range) {
            let logs = self
                .rpc
                .get_logs(self.contract, &[kind.topic()], start, end)
                .await?;
            events.extend(decode_all(logs));
        }
        events.sort_by_key(ObservedEvent::position);
        Ok(events)
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, OracleError> {
        self.rpc.transaction_receipt(tx_hash).await
    }

    async fn subscribe(
        &self,
        from_block: u64,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ObservedEvent>, OracleError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let rpc = self.rpc.clone();
        let contract = self.contract;
        let poll_interval = self.poll_interval;
        let max_range = self.max_block_range;
        let topics: Vec<B256> = EventKind::ALL.iter().map(EventKind::topic).collect();

        info!(from_block, "Starting live event subscription");
        tokio::spawn(async move {
            let mut next = from_block;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }

                let latest = match rpc.block_number().await {
                    Ok(latest) => latest,
                    Err(e) => {
                        warn!("Live poll could not read block number: {}", e);
                        continue;
                    }
                };
                if latest < next {
                    continue;
                }

                let to = next.saturating_add(max_range - 1).min(latest);
                match rpc.get_logs(contract, &topics, next, to).await {
                    Ok(logs) => {
                        let mut events = decode_all(logs);
                        events.sort_by_key(ObservedEvent::position);
                        for event in events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        next = to + 1;
                    }
                    Err(e) => warn!(from = next, to, "Live poll eth_getLogs failed: {}", e),
                }
            }
            debug!("Live event subscription stopped");
        });
        Ok(rx)
    }
}
