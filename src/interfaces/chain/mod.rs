pub mod contract;
pub mod evm;
pub mod rpc;
pub mod tx;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::error::OracleError;
use crate::core::events::{ChainLog, EventKind, ObservedEvent};
use crate::core::model::CidBundle;

pub use evm::EvmChain;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub success: bool,
    pub logs: Vec<ChainLog>,
}

/// Everything the oracle needs from the chain and its contract.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;
    fn contract_address(&self) -> Address;
    fn signer_address(&self) -> Address;

    async fn latest_block(&self) -> Result<u64, OracleError>;
    /// Block timestamp in seconds.
    async fn block_timestamp(&self, block: u64) -> Result<u64, OracleError>;

    async fn registered_oracle(&self) -> Result<Address, OracleError>;
    async fn set_oracle(&self, oracle: Address) -> Result<B256, OracleError>;

    async fn submit_answer(&self, job_id: U256, bundle: &CidBundle) -> Result<B256, OracleError>;
    async fn submit_branch(
        &self,
        conversation_id: U256,
        bundle: &CidBundle,
    ) -> Result<B256, OracleError>;
    async fn submit_metadata(
        &self,
        conversation_id: U256,
        metadata_cid: &str,
    ) -> Result<B256, OracleError>;

    /// Contract events of `kind` in `[from, to]`, in chain order.
    async fn query_events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<ObservedEvent>, OracleError>;

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, OracleError>;

    /// Stream every tracked event from `from_block` onward until `cancel`
    /// fires.
    async fn subscribe(
        &self,
        from_block: u64,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ObservedEvent>, OracleError>;
}
