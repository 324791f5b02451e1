//! In-process collaborators for tests and local dry runs: a content store,
//! a chain, an inference backend, an attested signer and an alert sink, all
//! backed by memory and scriptable.

use alloy_primitives::{Address, B256, U256, keccak256};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::error::OracleError;
use crate::core::events::{ChainLog, EventKind, ObservedEvent, RequestEvent, decode_log, encode_log};
use crate::core::llm::{ChatMessage, Inference, InferenceError};
use crate::core::model::CidBundle;
use crate::interfaces::alerts::{Notifier, Severity};
use crate::interfaces::attested::AttestedSigner;
use crate::interfaces::chain::{ChainClient, Receipt};
use crate::interfaces::storage::{ContentStore, Tag};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Storage ──

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub cid: String,
    pub data: Vec<u8>,
    pub tags: Vec<Tag>,
}

impl StoredBlob {
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<Vec<StoredBlob>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn remove(&self, cid: &str) {
        lock(&self.blobs).retain(|b| b.cid != cid);
    }

    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn blob(&self, cid: &str) -> Option<StoredBlob> {
        lock(&self.blobs).iter().find(|b| b.cid == cid).cloned()
    }

    pub fn with_tag(&self, name: &str, value: &str) -> Vec<StoredBlob> {
        lock(&self.blobs)
            .iter()
            .filter(|b| b.tag(name) == Some(value))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn put(&self, data: Vec<u8>, tags: &[Tag]) -> Result<String, OracleError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(OracleError::Storage("gateway unavailable".to_string()));
        }
        let cid = format!("bafk{}", &hex::encode(Sha256::digest(&data))[..40]);
        lock(&self.blobs).push(StoredBlob {
            cid: cid.clone(),
            data,
            tags: tags.to_vec(),
        });
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> Result<Vec<u8>, OracleError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(OracleError::Storage("gateway unavailable".to_string()));
        }
        self.blob(cid)
            .map(|b| b.data)
            .ok_or_else(|| OracleError::Storage(format!("{} not found", cid)))
    }

    async fn query_by_tags(&self, tags: &[Tag]) -> Result<Option<String>, OracleError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(OracleError::Storage("gateway unavailable".to_string()));
        }
        Ok(lock(&self.blobs)
            .iter()
            .rev()
            .find(|b| tags.iter().all(|t| b.tags.contains(t)))
            .map(|b| b.cid.clone()))
    }
}

// ── Chain ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Answer { job_id: U256, bundle: CidBundle },
    Branch { conversation_id: U256, bundle: CidBundle },
    Metadata { conversation_id: U256, metadata_cid: String },
    SetOracle(Address),
}

pub struct MockChain {
    chain_id: u64,
    contract: Address,
    signer: Address,
    latest: AtomicU64,
    default_timestamp: AtomicU64,
    registered_oracle: Mutex<Address>,
    logs: Mutex<Vec<ChainLog>>,
    timestamps: Mutex<HashMap<u64, u64>>,
    submissions: Mutex<Vec<Submission>>,
    submit_failures: Mutex<VecDeque<OracleError>>,
    query_failure: Mutex<Option<String>>,
    live: Mutex<Option<mpsc::Sender<ObservedEvent>>>,
    tx_counter: AtomicU64,
}

impl MockChain {
    pub fn new(chain_id: u64, signer: Address) -> Self {
        Self {
            chain_id,
            contract: Address::repeat_byte(0xc0),
            signer,
            latest: AtomicU64::new(0),
            default_timestamp: AtomicU64::new(0),
            registered_oracle: Mutex::new(signer),
            logs: Mutex::new(Vec::new()),
            timestamps: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            submit_failures: Mutex::new(VecDeque::new()),
            query_failure: Mutex::new(None),
            live: Mutex::new(None),
            tx_counter: AtomicU64::new(1),
        }
    }

    pub fn set_latest_block(&self, block: u64) {
        self.latest.store(block, Ordering::SeqCst);
    }

    /// Timestamp (seconds) reported for blocks without an explicit one.
    pub fn set_default_timestamp(&self, secs: u64) {
        self.default_timestamp.store(secs, Ordering::SeqCst);
    }

    pub fn set_block_timestamp(&self, block: u64, secs: u64) {
        lock(&self.timestamps).insert(block, secs);
    }

    pub fn set_registered_oracle(&self, oracle: Address) {
        *lock(&self.registered_oracle) = oracle;
    }

    pub fn fail_next_submit(&self, error: OracleError) {
        lock(&self.submit_failures).push_back(error);
    }

    pub fn fail_queries(&self, reason: Option<&str>) {
        *lock(&self.query_failure) = reason.map(str::to_string);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.submissions).clone()
    }

    /// Record `request` as emitted at the given position and return how the
    /// oracle will observe it. Raises the latest block if needed.
    pub fn emit(&self, request: &RequestEvent, block: u64, tx_index: u64, log_index: u64) -> ObservedEvent {
        let tx_hash = keccak256([block.to_be_bytes(), tx_index.to_be_bytes()].concat());
        let mut log = encode_log(self.contract, request, block, tx_index, log_index, tx_hash);
        log.block_timestamp = lock(&self.timestamps).get(&block).copied();
        lock(&self.logs).push(log.clone());
        self.latest.fetch_max(block, Ordering::SeqCst);
        ObservedEvent {
            request: request.clone(),
            block_number: block,
            transaction_index: tx_index,
            log_index,
            transaction_hash: tx_hash,
            block_timestamp: log.block_timestamp,
        }
    }

    /// Push an already-emitted event to the live subscriber, if any.
    pub async fn deliver_live(&self, event: ObservedEvent) -> bool {
        let sender = lock(&self.live).clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Drop the live sender so the subscriber sees end-of-stream.
    pub fn close_live(&self) {
        lock(&self.live).take();
    }

    fn record(&self, submission: Submission) -> Result<B256, OracleError> {
        if let Some(error) = lock(&self.submit_failures).pop_front() {
            return Err(error);
        }
        lock(&self.submissions).push(submission);
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        Ok(B256::left_padding_from(&n.to_be_bytes()))
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn contract_address(&self) -> Address {
        self.contract
    }

    fn signer_address(&self) -> Address {
        self.signer
    }

    async fn latest_block(&self) -> Result<u64, OracleError> {
        Ok(self.latest.load(Ordering::SeqCst))
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, OracleError> {
        Ok(lock(&self.timestamps)
            .get(&block)
            .copied()
            .unwrap_or_else(|| self.default_timestamp.load(Ordering::SeqCst)))
    }

    async fn registered_oracle(&self) -> Result<Address, OracleError> {
        Ok(*lock(&self.registered_oracle))
    }

    async fn set_oracle(&self, oracle: Address) -> Result<B256, OracleError> {
        let hash = self.record(Submission::SetOracle(oracle))?;
        self.set_registered_oracle(oracle);
        Ok(hash)
    }

    async fn submit_answer(&self, job_id: U256, bundle: &CidBundle) -> Result<B256, OracleError> {
        self.record(Submission::Answer {
            job_id,
            bundle: bundle.clone(),
        })
    }

    async fn submit_branch(
        &self,
        conversation_id: U256,
        bundle: &CidBundle,
    ) -> Result<B256, OracleError> {
        self.record(Submission::Branch {
            conversation_id,
            bundle: bundle.clone(),
        })
    }

    async fn submit_metadata(
        &self,
        conversation_id: U256,
        metadata_cid: &str,
    ) -> Result<B256, OracleError> {
        self.record(Submission::Metadata {
            conversation_id,
            metadata_cid: metadata_cid.to_string(),
        })
    }

    async fn query_events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<ObservedEvent>, OracleError> {
        if let Some(reason) = lock(&self.query_failure).clone() {
            return Err(OracleError::Rpc(reason));
        }
        let logs = lock(&self.logs).clone();
        let mut events: Vec<ObservedEvent> = logs
            .iter()
            .filter(|l| l.block_number >= from && l.block_number <= to)
            .filter(|l| l.topics.first() == Some(&kind.topic()))
            .map(decode_log)
            .collect::<Result<_, _>>()?;
        events.sort_by_key(ObservedEvent::position);
        Ok(events)
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, OracleError> {
        let logs: Vec<ChainLog> = lock(&self.logs)
            .iter()
            .filter(|l| l.transaction_hash == tx_hash)
            .cloned()
            .collect();
        Ok(logs.first().map(|first| Receipt {
            transaction_hash: tx_hash,
            block_number: first.block_number,
            success: true,
            logs: logs.clone(),
        }))
    }

    async fn subscribe(
        &self,
        _from_block: u64,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ObservedEvent>, OracleError> {
        let (tx, rx) = mpsc::channel(64);
        *lock(&self.live) = Some(tx);
        Ok(rx)
    }
}

// ── Inference ──

pub struct ScriptedInference {
    replies: Mutex<VecDeque<Result<String, InferenceError>>>,
    fallback: String,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedInference {
    /// Answers every call with `text` unless a scripted reply is queued.
    pub fn replying(text: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: text.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: Result<String, InferenceError>) {
        lock(&self.replies).push_back(reply);
    }

    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Inference for ScriptedInference {
    async fn infer(&self, history: &[ChatMessage]) -> Result<String, InferenceError> {
        lock(&self.calls).push(history.to_vec());
        lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

// ── Attested signer ──

#[derive(Default)]
pub struct RecordingSigner {
    submitted: Mutex<Vec<(Address, Vec<u8>)>>,
}

impl RecordingSigner {
    pub fn submitted(&self) -> Vec<(Address, Vec<u8>)> {
        lock(&self.submitted).clone()
    }
}

#[async_trait]
impl AttestedSigner for RecordingSigner {
    async fn submit(&self, to: Address, calldata: &[u8]) -> Result<B256, OracleError> {
        lock(&self.submitted).push((to, calldata.to_vec()));
        Ok(keccak256(calldata))
    }
}

// ── Alerts ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAlert {
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<RecordedAlert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<RecordedAlert> {
        lock(&self.alerts).clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        lock(&self.alerts)
            .iter()
            .filter(|a| a.severity == severity)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, severity: Severity, title: &str, message: &str) {
        lock(&self.alerts).push(RecordedAlert {
            severity,
            title: title.to_string(),
            message: message.to_string(),
        });
    }
}
