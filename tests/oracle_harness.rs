#![allow(dead_code)]

use alloy_primitives::{Address, Bytes, U256};
use chat_oracle::core::checkpoint::{MemoryQueueStore, MemoryWatermarkStore, QueueStore, WatermarkStore};
use chat_oracle::core::config::ReliabilityConfig;
use chat_oracle::core::crypto::{OracleKeypair, SessionKey, open_json, seal_session_key};
use chat_oracle::core::events::{JobRequest, ObservedEvent, RequestEvent};
use chat_oracle::core::oracle::{Oracle, OracleContext, OracleSettings};
use chat_oracle::core::timing::ManualClock;
use chat_oracle::interfaces::attested::AttestedSigner;
use chat_oracle::test_support::{
    MemoryStore, MockChain, RecordingNotifier, RecordingSigner, ScriptedInference,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const CHAIN_ID: u64 = 23295;
pub const NOW_MS: u64 = 1_700_000_000_000;

/// An oracle wired entirely to in-memory collaborators.
pub struct OracleHarness {
    pub chain: Arc<MockChain>,
    pub storage: Arc<MemoryStore>,
    pub inference: Arc<ScriptedInference>,
    pub notifier: Arc<RecordingNotifier>,
    pub signer: Arc<RecordingSigner>,
    pub clock: Arc<ManualClock>,
    pub keypair: Arc<OracleKeypair>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub queue: Arc<dyn QueueStore>,
    pub settings: OracleSettings,
}

impl OracleHarness {
    pub fn new(reply: &str) -> Self {
        Self::with_stores(
            reply,
            Arc::new(MemoryWatermarkStore::new(None)),
            Arc::new(MemoryQueueStore::new(Vec::new())),
        )
    }

    pub fn with_stores(
        reply: &str,
        watermarks: Arc<dyn WatermarkStore>,
        queue: Arc<dyn QueueStore>,
    ) -> Self {
        let keypair = Arc::new(OracleKeypair::random());
        let chain = Arc::new(MockChain::new(CHAIN_ID, keypair.address()));
        chain.set_default_timestamp(NOW_MS / 1000);
        Self {
            chain,
            storage: Arc::new(MemoryStore::default()),
            inference: Arc::new(ScriptedInference::replying(reply)),
            notifier: Arc::new(RecordingNotifier::default()),
            signer: Arc::new(RecordingSigner::default()),
            clock: Arc::new(ManualClock::new(NOW_MS)),
            keypair,
            watermarks,
            queue,
            settings: OracleSettings {
                confidential: false,
                trusted_network: false,
                system_prompt: None,
                reliability: ReliabilityConfig::default(),
            },
        }
    }

    pub fn context(&self) -> OracleContext {
        OracleContext {
            chain: self.chain.clone(),
            storage: self.storage.clone(),
            inference: self.inference.clone(),
            notifier: self.notifier.clone(),
            attested: Some(self.signer.clone() as Arc<dyn AttestedSigner>),
            clock: self.clock.clone(),
            keypair: self.keypair.clone(),
            watermarks: self.watermarks.clone(),
            queue: self.queue.clone(),
            settings: self.settings.clone(),
        }
    }

    pub fn oracle(&self) -> Oracle {
        Oracle::new(self.context())
    }

    pub fn sealed(&self, key: &SessionKey) -> String {
        seal_session_key(key, &self.keypair.public_key()).expect("seal session key")
    }

    pub fn open<T: DeserializeOwned>(&self, cid: &str, key: &SessionKey) -> T {
        let blob = self.storage.blob(cid).expect("blob stored");
        open_json(std::str::from_utf8(&blob.data).expect("utf8 envelope"), key)
            .expect("open envelope")
    }

    /// Emit a plain-text prompt carrying a sealed session key.
    pub fn emit_prompt(
        &self,
        key: &SessionKey,
        text: &str,
        conversation_id: u64,
        job_id: u64,
        block: u64,
    ) -> ObservedEvent {
        let payload = serde_json::json!({
            "prompt": text,
            "encryptedSessionKey": self.sealed(key),
        });
        let request = RequestEvent::Prompt(JobRequest {
            user: Address::repeat_byte(0x11),
            conversation_id: U256::from(conversation_id),
            job_id: U256::from(job_id),
            payload: Bytes::from(serde_json::to_vec(&payload).expect("payload json")),
        });
        self.chain.emit(&request, block, 0, 0)
    }
}
