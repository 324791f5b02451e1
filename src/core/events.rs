use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::abi;
use crate::core::error::OracleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PromptSubmitted,
    RegenerationRequested,
    BranchRequested,
    MetadataUpdateRequested,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::PromptSubmitted,
        EventKind::RegenerationRequested,
        EventKind::BranchRequested,
        EventKind::MetadataUpdateRequested,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::PromptSubmitted => "PromptSubmitted",
            EventKind::RegenerationRequested => "RegenerationRequested",
            EventKind::BranchRequested => "BranchRequested",
            EventKind::MetadataUpdateRequested => "MetadataUpdateRequested",
        }
    }

    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::PromptSubmitted => "PromptSubmitted(address,uint256,uint256,bytes)",
            EventKind::RegenerationRequested => {
                "RegenerationRequested(address,uint256,uint256,bytes)"
            }
            EventKind::BranchRequested => "BranchRequested(address,uint256,uint256,bytes)",
            EventKind::MetadataUpdateRequested => "MetadataUpdateRequested(address,uint256,bytes)",
        }
    }

    pub fn topic(&self) -> B256 {
        keccak256(self.signature().as_bytes())
    }

    /// Indexed parameters plus the signature topic.
    fn topic_count(&self) -> usize {
        match self {
            EventKind::MetadataUpdateRequested => 3,
            _ => 4,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn from_topic(topic: &B256) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.topic() == *topic)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Arguments shared by prompt and regeneration requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub user: Address,
    pub conversation_id: U256,
    pub job_id: U256,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRequest {
    pub user: Address,
    pub original_conversation_id: U256,
    pub new_conversation_id: U256,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRequest {
    pub user: Address,
    pub conversation_id: U256,
    pub payload: Bytes,
}

/// A decoded request, one variant per event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    Prompt(JobRequest),
    Regeneration(JobRequest),
    Branch(BranchRequest),
    Metadata(MetadataRequest),
}

impl RequestEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RequestEvent::Prompt(_) => EventKind::PromptSubmitted,
            RequestEvent::Regeneration(_) => EventKind::RegenerationRequested,
            RequestEvent::Branch(_) => EventKind::BranchRequested,
            RequestEvent::Metadata(_) => EventKind::MetadataUpdateRequested,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            RequestEvent::Prompt(r) | RequestEvent::Regeneration(r) => &r.payload,
            RequestEvent::Branch(r) => &r.payload,
            RequestEvent::Metadata(r) => &r.payload,
        }
    }

    /// The conversation a request writes to.
    pub fn conversation_id(&self) -> U256 {
        match self {
            RequestEvent::Prompt(r) | RequestEvent::Regeneration(r) => r.conversation_id,
            RequestEvent::Branch(r) => r.new_conversation_id,
            RequestEvent::Metadata(r) => r.conversation_id,
        }
    }

    /// Event arguments as persisted in the retry queue.
    pub fn args(&self) -> serde_json::Value {
        let value = match self {
            RequestEvent::Prompt(r) | RequestEvent::Regeneration(r) => serde_json::to_value(r),
            RequestEvent::Branch(r) => serde_json::to_value(r),
            RequestEvent::Metadata(r) => serde_json::to_value(r),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    pub fn from_args(kind: EventKind, args: &serde_json::Value) -> Result<Self, OracleError> {
        let args = args.clone();
        Ok(match kind {
            EventKind::PromptSubmitted => RequestEvent::Prompt(serde_json::from_value(args)?),
            EventKind::RegenerationRequested => {
                RequestEvent::Regeneration(serde_json::from_value(args)?)
            }
            EventKind::BranchRequested => RequestEvent::Branch(serde_json::from_value(args)?),
            EventKind::MetadataUpdateRequested => {
                RequestEvent::Metadata(serde_json::from_value(args)?)
            }
        })
    }
}

/// A raw log as returned by the chain, before ABI decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub transaction_hash: B256,
    pub block_timestamp: Option<u64>,
}

/// A request together with where it was seen on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub request: RequestEvent,
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub transaction_hash: B256,
    pub block_timestamp: Option<u64>,
}

impl ObservedEvent {
    pub fn kind(&self) -> EventKind {
        self.request.kind()
    }

    /// Total order of logs within the chain.
    pub fn position(&self) -> (u64, u64, u64) {
        (self.block_number, self.transaction_index, self.log_index)
    }
}

fn topic_address(topic: &B256) -> Result<Address, OracleError> {
    abi::decode_address(topic.as_slice())
}

fn topic_uint(topic: &B256) -> U256 {
    U256::from_be_bytes(topic.0)
}

/// Decode a contract log into a request. Pure: no chain access.
pub fn decode_log(log: &ChainLog) -> Result<ObservedEvent, OracleError> {
    let topic0 = log
        .topics
        .first()
        .ok_or_else(|| OracleError::Malformed("log has no topics".to_string()))?;
    let kind = EventKind::from_topic(topic0)
        .ok_or_else(|| OracleError::Malformed(format!("unknown event topic {}", topic0)))?;
    if log.topics.len() != kind.topic_count() {
        return Err(OracleError::Malformed(format!(
            "{} log has {} topics, expected {}",
            kind,
            log.topics.len(),
            kind.topic_count()
        )));
    }

    let user = topic_address(&log.topics[1])?;
    let payload = Bytes::from(abi::decode_bytes_at(&log.data, 0, 0)?);
    let request = match kind {
        EventKind::PromptSubmitted | EventKind::RegenerationRequested => {
            let args = JobRequest {
                user,
                conversation_id: topic_uint(&log.topics[2]),
                job_id: topic_uint(&log.topics[3]),
                payload,
            };
            if kind == EventKind::PromptSubmitted {
                RequestEvent::Prompt(args)
            } else {
                RequestEvent::Regeneration(args)
            }
        }
        EventKind::BranchRequested => RequestEvent::Branch(BranchRequest {
            user,
            original_conversation_id: topic_uint(&log.topics[2]),
            new_conversation_id: topic_uint(&log.topics[3]),
            payload,
        }),
        EventKind::MetadataUpdateRequested => RequestEvent::Metadata(MetadataRequest {
            user,
            conversation_id: topic_uint(&log.topics[2]),
            payload,
        }),
    };

    Ok(ObservedEvent {
        request,
        block_number: log.block_number,
        transaction_index: log.transaction_index,
        log_index: log.log_index,
        transaction_hash: log.transaction_hash,
        block_timestamp: log.block_timestamp,
    })
}

/// Build the log a contract would emit for `request`. Used by in-process
/// chains and tests.
pub fn encode_log(
    contract: Address,
    request: &RequestEvent,
    block_number: u64,
    transaction_index: u64,
    log_index: u64,
    transaction_hash: B256,
) -> ChainLog {
    let user_topic = |user: &Address| B256::left_padding_from(user.as_slice());
    let uint_topic = |v: &U256| B256::from(v.to_be_bytes::<32>());
    let mut topics = vec![request.kind().topic()];
    match request {
        RequestEvent::Prompt(r) | RequestEvent::Regeneration(r) => {
            topics.extend([user_topic(&r.user), uint_topic(&r.conversation_id), uint_topic(&r.job_id)]);
        }
        RequestEvent::Branch(r) => {
            topics.extend([
                user_topic(&r.user),
                uint_topic(&r.original_conversation_id),
                uint_topic(&r.new_conversation_id),
            ]);
        }
        RequestEvent::Metadata(r) => {
            topics.extend([user_topic(&r.user), uint_topic(&r.conversation_id)]);
        }
    }
    ChainLog {
        address: contract,
        topics,
        data: abi::encode(&[abi::Token::Bytes(request.payload().to_vec())]),
        block_number,
        transaction_index,
        log_index,
        transaction_hash,
        block_timestamp: None,
    }
}
