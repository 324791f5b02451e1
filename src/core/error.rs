use regex::RegexSet;
use std::sync::OnceLock;
use thiserror::Error;

/// Everything a handler, collaborator or checkpoint store can fail with.
///
/// Variants carry the failure taxonomy; [`classify`] turns one into a
/// [`Disposition`] without touching any I/O.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("storage i/o failed: {0}")]
    Storage(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("chain rpc error: {0}")]
    Rpc(String),

    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    #[error("inference backend unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("no session key resolvable for conversation {0}")]
    KeyUnavailable(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("oracle identity mismatch: registered {registered}, signer {signer}")]
    IdentityMismatch { registered: String, signer: String },

    #[error("checkpoint i/o failed: {0}")]
    Checkpoint(String),

    #[error("not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retryable,
    Fatal,
}

/// Substrings seen in transient RPC / transport failures. Matched
/// case-insensitively against the rendered error message.
const TRANSIENT_SIGNATURES: &[&str] = &[
    r"insufficient funds",
    r"timed? ?out",
    r"timeout",
    r"connection (reset|refused|closed)",
    r"econnreset|econnrefused|etimedout|enotfound|eai_again",
    r"socket hang up",
    r"rate.?limit",
    r"too many requests",
    r"\b(429|502|503|504)\b",
    r"nonce too low",
    r"replacement transaction underpriced",
    r"already known",
    r"header not found",
    r"temporarily unavailable",
];

fn transient_signatures() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        let patterns: Vec<String> = TRANSIENT_SIGNATURES
            .iter()
            .map(|p| format!("(?i){}", p))
            .collect();
        RegexSet::new(patterns).expect("transient signature patterns are valid")
    })
}

pub fn is_transient_message(message: &str) -> bool {
    transient_signatures().is_match(message)
}

/// Decide whether a failed invocation should be queued for retry or rejected.
pub fn classify(error: &OracleError) -> Disposition {
    match error {
        OracleError::Storage(_) | OracleError::Network(_) | OracleError::InferenceUnavailable(_) => {
            Disposition::Retryable
        }
        OracleError::Rpc(message) if is_transient_message(message) => Disposition::Retryable,
        OracleError::Rpc(_)
        | OracleError::Reverted { .. }
        | OracleError::KeyUnavailable(_)
        | OracleError::Decryption(_)
        | OracleError::Malformed(_)
        | OracleError::IdentityMismatch { .. }
        | OracleError::Checkpoint(_)
        | OracleError::NotConfigured(_) => Disposition::Fatal,
    }
}

impl From<reqwest::Error> for OracleError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            OracleError::Malformed(err.to_string())
        } else {
            OracleError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for OracleError {
    fn from(err: serde_json::Error) -> Self {
        OracleError::Malformed(err.to_string())
    }
}
