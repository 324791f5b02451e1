use anyhow::{Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Runtime configuration. Loaded from an optional TOML file, then overlaid
/// with environment variables (see [`OracleConfig::apply_env`]).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub chain: ChainConfig,
    pub storage: StorageConfig,
    pub ai: AiConfig,
    pub reliability: ReliabilityConfig,
    pub alerts: AlertConfig,
    pub state_dir: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub contract_address: String,
    pub private_key: String,
    /// The runtime encrypts calldata and state transparently (e.g. a
    /// confidential EVM); session keys then arrive in plaintext.
    pub confidential: bool,
    /// `localnet`, `testnet` or `mainnet`. Only `localnet` is trusted for
    /// direct self-registration.
    pub network: String,
    pub attested_signer_url: Option<String>,
    pub poll_interval_secs: u64,
    pub max_block_range: u64,
    pub request_timeout_secs: u64,
    pub receipt_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub app_name: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub provider: String,
    pub model: Option<String>,
    pub api_key: String,
    pub base_url: Option<String>,
    pub system_prompt: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub context_messages_limit: usize,
    pub retry_drain_interval_secs: u64,
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub lag_threshold_secs: u64,
    pub recent_lookback_blocks: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<i64>,
    pub webhook_url: Option<String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            storage: StorageConfig::default(),
            ai: AiConfig::default(),
            reliability: ReliabilityConfig::default(),
            alerts: AlertConfig::default(),
            state_dir: PathBuf::from("./state"),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            chain_id: 0,
            contract_address: String::new(),
            private_key: String::new(),
            confidential: false,
            network: "testnet".to_string(),
            attested_signer_url: None,
            poll_interval_secs: 6,
            max_block_range: 1_000,
            request_timeout_secs: 30,
            receipt_timeout_secs: 120,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            gateway_url: String::new(),
            api_key: None,
            app_name: "chat-oracle".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            api_key: String::new(),
            base_url: None,
            system_prompt: None,
            request_timeout_secs: 120,
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            context_messages_limit: 20,
            retry_drain_interval_secs: 60,
            max_retries: 5,
            base_delay_secs: 30,
            lag_threshold_secs: 300,
            // ~1 hour at 6 second blocks.
            recent_lookback_blocks: 600,
        }
    }
}

impl ChainConfig {
    pub fn is_trusted_network(&self) -> bool {
        self.network.eq_ignore_ascii_case("localnet")
    }
}

impl ReliabilityConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.retry_drain_interval_secs.max(1))
    }
}

impl OracleConfig {
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = tokio::fs::read_to_string(p).await?;
                let parsed: OracleConfig = toml::from_str(&content)?;
                info!("Loaded configuration from {}", p.display());
                parsed
            }
            Some(p) => bail!("config file {} does not exist", p.display()),
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Overlay environment-sourced settings. `lookup` is injected so tests do
    /// not have to touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ORACLE_RPC_URL") {
            self.chain.rpc_url = v;
        }
        if let Some(v) = get("ORACLE_CHAIN_ID").and_then(|v| v.parse().ok()) {
            self.chain.chain_id = v;
        }
        if let Some(v) = get("ORACLE_CONTRACT_ADDRESS") {
            self.chain.contract_address = v;
        }
        if let Some(v) = get("ORACLE_PRIVATE_KEY") {
            self.chain.private_key = v;
        }
        if let Some(v) = get("ORACLE_CONFIDENTIAL_CHAIN").and_then(|v| parse_bool(&v)) {
            self.chain.confidential = v;
        }
        if let Some(v) = get("ORACLE_NETWORK") {
            self.chain.network = v;
        }
        if let Some(v) = get("ORACLE_ATTESTED_SIGNER_URL") {
            self.chain.attested_signer_url = Some(v);
        }
        if let Some(v) = get("ORACLE_POLL_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.chain.poll_interval_secs = v;
        }

        if let Some(v) = get("STORAGE_GATEWAY_URL") {
            self.storage.gateway_url = v;
        }
        if let Some(v) = get("STORAGE_API_KEY") {
            self.storage.api_key = Some(v);
        }

        if let Some(v) = get("AI_PROVIDER") {
            self.ai.provider = v;
        }
        if let Some(v) = get("AI_MODEL") {
            self.ai.model = Some(v);
        }
        if let Some(v) = get("AI_API_KEY") {
            self.ai.api_key = v;
        }
        if let Some(v) = get("AI_BASE_URL") {
            self.ai.base_url = Some(v);
        }
        if let Some(v) = get("AI_SYSTEM_PROMPT") {
            self.ai.system_prompt = Some(v);
        }

        let r = &mut self.reliability;
        if let Some(v) = get("AI_CONTEXT_MESSAGES_LIMIT").and_then(|v| v.parse().ok()) {
            r.context_messages_limit = v;
        }
        if let Some(v) = get("RETRY_DRAIN_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            r.retry_drain_interval_secs = v;
        }
        if let Some(v) = get("MAX_RETRIES").and_then(|v| v.parse().ok()) {
            r.max_retries = v;
        }
        if let Some(v) = get("RETRY_BASE_DELAY_SECS").and_then(|v| v.parse().ok()) {
            r.base_delay_secs = v;
        }
        if let Some(v) = get("LAG_ALERT_THRESHOLD_SECS").and_then(|v| v.parse().ok()) {
            r.lag_threshold_secs = v;
        }
        if let Some(v) = get("RECENT_LOOKBACK_BLOCKS").and_then(|v| v.parse().ok()) {
            r.recent_lookback_blocks = v;
        }

        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.alerts.telegram_bot_token = Some(v);
        }
        if let Some(v) = get("TELEGRAM_CHAT_ID").and_then(|v| v.parse().ok()) {
            self.alerts.telegram_chat_id = Some(v);
        }
        if let Some(v) = get("ALERT_WEBHOOK_URL") {
            self.alerts.webhook_url = Some(v);
        }

        if let Some(v) = get("ORACLE_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ORACLE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("ORACLE_LOG_FILE") {
            self.log_file = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chain.rpc_url.is_empty() {
            bail!("ORACLE_RPC_URL is required");
        }
        if self.chain.contract_address.is_empty() {
            bail!("ORACLE_CONTRACT_ADDRESS is required");
        }
        if self.chain.private_key.is_empty() {
            bail!("ORACLE_PRIVATE_KEY is required");
        }
        if self.storage.gateway_url.is_empty() {
            bail!("STORAGE_GATEWAY_URL is required");
        }
        if self.reliability.max_retries == 0 {
            bail!("MAX_RETRIES must be at least 1");
        }
        if self.reliability.context_messages_limit == 0 {
            bail!("AI_CONTEXT_MESSAGES_LIMIT must be at least 1");
        }
        if self.chain.confidential
            && !self.chain.is_trusted_network()
            && self.chain.attested_signer_url.is_none()
        {
            info!(
                "No attested signer configured on network '{}'; identity repair will be refused",
                self.chain.network
            );
        }
        Ok(())
    }

    pub fn watermark_path(&self) -> PathBuf {
        self.state_dir.join("watermark.json")
    }

    pub fn retry_queue_path(&self) -> PathBuf {
        self.state_dir.join("retry-queue.json")
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
