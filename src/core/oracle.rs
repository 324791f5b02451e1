//! Wiring: the explicit context every component is built from, and the boot
//! sequence that drives them.

use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::checkpoint::{
    FailedJob, JsonQueueStore, JsonWatermarkStore, QueueStore, Watermark, WatermarkStore,
};
use crate::core::config::{OracleConfig, ReliabilityConfig};
use crate::core::crypto::OracleKeypair;
use crate::core::error::OracleError;
use crate::core::handlers::{EventHandler, HandlerSet};
use crate::core::history::HistoryWalker;
use crate::core::identity::IdentityReconciler;
use crate::core::ingest::{CatchUpReport, EventIngestor};
use crate::core::keys::SessionKeyResolver;
use crate::core::lifecycle::{LifecycleManager, LifecycleState};
use crate::core::llm::generic_provider::GenericProvider;
use crate::core::llm::registry::ProviderRegistry;
use crate::core::llm::{AiDispatcher, Inference, LlmManager};
use crate::core::reliability::ReliabilityWrapper;
use crate::core::retry::{DrainReport, RetryQueueManager};
use crate::core::timing::{Clock, SystemClock};
use crate::interfaces::alerts::{AlertHub, Notifier};
use crate::interfaces::attested::{AttestedSigner, HttpAttestedSigner};
use crate::interfaces::chain::{ChainClient, EvmChain};
use crate::interfaces::storage::{ContentStore, GatewayStore};

/// Behavioural settings the components need beyond their collaborators.
#[derive(Debug, Clone)]
pub struct OracleSettings {
    pub confidential: bool,
    pub trusted_network: bool,
    pub system_prompt: Option<String>,
    pub reliability: ReliabilityConfig,
}

impl OracleSettings {
    pub fn from_config(config: &OracleConfig) -> Self {
        Self {
            confidential: config.chain.confidential,
            trusted_network: config.chain.is_trusted_network(),
            system_prompt: config.ai.system_prompt.clone(),
            reliability: config.reliability.clone(),
        }
    }
}

/// Every collaborator the oracle talks to, constructed once at startup.
#[derive(Clone)]
pub struct OracleContext {
    pub chain: Arc<dyn ChainClient>,
    pub storage: Arc<dyn ContentStore>,
    pub inference: Arc<dyn Inference>,
    pub notifier: Arc<dyn Notifier>,
    pub attested: Option<Arc<dyn AttestedSigner>>,
    pub clock: Arc<dyn Clock>,
    pub keypair: Arc<OracleKeypair>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub queue: Arc<dyn QueueStore>,
    pub settings: OracleSettings,
}

impl OracleContext {
    /// Build the live collaborators described by `config`.
    pub fn from_config(config: &OracleConfig) -> Result<Self> {
        let keypair = Arc::new(
            OracleKeypair::from_hex(&config.chain.private_key).context("ORACLE_PRIVATE_KEY")?,
        );
        info!(oracle = %keypair.address(), chain_id = config.chain.chain_id, "Oracle signer loaded");

        let chain = EvmChain::new(&config.chain, keypair.clone())?;
        let storage = GatewayStore::new(
            &config.storage.gateway_url,
            config.storage.api_key.clone(),
            config.storage.app_name.clone(),
            Duration::from_secs(config.storage.request_timeout_secs),
        )?;
        let notifier = AlertHub::from_config(
            &config.alerts,
            Duration::from_secs(config.storage.request_timeout_secs),
        );
        let attested = config.chain.attested_signer_url.as_ref().map(|url| {
            Arc::new(HttpAttestedSigner::new(
                url.clone(),
                config.chain.chain_id,
                Duration::from_secs(config.chain.request_timeout_secs),
            )) as Arc<dyn AttestedSigner>
        });

        Ok(Self {
            chain: Arc::new(chain),
            storage: Arc::new(storage),
            inference: Arc::new(build_inference(config)?),
            notifier: Arc::new(notifier),
            attested,
            clock: Arc::new(SystemClock),
            keypair,
            watermarks: Arc::new(JsonWatermarkStore::new(config.watermark_path())),
            queue: Arc::new(JsonQueueStore::new(config.retry_queue_path())),
            settings: OracleSettings::from_config(config),
        })
    }
}

fn build_inference(config: &OracleConfig) -> Result<LlmManager> {
    let registry = ProviderRegistry::embedded().context("embedded provider registry")?;
    let def = registry
        .resolve(&config.ai.provider, config.ai.base_url.as_deref())
        .ok_or_else(|| anyhow!("unknown AI provider '{}'", config.ai.provider))?;
    let provider_id = def.id.clone();
    let model = config
        .ai
        .model
        .clone()
        .unwrap_or_else(|| def.default_model.clone());

    let mut manager = LlmManager::new();
    manager.register_provider(Box::new(GenericProvider::new(
        def,
        config.ai.api_key.clone(),
        Duration::from_secs(config.ai.request_timeout_secs),
    )));
    manager.set_active(&provider_id, model);
    Ok(manager)
}

/// The assembled oracle: one handler set shared by ingestion and retries.
pub struct Oracle {
    identity: IdentityReconciler,
    retry: Arc<RetryQueueManager>,
    ingestor: Arc<EventIngestor>,
    worker: Arc<Mutex<()>>,
    drain_interval: Duration,
}

impl Oracle {
    pub fn new(ctx: OracleContext) -> Self {
        let settings = &ctx.settings;
        let reliability = &settings.reliability;

        let handler: Arc<dyn EventHandler> = Arc::new(HandlerSet::new(
            ctx.chain.clone(),
            ctx.storage.clone(),
            SessionKeyResolver::new(
                ctx.storage.clone(),
                ctx.keypair.clone(),
                settings.confidential,
                ctx.chain.chain_id(),
            ),
            HistoryWalker::new(ctx.storage.clone(), reliability.context_messages_limit),
            AiDispatcher::new(ctx.inference.clone(), settings.system_prompt.clone()),
            ctx.clock.clone(),
        ));

        let wrapper = Arc::new(ReliabilityWrapper::new(
            handler.clone(),
            ctx.chain.clone(),
            ctx.watermarks.clone(),
            ctx.queue.clone(),
            ctx.notifier.clone(),
            ctx.clock.clone(),
            reliability.base_delay(),
            Duration::from_secs(reliability.lag_threshold_secs),
        ));

        let retry = Arc::new(RetryQueueManager::new(
            handler,
            ctx.chain.clone(),
            ctx.queue.clone(),
            ctx.notifier.clone(),
            ctx.clock.clone(),
            reliability.max_retries,
            reliability.base_delay(),
        ));

        let worker = Arc::new(Mutex::new(()));
        let ingestor = Arc::new(EventIngestor::new(
            ctx.chain.clone(),
            wrapper,
            ctx.watermarks.clone(),
            ctx.notifier.clone(),
            worker.clone(),
            reliability.recent_lookback_blocks,
        ));

        let identity = IdentityReconciler::new(
            ctx.chain.clone(),
            ctx.attested.clone(),
            ctx.notifier.clone(),
            settings.confidential,
            settings.trusted_network,
        );

        Self {
            identity,
            retry,
            ingestor,
            worker,
            drain_interval: reliability.drain_interval(),
        }
    }

    /// One retry pass, serialized with event processing.
    pub async fn drain_once(&self) -> Result<DrainReport, OracleError> {
        let _turn = self.worker.lock().await;
        self.retry.drain().await
    }

    /// Startup sequence up to (not including) the live stream: identity,
    /// leftover retries, then historical catch-up.
    pub async fn boot(&self, lifecycle: &mut LifecycleManager) -> Result<CatchUpReport, OracleError> {
        lifecycle.enter(LifecycleState::Reconcile);
        self.identity.reconcile().await?;

        lifecycle.enter(LifecycleState::Recover);
        let report = self.drain_once().await?;
        if report.due > 0 {
            info!(?report, "Recovered leftover retries");
        }

        lifecycle.enter(LifecycleState::CatchUp);
        self.ingestor.catch_up().await
    }

    /// Boot, then process live events and drain retries until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut lifecycle = LifecycleManager::new().await?;
        let caught_up = self.boot(&mut lifecycle).await?;

        let retry = self.retry.clone();
        let worker = self.worker.clone();
        lifecycle
            .every("retry-drain", self.drain_interval, move || {
                let retry = retry.clone();
                let worker = worker.clone();
                async move {
                    let _turn = worker.lock().await;
                    match retry.drain().await {
                        Ok(report) if report.due > 0 => info!(?report, "Retry drain"),
                        Ok(_) => {}
                        Err(e) => error!("Retry drain failed: {}", e),
                    }
                }
            })
            .await?;
        lifecycle.start().await?;

        let live = self
            .ingestor
            .run_live(caught_up.to_block + 1, cancel.clone())
            .await;
        lifecycle.shutdown().await?;
        if let Err(e) = &live {
            warn!("Live processing stopped: {}", e);
        }
        live.map_err(Into::into)
    }
}

/// Snapshot of persisted progress, for operators.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub watermark: Option<Watermark>,
    pub queued: Vec<FailedJob>,
    pub due: usize,
}

pub async fn read_status(
    watermarks: &dyn WatermarkStore,
    queue: &dyn QueueStore,
    clock: &dyn Clock,
) -> Result<StatusReport, OracleError> {
    let watermark = watermarks.load().await?;
    let queued = queue.load().await?;
    let now = clock.now_ms();
    let due = queued.iter().filter(|job| job.is_due(now)).count();
    Ok(StatusReport {
        watermark,
        queued,
        due,
    })
}
