//! Periodic drain of the persisted retry queue.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::checkpoint::{FailedJob, QueueStore};
use crate::core::error::OracleError;
use crate::core::events::{ObservedEvent, RequestEvent, decode_log};
use crate::core::handlers::EventHandler;
use crate::core::timing::{Clock, backoff_delay};
use crate::interfaces::alerts::{Notifier, Severity};
use crate::interfaces::chain::ChainClient;

/// Counts from one pass over the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub due: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Jobs not yet due, left untouched.
    pub deferred: usize,
}

pub struct RetryQueueManager {
    handler: Arc<dyn EventHandler>,
    chain: Arc<dyn ChainClient>,
    queue: Arc<dyn QueueStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    base_delay: Duration,
}

impl RetryQueueManager {
    pub fn new(
        handler: Arc<dyn EventHandler>,
        chain: Arc<dyn ChainClient>,
        queue: Arc<dyn QueueStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        max_retries: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            handler,
            chain,
            queue,
            notifier,
            clock,
            max_retries,
            base_delay,
        }
    }

    pub async fn drain(&self) -> Result<DrainReport, OracleError> {
        let jobs = self.queue.load().await?;
        let now = self.clock.now_ms();
        let mut report = DrainReport::default();
        let mut kept = Vec::with_capacity(jobs.len());

        for mut job in jobs {
            if !job.is_due(now) {
                report.deferred += 1;
                kept.push(job);
                continue;
            }
            report.due += 1;

            let attempt = match self.reconstruct(&job).await {
                Ok(event) => self.handler.handle(&event.request).await,
                Err(e) => Err(e),
            };

            match attempt {
                Ok(()) => {
                    report.succeeded += 1;
                    info!(
                        event = %job.event_name,
                        block = job.block_number,
                        attempts = job.retry_count + 1,
                        "Retried request succeeded"
                    );
                }
                Err(err) => {
                    job.retry_count += 1;
                    if job.retry_count >= self.max_retries {
                        report.dead_lettered += 1;
                        self.dead_letter(&job, &err).await;
                    } else {
                        let delay = backoff_delay(self.base_delay, job.retry_count);
                        job.next_attempt_at = now + delay.as_millis() as u64;
                        report.rescheduled += 1;
                        warn!(
                            event = %job.event_name,
                            block = job.block_number,
                            retry = job.retry_count,
                            delay_secs = delay.as_secs(),
                            "Retry failed: {}",
                            err
                        );
                        kept.push(job);
                    }
                }
            }
        }

        if report.due > 0 {
            self.queue.save(&kept).await?;
        }
        debug!(?report, "Retry queue drained");
        Ok(report)
    }

    /// Rebuild the typed event from the transaction receipt. The queue only
    /// keeps primitive fields, so the log is decoded again.
    async fn reconstruct(&self, job: &FailedJob) -> Result<ObservedEvent, OracleError> {
        let kind = job
            .kind()
            .ok_or_else(|| OracleError::Malformed(format!("unknown event {}", job.event_name)))?;
        let receipt = self
            .chain
            .transaction_receipt(job.transaction_hash)
            .await?
            .ok_or_else(|| {
                OracleError::Rpc(format!("receipt for {} not found", job.transaction_hash))
            })?;

        let contract = self.chain.contract_address();
        let candidates: Vec<ObservedEvent> = receipt
            .logs
            .iter()
            .filter(|log| log.address == contract)
            .filter(|log| log.topics.first() == Some(&kind.topic()))
            .filter_map(|log| decode_log(log).ok())
            .collect();

        let queued = RequestEvent::from_args(kind, &job.event_args).ok();
        let exact = candidates
            .iter()
            .position(|event| queued.as_ref() == Some(&event.request));
        match exact {
            Some(i) => Ok(candidates[i].clone()),
            None => candidates.into_iter().next().ok_or_else(|| {
                OracleError::Malformed(format!(
                    "no {} log in {}",
                    job.event_name, job.transaction_hash
                ))
            }),
        }
    }

    async fn dead_letter(&self, job: &FailedJob, err: &OracleError) {
        error!(
            event = %job.event_name,
            block = job.block_number,
            tx = %job.transaction_hash,
            retries = job.retry_count,
            "Dead-lettering request: {}",
            err
        );
        self.notifier
            .notify(
                Severity::Critical,
                &format!("Dead letter: {}", job.event_name),
                &format!(
                    "{} at block {} (tx {}) dropped after {} attempts: {}",
                    job.event_name, job.block_number, job.transaction_hash, job.retry_count, err
                ),
            )
            .await;
    }
}
