//! Wraps a single handler invocation: lag detection, classification of the
//! outcome, and the watermark/queue bookkeeping that makes delivery
//! at-least-once.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::checkpoint::{FailedJob, QueueStore, Watermark, WatermarkStore};
use crate::core::error::{Disposition, OracleError, classify};
use crate::core::events::ObservedEvent;
use crate::core::handlers::EventHandler;
use crate::core::timing::Clock;
use crate::interfaces::alerts::{Notifier, Severity};
use crate::interfaces::chain::ChainClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    /// Handler failed transiently; the retry queue now owns the request.
    Enqueued,
    /// Handler failed permanently; alerted and left for an operator.
    Rejected,
}

pub struct ReliabilityWrapper {
    handler: Arc<dyn EventHandler>,
    chain: Arc<dyn ChainClient>,
    watermarks: Arc<dyn WatermarkStore>,
    queue: Arc<dyn QueueStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    base_delay: Duration,
    lag_threshold: Duration,
}

impl ReliabilityWrapper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler: Arc<dyn EventHandler>,
        chain: Arc<dyn ChainClient>,
        watermarks: Arc<dyn WatermarkStore>,
        queue: Arc<dyn QueueStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        base_delay: Duration,
        lag_threshold: Duration,
    ) -> Self {
        Self {
            handler,
            chain,
            watermarks,
            queue,
            notifier,
            clock,
            base_delay,
            lag_threshold,
        }
    }

    /// Run the handler for `event` and record the result. Only failures to
    /// persist progress are returned as errors; handler failures are
    /// absorbed into the returned [`Outcome`].
    pub async fn process(&self, event: &ObservedEvent) -> Result<Outcome, OracleError> {
        self.check_lag(event).await;

        match self.handler.handle(&event.request).await {
            Ok(()) => {
                self.advance(event).await?;
                debug!(kind = %event.kind(), block = event.block_number, "Request handled");
                Ok(Outcome::Handled)
            }
            Err(err) => match classify(&err) {
                Disposition::Retryable => {
                    let next = self.clock.now_ms() + self.base_delay.as_millis() as u64;
                    self.queue.append(FailedJob::new(event, next)).await?;
                    self.advance(event).await?;
                    warn!(
                        kind = %event.kind(),
                        block = event.block_number,
                        tx = %event.transaction_hash,
                        "Request queued for retry: {}",
                        err
                    );
                    Ok(Outcome::Enqueued)
                }
                Disposition::Fatal => {
                    error!(
                        kind = %event.kind(),
                        block = event.block_number,
                        tx = %event.transaction_hash,
                        "Request failed permanently: {}",
                        err
                    );
                    self.notifier
                        .notify(
                            Severity::Critical,
                            &format!("{} failed", event.kind()),
                            &format!(
                                "block {} tx {} log {} conversation {}: {}",
                                event.block_number,
                                event.transaction_hash,
                                event.log_index,
                                event.request.conversation_id(),
                                err
                            ),
                        )
                        .await;
                    Ok(Outcome::Rejected)
                }
            },
        }
    }

    async fn advance(&self, event: &ObservedEvent) -> Result<(), OracleError> {
        let next = match self.watermarks.load().await? {
            Some(current) => current.advanced_to(event),
            None => Watermark::at(event),
        };
        self.watermarks.save(&next).await
    }

    /// Fire a warning when the event is older than the threshold. Never
    /// delays or fails processing.
    async fn check_lag(&self, event: &ObservedEvent) {
        let timestamp = match event.block_timestamp {
            Some(ts) => ts,
            None => match self.chain.block_timestamp(event.block_number).await {
                Ok(ts) => ts,
                Err(e) => {
                    debug!(block = event.block_number, "Skipping lag check: {}", e);
                    return;
                }
            },
        };
        let lag = self.clock.now_secs().saturating_sub(timestamp);
        if lag <= self.lag_threshold.as_secs() {
            return;
        }

        info!(block = event.block_number, lag_secs = lag, "Processing lag above threshold");
        let notifier = self.notifier.clone();
        let title = format!("High lag on {}", event.kind());
        let message = format!(
            "block {} is {}s behind (threshold {}s)",
            event.block_number,
            lag,
            self.lag_threshold.as_secs()
        );
        tokio::spawn(async move {
            notifier.notify(Severity::Warning, &title, &message).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checkpoint::{LogPosition, MemoryQueueStore, MemoryWatermarkStore};
    use crate::core::events::{JobRequest, RequestEvent};
    use crate::core::timing::ManualClock;
    use crate::test_support::{MockChain, RecordingNotifier};
    use alloy_primitives::{Address, Bytes, U256};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const NOW_SECS: u64 = 1_700_000_000;

    struct FailingWith(Mutex<Option<OracleError>>);

    #[async_trait]
    impl EventHandler for FailingWith {
        async fn handle(&self, _event: &RequestEvent) -> Result<(), OracleError> {
            match self.0.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    struct Harness {
        wrapper: ReliabilityWrapper,
        chain: Arc<MockChain>,
        watermarks: Arc<MemoryWatermarkStore>,
        queue: Arc<MemoryQueueStore>,
        alerts: Arc<RecordingNotifier>,
    }

    fn harness(failure: Option<OracleError>, initial: Option<Watermark>) -> Harness {
        let chain = Arc::new(MockChain::new(1, Address::repeat_byte(1)));
        chain.set_default_timestamp(NOW_SECS);
        let watermarks = Arc::new(MemoryWatermarkStore::new(initial));
        let queue = Arc::new(MemoryQueueStore::new(Vec::new()));
        let alerts = Arc::new(RecordingNotifier::default());
        let wrapper = ReliabilityWrapper::new(
            Arc::new(FailingWith(Mutex::new(failure))),
            chain.clone(),
            watermarks.clone(),
            queue.clone(),
            alerts.clone(),
            Arc::new(ManualClock::new(NOW_SECS * 1000)),
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        Harness {
            wrapper,
            chain,
            watermarks,
            queue,
            alerts,
        }
    }

    fn prompt(block: u64, tx: u64) -> ObservedEvent {
        ObservedEvent {
            request: RequestEvent::Prompt(JobRequest {
                user: Address::repeat_byte(2),
                conversation_id: U256::from(3u64),
                job_id: U256::from(block),
                payload: Bytes::from_static(b"{}"),
            }),
            block_number: block,
            transaction_index: tx,
            log_index: tx,
            transaction_hash: alloy_primitives::B256::repeat_byte(block as u8),
            block_timestamp: None,
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn success_advances_watermark_without_enqueue() {
        let h = harness(None, Some(Watermark::block(9)));
        let outcome = h.wrapper.process(&prompt(10, 2)).await.unwrap();
        assert_eq!(outcome, Outcome::Handled);
        let mark = h.watermarks.current().unwrap();
        assert_eq!(mark.last_processed_block, 10);
        assert_eq!(
            mark.last_processed_position,
            Some(LogPosition {
                transaction_index: 2,
                log_index: 2
            })
        );
        assert!(h.queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_enqueues_and_still_advances() {
        let h = harness(Some(OracleError::Storage("503".into())), None);
        let event = prompt(12, 0);
        let outcome = h.wrapper.process(&event).await.unwrap();
        assert_eq!(outcome, Outcome::Enqueued);

        let jobs = h.queue.snapshot();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].retry_count, 0);
        assert_eq!(jobs[0].event_name, "PromptSubmitted");
        assert_eq!(jobs[0].block_number, 12);
        assert_eq!(jobs[0].next_attempt_at, NOW_SECS * 1000 + 30_000);
        assert_eq!(h.watermarks.current().unwrap().last_processed_block, 12);
        assert!(h.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn fatal_failure_alerts_and_leaves_watermark() {
        let h = harness(
            Some(OracleError::KeyUnavailable("3".into())),
            Some(Watermark::block(4)),
        );
        let outcome = h.wrapper.process(&prompt(5, 0)).await.unwrap();
        assert_eq!(outcome, Outcome::Rejected);
        assert_eq!(h.watermarks.current(), Some(Watermark::block(4)));
        assert!(h.queue.snapshot().is_empty());
        assert_eq!(h.alerts.count(Severity::Critical), 1);
        assert!(h.alerts.alerts()[0].message.contains("block 5"));
    }

    #[tokio::test]
    async fn watermark_never_moves_backward() {
        let h = harness(None, Some(Watermark::block(50)));
        h.wrapper.process(&prompt(40, 0)).await.unwrap();
        assert_eq!(h.watermarks.current(), Some(Watermark::block(50)));
    }

    #[tokio::test]
    async fn stale_event_raises_lag_warning() {
        let h = harness(None, None);
        h.chain.set_block_timestamp(8, NOW_SECS - 301);
        h.chain.set_block_timestamp(9, NOW_SECS - 299);

        h.wrapper.process(&prompt(8, 0)).await.unwrap();
        h.wrapper.process(&prompt(9, 0)).await.unwrap();
        settle().await;

        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert!(alerts[0].message.contains("block 8"));
        assert_eq!(h.watermarks.current().unwrap().last_processed_block, 9);
    }
}
