//! Event ingestion: ordered historical catch-up followed by the live stream.
//! Both paths, and the retry drain, serialize on one worker lock so only a
//! single handler runs at a time.

use futures_util::future::try_join_all;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::checkpoint::{Watermark, WatermarkStore};
use crate::core::error::OracleError;
use crate::core::events::{EventKind, ObservedEvent};
use crate::core::reliability::{Outcome, ReliabilityWrapper};
use crate::interfaces::alerts::{Notifier, Severity};
use crate::interfaces::chain::ChainClient;

/// First block the catch-up scan must read.
///
/// A watermark that records a log position may have stopped part way through
/// its block, so that block is scanned again and already-covered logs are
/// skipped. A block-only watermark means the whole block is done.
pub fn catch_up_start(watermark: Option<&Watermark>, latest: u64, lookback: u64) -> u64 {
    match watermark {
        Some(w) if w.last_processed_position.is_some() => w.last_processed_block,
        Some(w) => w.last_processed_block + 1,
        None => latest.saturating_sub(lookback),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    pub from_block: u64,
    pub to_block: u64,
    pub handled: usize,
    pub enqueued: usize,
    pub rejected: usize,
    pub skipped: usize,
}

impl CatchUpReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Handled => self.handled += 1,
            Outcome::Enqueued => self.enqueued += 1,
            Outcome::Rejected => self.rejected += 1,
        }
    }
}

pub struct EventIngestor {
    chain: Arc<dyn ChainClient>,
    wrapper: Arc<ReliabilityWrapper>,
    watermarks: Arc<dyn WatermarkStore>,
    notifier: Arc<dyn Notifier>,
    worker: Arc<Mutex<()>>,
    lookback_blocks: u64,
}

impl EventIngestor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        wrapper: Arc<ReliabilityWrapper>,
        watermarks: Arc<dyn WatermarkStore>,
        notifier: Arc<dyn Notifier>,
        worker: Arc<Mutex<()>>,
        lookback_blocks: u64,
    ) -> Self {
        Self {
            chain,
            wrapper,
            watermarks,
            notifier,
            worker,
            lookback_blocks,
        }
    }

    /// Replay everything between the watermark and the current head. Any
    /// failure of the scan itself is alerted and returned so startup stops.
    pub async fn catch_up(&self) -> Result<CatchUpReport, OracleError> {
        match self.scan_and_process().await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.notifier
                    .notify(
                        Severity::Critical,
                        "Catch-up scan failed",
                        &format!("historical scan aborted, refusing to start: {}", err),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn scan_and_process(&self) -> Result<CatchUpReport, OracleError> {
        let watermark = self.watermarks.load().await?;
        let latest = self.chain.latest_block().await?;
        let from = catch_up_start(watermark.as_ref(), latest, self.lookback_blocks);
        let mut report = CatchUpReport {
            from_block: from,
            to_block: latest,
            ..Default::default()
        };
        if from > latest {
            debug!(from, latest, "Nothing to catch up");
            return Ok(report);
        }

        info!(from, to = latest, "Catching up on missed requests");
        let per_kind = try_join_all(
            EventKind::ALL
                .iter()
                .map(|kind| self.chain.query_events(*kind, from, latest)),
        )
        .await?;
        let events = order_events(per_kind.into_iter().flatten().collect());

        for event in &events {
            if watermark.is_some_and(|w| w.covers(event)) {
                report.skipped += 1;
                continue;
            }
            let _turn = self.worker.lock().await;
            report.record(self.wrapper.process(event).await?);
        }

        info!(
            handled = report.handled,
            enqueued = report.enqueued,
            rejected = report.rejected,
            skipped = report.skipped,
            "Catch-up complete"
        );
        Ok(report)
    }

    /// Process live events from `from_block` until cancelled or the stream
    /// ends. Returns early only if progress can no longer be persisted.
    ///
    /// A lagging RPC node can report a head behind the stored watermark, so
    /// the stream never starts before the watermark's block and events the
    /// watermark already covers are dropped.
    pub async fn run_live(
        &self,
        from_block: u64,
        cancel: CancellationToken,
    ) -> Result<(), OracleError> {
        let resume = self.watermarks.load().await?;
        let from_block = resume.map_or(from_block, |w| from_block.max(w.last_processed_block));
        let mut events = self.chain.subscribe(from_block, cancel.clone()).await?;
        info!(from_block, "Listening for new requests");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.recv() => {
                    let Some(event) = next else {
                        warn!("Live event stream closed");
                        break;
                    };
                    if resume.is_some_and(|w| w.covers(&event)) {
                        debug!(kind = %event.kind(), block = event.block_number, "Skipping already processed live event");
                        continue;
                    }
                    let _turn = self.worker.lock().await;
                    let outcome = self.wrapper.process(&event).await?;
                    debug!(kind = %event.kind(), block = event.block_number, ?outcome, "Live request processed");
                }
            }
        }
        Ok(())
    }
}

/// Stable sort into chain order across event kinds.
pub fn order_events(mut events: Vec<ObservedEvent>) -> Vec<ObservedEvent> {
    events.sort_by_key(ObservedEvent::position);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checkpoint::{LogPosition, MemoryQueueStore, MemoryWatermarkStore};
    use crate::core::events::{BranchRequest, JobRequest, MetadataRequest, RequestEvent};
    use crate::core::handlers::EventHandler;
    use crate::core::timing::ManualClock;
    use crate::test_support::{MockChain, RecordingNotifier};
    use alloy_primitives::{Address, Bytes, U256};
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct Order(std::sync::Mutex<Vec<RequestEvent>>);

    #[async_trait]
    impl EventHandler for Order {
        async fn handle(&self, event: &RequestEvent) -> Result<(), OracleError> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Harness {
        ingestor: EventIngestor,
        chain: Arc<MockChain>,
        watermarks: Arc<MemoryWatermarkStore>,
        seen: Arc<Order>,
        alerts: Arc<RecordingNotifier>,
    }

    fn harness(initial: Option<Watermark>, lookback: u64) -> Harness {
        let chain = Arc::new(MockChain::new(1, Address::repeat_byte(1)));
        chain.set_default_timestamp(1_700_000_000);
        let watermarks = Arc::new(MemoryWatermarkStore::new(initial));
        let seen = Arc::new(Order::default());
        let alerts = Arc::new(RecordingNotifier::default());
        let wrapper = Arc::new(ReliabilityWrapper::new(
            seen.clone(),
            chain.clone(),
            watermarks.clone(),
            Arc::new(MemoryQueueStore::default()),
            alerts.clone(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            Duration::from_secs(30),
            Duration::from_secs(300),
        ));
        let ingestor = EventIngestor::new(
            chain.clone(),
            wrapper,
            watermarks.clone(),
            alerts.clone(),
            Arc::new(Mutex::new(())),
            lookback,
        );
        Harness {
            ingestor,
            chain,
            watermarks,
            seen,
            alerts,
        }
    }

    fn prompt(job: u64) -> RequestEvent {
        RequestEvent::Prompt(JobRequest {
            user: Address::repeat_byte(2),
            conversation_id: U256::from(1u64),
            job_id: U256::from(job),
            payload: Bytes::new(),
        })
    }

    fn branch() -> RequestEvent {
        RequestEvent::Branch(BranchRequest {
            user: Address::repeat_byte(2),
            original_conversation_id: U256::from(1u64),
            new_conversation_id: U256::from(2u64),
            payload: Bytes::new(),
        })
    }

    fn metadata() -> RequestEvent {
        RequestEvent::Metadata(MetadataRequest {
            user: Address::repeat_byte(2),
            conversation_id: U256::from(2u64),
            payload: Bytes::new(),
        })
    }

    #[test]
    fn cold_start_uses_lookback_window() {
        assert_eq!(catch_up_start(None, 10_000, 6_000), 4_000);
        assert_eq!(catch_up_start(None, 100, 6_000), 0);
    }

    #[test]
    fn block_watermark_resumes_at_next_block() {
        assert_eq!(catch_up_start(Some(&Watermark::block(8_500)), 10_000, 6_000), 8_501);
    }

    #[test]
    fn positioned_watermark_rescans_its_block() {
        let w = Watermark {
            last_processed_block: 8_500,
            last_processed_position: Some(LogPosition {
                transaction_index: 3,
                log_index: 7,
            }),
        };
        assert_eq!(catch_up_start(Some(&w), 10_000, 6_000), 8_500);
    }

    #[tokio::test]
    async fn catch_up_processes_all_kinds_in_chain_order() {
        let h = harness(None, 1_000);
        // Emitted out of order and across kinds.
        h.chain.emit(&metadata(), 12, 0, 0);
        h.chain.emit(&prompt(2), 11, 4, 9);
        h.chain.emit(&branch(), 11, 1, 2);
        h.chain.emit(&prompt(1), 10, 0, 0);

        let report = h.ingestor.catch_up().await.unwrap();
        assert_eq!(report.handled, 4);
        assert_eq!(
            h.seen.0.lock().unwrap().clone(),
            vec![prompt(1), branch(), prompt(2), metadata()]
        );
        assert_eq!(h.watermarks.current().unwrap().last_processed_block, 12);
    }

    #[tokio::test]
    async fn same_block_siblings_after_the_watermark_are_not_lost() {
        let done = positioned(40, 1, 1);
        let h = harness(Some(done), 1_000);
        h.chain.emit(&prompt(1), 40, 0, 0);
        h.chain.emit(&prompt(2), 40, 1, 1);
        h.chain.emit(&prompt(3), 40, 2, 2);
        h.chain.emit(&prompt(4), 41, 0, 0);

        let report = h.ingestor.catch_up().await.unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(h.seen.0.lock().unwrap().clone(), vec![prompt(3), prompt(4)]);
    }

    fn positioned(block: u64, tx: u64, log: u64) -> Watermark {
        Watermark {
            last_processed_block: block,
            last_processed_position: Some(LogPosition {
                transaction_index: tx,
                log_index: log,
            }),
        }
    }

    #[tokio::test]
    async fn scan_failure_alerts_and_aborts() {
        let h = harness(None, 1_000);
        h.chain.emit(&prompt(1), 10, 0, 0);
        h.chain.fail_queries(Some("connection refused"));

        assert!(h.ingestor.catch_up().await.is_err());
        assert!(h.seen.0.lock().unwrap().is_empty());
        assert_eq!(h.alerts.count(Severity::Critical), 1);
        assert!(h.watermarks.current().is_none());
    }

    #[tokio::test]
    async fn live_stream_is_processed_until_closed() {
        let h = harness(None, 1_000);
        let chain = h.chain.clone();
        let cancel = CancellationToken::new();
        let ingestor = Arc::new(h.ingestor);

        let runner = {
            let ingestor = ingestor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ingestor.run_live(1, cancel).await })
        };
        let first = chain.emit(&prompt(1), 5, 0, 0);
        while !chain.deliver_live(first.clone()).await {
            tokio::task::yield_now().await;
        }
        assert!(chain.deliver_live(chain.emit(&prompt(2), 6, 0, 0)).await);
        chain.close_live();

        runner.await.unwrap().unwrap();
        assert_eq!(h.seen.0.lock().unwrap().clone(), vec![prompt(1), prompt(2)]);
        assert_eq!(h.watermarks.current().unwrap().last_processed_block, 6);
    }

    #[tokio::test]
    async fn live_stream_skips_events_behind_a_newer_watermark() {
        let h = harness(Some(positioned(50, 0, 3)), 1_000);
        let chain = h.chain.clone();
        let cancel = CancellationToken::new();
        let ingestor = Arc::new(h.ingestor);

        // The node lags: catch-up saw head 40, so live starts at 41.
        let runner = {
            let ingestor = ingestor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ingestor.run_live(41, cancel).await })
        };
        let stale = chain.emit(&prompt(1), 45, 0, 0);
        while !chain.deliver_live(stale.clone()).await {
            tokio::task::yield_now().await;
        }
        assert!(chain.deliver_live(chain.emit(&prompt(2), 50, 0, 3)).await);
        assert!(chain.deliver_live(chain.emit(&prompt(3), 50, 0, 4)).await);
        chain.close_live();

        runner.await.unwrap().unwrap();
        assert_eq!(h.seen.0.lock().unwrap().clone(), vec![prompt(3)]);
        assert_eq!(
            h.watermarks.current(),
            Some(positioned(50, 0, 4))
        );
    }
}
