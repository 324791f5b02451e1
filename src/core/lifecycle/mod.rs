use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Reconcile,
    Recover,
    CatchUp,
    Live,
    Shutdown,
}

/// Tracks boot phases and owns the scheduler for periodic background jobs.
pub struct LifecycleManager {
    state: LifecycleState,
    pub scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            scheduler,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn enter(&mut self, next: LifecycleState) {
        info!("Lifecycle Phase: {:?}", next);
        self.state = next;
    }

    /// Register `task` to run every `interval` once the scheduler starts.
    pub async fn every<F, Fut>(&mut self, name: &str, interval: Duration, task: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(task);
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let task = task.clone();
            Box::pin(async move {
                task().await;
            })
        })?;
        self.scheduler.add(job).await?;
        info!("Scheduled '{}' every {}s", name, interval.as_secs());
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        self.scheduler.start().await?;
        self.enter(LifecycleState::Live);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.enter(LifecycleState::Shutdown);
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler shutdown error: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn phases_are_recorded_in_order() {
        let mut lifecycle = LifecycleManager::new().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Init);
        lifecycle.enter(LifecycleState::Reconcile);
        lifecycle.enter(LifecycleState::CatchUp);
        assert_eq!(lifecycle.state(), LifecycleState::CatchUp);
        lifecycle.shutdown().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Shutdown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn repeated_job_fires() {
        let mut lifecycle = LifecycleManager::new().await.unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        lifecycle
            .every("tick", Duration::from_secs(1), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();
        lifecycle.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        lifecycle.shutdown().await.unwrap();
        assert!(hits.load(Ordering::SeqCst) >= 1);
    }
}
