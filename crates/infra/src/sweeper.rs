//! Periodic maintenance: stale reclaim and retention purges.

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info};

use crate::dead_letter::{DeadLetterError, DeadLetterStore};
use crate::queue::JobQueue;

/// Sweeper configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweeperConfig {
    /// `active` jobs claimed longer ago than this are returned to the queue
    pub stale_after: Duration,
    pub interval: Duration,
    pub completed_retention: Duration,
    /// `None` keeps dead letters until an operator purges them
    pub dead_letter_retention: Option<Duration>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            interval: Duration::from_secs(30),
            completed_retention: Duration::from_secs(24 * 60 * 60),
            dead_letter_retention: Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub completed_purged: u64,
    pub dead_letters_purged: u64,
}

#[derive(Debug, Clone)]
pub struct Sweeper {
    queue: JobQueue,
    dead_letters: DeadLetterStore,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(queue: JobQueue, dead_letters: DeadLetterStore, config: SweeperConfig) -> Self {
        Self {
            queue,
            dead_letters,
            config,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, DeadLetterError> {
        let reclaimed = self.queue.reclaim_stale(self.config.stale_after).await?.len();
        let completed_purged = self
            .queue
            .purge_completed(self.config.completed_retention)
            .await?;
        let dead_letters_purged = match self.config.dead_letter_retention {
            Some(retention) => self.dead_letters.purge_older_than(retention).await?,
            None => 0,
        };

        let report = SweepReport {
            reclaimed,
            completed_purged,
            dead_letters_purged,
        };
        if report != SweepReport::default() {
            info!(
                reclaimed,
                completed_purged, dead_letters_purged, "maintenance sweep finished"
            );
        } else {
            debug!("maintenance sweep found nothing to do");
        }
        Ok(report)
    }

    /// Sweep now and then every `interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(self.config.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = self.run_once().await {
                                error!(error = %e, "maintenance sweep failed");
                            }
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("sweeper")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::Utc;
    use conductor_core::{JobError, JobRequest, JobStatus};

    fn setup(config: SweeperConfig) -> (Sweeper, JobQueue, DeadLetterStore) {
        let store = InMemoryStore::arc();
        let queue = JobQueue::new(store.clone(), 100);
        let dead_letters = DeadLetterStore::new(store, queue.clone());
        (
            Sweeper::new(queue.clone(), dead_letters.clone(), config),
            queue,
            dead_letters,
        )
    }

    fn job() -> conductor_core::Job {
        JobRequest::new("scan-browser", serde_json::json!({}))
            .into_job(3, Utc::now())
            .unwrap()
    }

    #[tokio::test]
    async fn reclaims_abandoned_active_jobs() {
        let (sweeper, queue, _) = setup(SweeperConfig {
            stale_after: Duration::ZERO,
            ..SweeperConfig::default()
        });
        let id = queue.enqueue(job()).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.reclaimed, 1);

        let reclaimed = queue.get(id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, JobStatus::Queued);
        assert_eq!(reclaimed.attempts, 0);
    }

    #[tokio::test]
    async fn fresh_claims_are_left_alone() {
        let (sweeper, queue, _) = setup(SweeperConfig::default());
        queue.enqueue(job()).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();

        assert_eq!(sweeper.run_once().await.unwrap().reclaimed, 0);
        assert_eq!(queue.depth().await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn purges_by_retention() {
        let (sweeper, queue, dead_letters) = setup(SweeperConfig {
            completed_retention: Duration::ZERO,
            dead_letter_retention: Some(Duration::ZERO),
            ..SweeperConfig::default()
        });

        queue.enqueue(job()).await.unwrap();
        let mut done = queue.dequeue_next().await.unwrap().unwrap();
        queue.mark_completed(&mut done).await.unwrap();

        queue.enqueue(job()).await.unwrap();
        let mut failed = queue.dequeue_next().await.unwrap().unwrap();
        dead_letters
            .capture(&mut failed, JobError::terminal("bad"))
            .await
            .unwrap();

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.completed_purged, 1);
        assert_eq!(report.dead_letters_purged, 1);
        assert!(queue.get(done.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_letters_kept_without_retention() {
        let (sweeper, queue, dead_letters) = setup(SweeperConfig {
            dead_letter_retention: None,
            ..SweeperConfig::default()
        });
        queue.enqueue(job()).await.unwrap();
        let mut failed = queue.dequeue_next().await.unwrap().unwrap();
        dead_letters
            .capture(&mut failed, JobError::terminal("bad"))
            .await
            .unwrap();

        assert_eq!(sweeper.run_once().await.unwrap().dead_letters_purged, 0);
    }

    #[tokio::test]
    async fn spawned_sweeper_stops_on_shutdown() {
        let (sweeper, _, _) = setup(SweeperConfig {
            interval: Duration::from_millis(10),
            ..SweeperConfig::default()
        });
        let shutdown = CancellationToken::new();
        let task = sweeper.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        task.await.unwrap();
    }
}
