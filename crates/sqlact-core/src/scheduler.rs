use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ActivityError;
use crate::job::ActivityJob;

/// Drives [`ActivityJob::run`] on a fixed interval and whenever the stats
/// flush signals new data. Runs are strictly serial.
pub struct ActivityScheduler {
    job: Arc<ActivityJob>,
    interval: Duration,
    flushed: Arc<Notify>,
}

impl ActivityScheduler {
    pub fn new(job: Arc<ActivityJob>, interval: Duration) -> Self {
        Self {
            job,
            interval,
            flushed: Arc::new(Notify::new()),
        }
    }

    /// Handle the flush pipeline pokes after each completed flush.
    pub fn flush_signal(&self) -> Arc<Notify> {
        self.flushed.clone()
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(target: "sqlact::scheduler", "activity scheduler cancelled");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.flushed.notified() => {
                    debug!(target: "sqlact::scheduler", "stats flush signalled");
                }
            }
            match self.job.run(cancel.child_token()).await {
                Ok(report) => debug!(
                    target: "sqlact::scheduler",
                    bucket = %report.bucket,
                    outcome = report.outcome.as_str(),
                    "activity run finished"
                ),
                Err(ActivityError::Cancelled) => break,
                Err(err) => warn!(
                    target: "sqlact::scheduler",
                    error = %err,
                    retryable = err.is_retryable(),
                    "activity run failed; retrying on next wake"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::{ActivitySettings, SettingsHandle};
    use crate::job::RunOutcome;
    use crate::memory::{MemoryActivityStore, MemoryStatsSource};
    use crate::types::{Bucket, ExecStats, StatementKey, StatisticsRecord};
    use chrono::{TimeZone, Utc};

    async fn wait_for_report(job: &ActivityJob, outcome: RunOutcome) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if job.last_report().map(|r| r.outcome) == Some(outcome) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("scheduler never produced the expected report");
    }

    #[tokio::test]
    async fn runs_on_flush_and_survives_failures() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 5, 0).unwrap();
        let bucket = Bucket::containing(now);
        let source = Arc::new(MemoryStatsSource::new());
        let store = Arc::new(MemoryActivityStore::new());
        let job = Arc::new(ActivityJob::new(
            source.clone(),
            store.clone(),
            Arc::new(SettingsHandle::new(ActivitySettings::default())),
            Arc::new(FixedClock::new(now)),
        ));

        source.fail_all_reads(true);
        let scheduler = ActivityScheduler::new(job.clone(), Duration::from_secs(3600));
        let flushed = scheduler.flush_signal();
        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());

        // The first tick fires immediately and fails.
        wait_for_report(&job, RunOutcome::Failed).await;

        source.clear_faults();
        source.record_statement(StatisticsRecord {
            bucket,
            key: StatementKey::new(1, 2, "A", "defaultdb"),
            query: "SELECT _".into(),
            stats: ExecStats {
                execution_count: 1,
                ..ExecStats::default()
            },
        });
        flushed.notify_one();
        wait_for_report(&job, RunOutcome::Succeeded).await;
        assert_eq!(store.bucket(bucket).map(|s| s.statements.len()), Some(1));

        cancel.cancel();
        handle.await.unwrap();
    }
}
