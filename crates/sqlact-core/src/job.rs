use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::TimeSource;
use crate::config::ConfigProvider;
use crate::context::{RunContext, DEFAULT_QUERY_TIMEOUT};
use crate::error::ActivityError;
use crate::materializer::{Materializer, RowCaps};
use crate::merger::{SelectionMode, TopKUnionMerger, WorkingSet};
use crate::source::{ActivityStore, StatsSource};
use crate::types::{ActivitySnapshot, Bucket};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// Materialization disabled; the store was not touched.
    Skipped,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Skipped => "skipped",
            RunOutcome::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub bucket: Bucket,
    pub top_limit: i64,
    pub outcome: RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<SelectionMode>,
    pub working_set: usize,
    pub statement_rows: usize,
    pub transaction_rows: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    fn new(bucket: Bucket, top_limit: i64, outcome: RunOutcome) -> Self {
        Self {
            bucket,
            top_limit,
            outcome,
            mode: None,
            working_set: 0,
            statement_rows: 0,
            transaction_rows: 0,
            elapsed_ms: 0,
            error: None,
        }
    }
}

/// Periodic compaction of raw statistics into the activity tables.
///
/// A run reads its configuration once, resolves the target bucket, merges the
/// per-metric top-K selections and replaces the bucket atomically. Every
/// failure before the replace leaves the store exactly as it was.
pub struct ActivityJob {
    config: Arc<dyn ConfigProvider>,
    clock: Arc<dyn TimeSource>,
    merger: TopKUnionMerger,
    materializer: Materializer,
    query_timeout: Duration,
    state: watch::Sender<JobState>,
    last_report: Mutex<Option<RunReport>>,
}

impl ActivityJob {
    pub fn new(
        source: Arc<dyn StatsSource>,
        store: Arc<dyn ActivityStore>,
        config: Arc<dyn ConfigProvider>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let (state, _) = watch::channel(JobState::Idle);
        Self {
            config,
            clock,
            merger: TopKUnionMerger::new(source.clone()),
            materializer: Materializer::new(source, store),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            state,
            last_report: Mutex::new(None),
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Scheduled entry point: configuration and bucket come from the
    /// injected providers.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, ActivityError> {
        let config = self.config.run_config();
        let bucket = self.clock.current_bucket();
        self.execute(bucket, config.top_limit, config.caps, config.enabled, cancel)
            .await
    }

    /// On-demand entry point with explicit bucket, per-metric limit and
    /// per-table row caps.
    pub async fn transfer_top_stats(
        &self,
        bucket: Bucket,
        top_limit: i64,
        caps: RowCaps,
        cancel: CancellationToken,
    ) -> Result<RunReport, ActivityError> {
        self.execute(bucket, top_limit, caps, true, cancel).await
    }

    async fn execute(
        &self,
        bucket: Bucket,
        top_limit: i64,
        caps: RowCaps,
        enabled: bool,
        cancel: CancellationToken,
    ) -> Result<RunReport, ActivityError> {
        let started = Instant::now();
        self.state.send_replace(JobState::Running);
        let ctx = RunContext::new(cancel, self.query_timeout);

        let result = if enabled {
            self.pipeline(&ctx, bucket, top_limit, caps).await.map(Some)
        } else {
            info!(
                target: "sqlact::job",
                %bucket,
                "activity materialization disabled; skipping run"
            );
            Ok(None)
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (report, result) = match result {
            Ok(output) => {
                let mut report = RunReport::new(
                    bucket,
                    top_limit,
                    if output.is_some() {
                        RunOutcome::Succeeded
                    } else {
                        RunOutcome::Skipped
                    },
                );
                report.elapsed_ms = elapsed_ms;
                if let Some((set, snapshot)) = output {
                    report.mode = Some(set.mode);
                    report.working_set = set.len();
                    report.statement_rows = snapshot.statements.len();
                    report.transaction_rows = snapshot.transactions.len();
                    info!(
                        target: "sqlact::job",
                        %bucket,
                        top_limit,
                        mode = ?set.mode,
                        working_set = set.len(),
                        statement_rows = report.statement_rows,
                        transaction_rows = report.transaction_rows,
                        elapsed_ms,
                        "activity bucket replaced"
                    );
                }
                self.state.send_replace(JobState::Succeeded);
                (report.clone(), Ok(report))
            }
            Err(err) => {
                warn!(
                    target: "sqlact::job",
                    %bucket,
                    top_limit,
                    kind = err.kind(),
                    error = %err,
                    elapsed_ms,
                    "activity run failed; previous snapshot kept"
                );
                let mut report = RunReport::new(bucket, top_limit, RunOutcome::Failed);
                report.elapsed_ms = elapsed_ms;
                report.error = Some(err.to_string());
                self.state.send_replace(JobState::Failed);
                (report, Err(err))
            }
        };

        #[cfg(feature = "metrics")]
        {
            metrics::counter!("sqlact.job.runs", "outcome" => report.outcome.as_str())
                .increment(1);
            metrics::histogram!("sqlact.job.duration_ms").record(elapsed_ms as f64);
        }

        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);
        self.state.send_replace(JobState::Idle);
        result
    }

    async fn pipeline(
        &self,
        ctx: &RunContext,
        bucket: Bucket,
        top_limit: i64,
        caps: RowCaps,
    ) -> Result<(WorkingSet, ActivitySnapshot), ActivityError> {
        if top_limit <= 0 {
            let err = ActivityError::Configuration(format!(
                "top limit {top_limit} is not positive; selecting nothing"
            ));
            warn!(target: "sqlact::job", %bucket, error = %err, "bad activity configuration");
        }
        ctx.check()?;
        let set = self.merger.merge(ctx, bucket, top_limit).await?;
        debug_assert!(set.len() <= TopKUnionMerger::max_rows(top_limit));
        ctx.check()?;
        let snapshot = self.materializer.materialize(ctx, &set, caps).await?;
        Ok((set, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::{ActivitySettings, RunConfig, SettingsHandle};
    use crate::memory::{MemoryActivityStore, MemoryStatsSource};
    use crate::ranking::RankingMetric;
    use crate::types::{
        ExecStats, FingerprintId, StatementKey, StatisticsRecord, TransactionKey,
        TransactionStatisticsRecord,
    };
    use chrono::{TimeZone, Utc};

    struct Fixture {
        source: Arc<MemoryStatsSource>,
        store: Arc<MemoryActivityStore>,
        settings: SettingsHandle,
        job: ActivityJob,
        bucket: Bucket,
    }

    fn fixture(top_limit: i64) -> Fixture {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 42, 0).unwrap();
        let source = Arc::new(MemoryStatsSource::new());
        let store = Arc::new(MemoryActivityStore::new());
        let settings = SettingsHandle::new(ActivitySettings {
            top_limit,
            ..ActivitySettings::default()
        });
        let job = ActivityJob::new(
            source.clone(),
            store.clone(),
            Arc::new(settings.clone()),
            Arc::new(FixedClock::new(now)),
        );
        Fixture {
            source,
            store,
            settings,
            job,
            bucket: Bucket::containing(now),
        }
    }

    fn seed(f: &Fixture, n: u64) {
        for i in 1..=n {
            f.source.record_statement(StatisticsRecord {
                bucket: f.bucket,
                key: StatementKey::new(i, 1000 + i, format!("app{i}"), "defaultdb"),
                query: "SELECT _".into(),
                stats: ExecStats {
                    execution_count: i as i64,
                    service_latency_mean: 0.01 * (n - i + 1) as f64,
                    contention_time_mean: ((i * 7) % n) as f64,
                    cpu_sql_nanos_mean: ((i * 11) % n) as f64,
                    service_latency_p99: ((i * 13) % n) as f64,
                },
            });
            f.source.record_transaction(TransactionStatisticsRecord {
                bucket: f.bucket,
                key: TransactionKey::new(1000 + i, format!("app{i}")),
                stats: ExecStats {
                    execution_count: i as i64,
                    service_latency_mean: 0.02,
                    ..ExecStats::default()
                },
                statement_fingerprint_ids: vec![FingerprintId(i)],
            });
        }
    }

    #[tokio::test]
    async fn run_respects_bound_and_returns_to_idle() {
        let f = fixture(2);
        seed(&f, 40);
        let report = f.job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.mode, Some(SelectionMode::TopK));
        let snapshot = f.store.bucket(f.bucket).unwrap();
        assert!(snapshot.statements.len() <= 12);
        assert!(snapshot.transactions.len() <= 12);
        assert_eq!(report.statement_rows, snapshot.statements.len());
        assert_eq!(f.job.state(), JobState::Idle);
        assert_eq!(
            f.job.last_report().map(|r| r.outcome),
            Some(RunOutcome::Succeeded)
        );
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let f = fixture(3);
        seed(&f, 50);
        f.job.run(CancellationToken::new()).await.unwrap();
        let first = f.store.bucket(f.bucket).unwrap();
        f.job.run(CancellationToken::new()).await.unwrap();
        let second = f.store.bucket(f.bucket).unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn failed_metric_leaves_store_untouched() {
        let f = fixture(2);
        seed(&f, 40);
        f.job.run(CancellationToken::new()).await.unwrap();
        let before = f.store.bucket(f.bucket);

        // New data that would change the snapshot if the run went through.
        for i in 41..=60 {
            f.source.record_statement(StatisticsRecord {
                bucket: f.bucket,
                key: StatementKey::new(i, 1, "late", "defaultdb"),
                query: "SELECT _".into(),
                stats: ExecStats {
                    execution_count: 1_000_000,
                    ..ExecStats::default()
                },
            });
        }
        f.source.fail_metric(RankingMetric::ContentionTime);
        let err = f.job.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ActivityError::TransientData { .. }));
        assert_eq!(f.store.bucket(f.bucket), before);
        assert_eq!(
            f.job.last_report().map(|r| r.outcome),
            Some(RunOutcome::Failed)
        );
        assert_eq!(f.job.state(), JobState::Idle);
    }

    #[tokio::test]
    async fn disabled_run_is_skipped() {
        let f = fixture(2);
        seed(&f, 5);
        f.settings.set_ui_enabled(false);
        let report = f.job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Skipped);
        assert!(f.store.bucket(f.bucket).is_none());
    }

    #[tokio::test]
    async fn non_positive_limit_clears_the_bucket() {
        let f = fixture(2);
        seed(&f, 5);
        f.job.run(CancellationToken::new()).await.unwrap();
        assert!(f.store.bucket(f.bucket).is_some());

        f.settings.set_top_limit(0);
        let report = f.job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.working_set, 0);
        assert!(f.store.bucket(f.bucket).is_none());
    }

    #[tokio::test]
    async fn cancelled_run_has_no_effect() {
        let f = fixture(2);
        seed(&f, 40);
        let token = CancellationToken::new();
        token.cancel();
        let err = f.job.run(token).await.unwrap_err();
        assert!(matches!(err, ActivityError::Cancelled));
        assert!(f.store.bucket(f.bucket).is_none());
    }

    #[tokio::test]
    async fn state_passes_through_running() {
        let f = fixture(2);
        seed(&f, 10);
        f.source.set_latency(Duration::from_millis(50));
        let mut rx = f.job.subscribe();
        let job = Arc::new(f.job);
        let runner = {
            let job = job.clone();
            tokio::spawn(async move { job.run(CancellationToken::new()).await })
        };
        rx.wait_for(|s| *s == JobState::Running).await.unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(job.state(), JobState::Idle);
    }

    #[tokio::test]
    async fn transfer_top_stats_uses_explicit_arguments() {
        let f = fixture(500);
        seed(&f, 30);
        f.settings.set_ui_enabled(false);
        let report = f
            .job
            .transfer_top_stats(f.bucket, 1, RowCaps::new(4, 2), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.top_limit, 1);
        assert_eq!(report.statement_rows, 4);
        assert!(report.transaction_rows <= 2);
        let snapshot = f.store.bucket(f.bucket).unwrap();
        for txn in &snapshot.transactions {
            assert!(!txn.metadata.stmt_fingerprint_ids.is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_selection_keeps_previous_snapshot() {
        let f = fixture(2);
        seed(&f, 40);
        f.job.run(CancellationToken::new()).await.unwrap();
        let before = f.store.bucket(f.bucket).unwrap();

        // Each read now takes 200ms: the key count ends at 200ms and the six
        // selector reads are in flight until 400ms.
        f.source.set_latency(Duration::from_millis(200));
        let job = Arc::new(f.job);
        let token = CancellationToken::new();
        let runner = {
            let job = job.clone();
            let token = token.clone();
            tokio::spawn(async move { job.run(token).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();

        let err = runner.await.unwrap().unwrap_err();
        assert!(matches!(err, ActivityError::Cancelled));
        assert_eq!(f.store.bucket(f.bucket).unwrap(), before);
        assert_eq!(job.state(), JobState::Idle);
        assert_eq!(
            job.last_report().map(|r| r.outcome),
            Some(RunOutcome::Failed)
        );
    }

    struct SnapshotOnly;

    impl ConfigProvider for SnapshotOnly {
        fn top_k_limit(&self) -> i64 {
            0
        }

        fn enabled(&self) -> bool {
            false
        }

        fn run_config(&self) -> RunConfig {
            RunConfig {
                top_limit: 3,
                enabled: true,
                caps: RowCaps::default(),
            }
        }
    }

    #[tokio::test]
    async fn run_reads_configuration_as_one_snapshot() {
        let f = fixture(500);
        seed(&f, 5);
        let job = ActivityJob::new(
            f.source.clone(),
            f.store.clone(),
            Arc::new(SnapshotOnly),
            Arc::new(FixedClock::new(f.bucket.start())),
        );
        let report = job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.top_limit, 3);
        assert_eq!(report.statement_rows, 5);
    }
}
