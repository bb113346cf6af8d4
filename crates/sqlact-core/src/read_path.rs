use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use crate::config::ConfigProvider;
use crate::context::RunContext;
use crate::error::ActivityError;
use crate::source::{ActivityStore, StatsSource};
use crate::types::{
    ActivityFilter, Bucket, ExecStats, FingerprintId, StatementActivity, StatementKey,
    StatisticsRecord, TransactionActivity, TransactionKey, TransactionStatisticsRecord,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    ActivityTables,
    StatisticsTables,
    /// Materialized buckets from the activity tables, the rest from statistics.
    Mixed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatementEntry {
    pub bucket: Bucket,
    pub key: StatementKey,
    pub query: String,
    pub stats: ExecStats,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransactionEntry {
    pub bucket: Bucket,
    pub key: TransactionKey,
    pub stats: ExecStats,
    #[serde(rename = "stmtFingerprintIDs")]
    pub stmt_fingerprint_ids: Vec<String>,
}

/// Same shape whichever tables served it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CombinedStatsResponse {
    pub source: ResponseSource,
    pub statements: Vec<StatementEntry>,
    pub transactions: Vec<TransactionEntry>,
}

impl From<StatementActivity> for StatementEntry {
    fn from(row: StatementActivity) -> Self {
        Self {
            bucket: row.bucket,
            key: row.key,
            query: row.query,
            stats: row.stats,
        }
    }
}

impl From<StatisticsRecord> for StatementEntry {
    fn from(rec: StatisticsRecord) -> Self {
        Self {
            bucket: rec.bucket,
            key: rec.key,
            query: rec.query,
            stats: rec.stats,
        }
    }
}

impl From<TransactionActivity> for TransactionEntry {
    fn from(row: TransactionActivity) -> Self {
        Self {
            bucket: row.bucket,
            key: row.key,
            stats: row.stats,
            stmt_fingerprint_ids: row.metadata.stmt_fingerprint_ids,
        }
    }
}

impl From<TransactionStatisticsRecord> for TransactionEntry {
    fn from(rec: TransactionStatisticsRecord) -> Self {
        Self {
            bucket: rec.bucket,
            key: rec.key,
            stats: rec.stats,
            stmt_fingerprint_ids: rec
                .statement_fingerprint_ids
                .iter()
                .map(FingerprintId::encode)
                .collect(),
        }
    }
}

/// Serves the UI from activity tables where a bucket has been materialized,
/// and from raw statistics for every other bucket of the range.
#[derive(Clone)]
pub struct ActivityReadPath {
    source: Arc<dyn StatsSource>,
    store: Arc<dyn ActivityStore>,
}

impl ActivityReadPath {
    pub fn new(source: Arc<dyn StatsSource>, store: Arc<dyn ActivityStore>) -> Self {
        Self { source, store }
    }

    pub async fn read_configured(
        &self,
        ctx: &RunContext,
        filter: &ActivityFilter,
        config: &dyn ConfigProvider,
    ) -> Result<CombinedStatsResponse, ActivityError> {
        self.read(ctx, filter, config.enabled()).await
    }

    pub async fn read(
        &self,
        ctx: &RunContext,
        filter: &ActivityFilter,
        enabled: bool,
    ) -> Result<CombinedStatsResponse, ActivityError> {
        if !enabled {
            return self.read_statistics(ctx, filter).await;
        }
        let covered = fetch(
            ctx,
            "materialized_buckets",
            self.store.materialized_buckets(filter),
        )
        .await?;
        if covered.is_empty() {
            tracing::debug!(
                target: "sqlact::read",
                start = %filter.start,
                end = %filter.end,
                "no activity rows for range; reading statistics tables"
            );
            return self.read_statistics(ctx, filter).await;
        }

        let snapshot = fetch(ctx, "activity_query", self.store.query(filter)).await?;
        let mut response = CombinedStatsResponse {
            source: ResponseSource::ActivityTables,
            statements: snapshot.statements.into_iter().map(Into::into).collect(),
            transactions: snapshot.transactions.into_iter().map(Into::into).collect(),
        };
        let gaps = uncovered_ranges(filter, &covered);
        if gaps.is_empty() {
            return Ok(response);
        }

        tracing::debug!(
            target: "sqlact::read",
            materialized = covered.len(),
            gaps = gaps.len(),
            "filling unmaterialized buckets from statistics tables"
        );
        for gap in &gaps {
            let part = self.read_statistics(ctx, gap).await?;
            response.statements.extend(part.statements);
            response.transactions.extend(part.transactions);
        }
        response
            .statements
            .sort_by(|a, b| (a.bucket, &a.key).cmp(&(b.bucket, &b.key)));
        response
            .transactions
            .sort_by(|a, b| (a.bucket, &a.key).cmp(&(b.bucket, &b.key)));
        response.source = ResponseSource::Mixed;
        Ok(response)
    }

    async fn read_statistics(
        &self,
        ctx: &RunContext,
        filter: &ActivityFilter,
    ) -> Result<CombinedStatsResponse, ActivityError> {
        let (statements, transactions) = futures_util::future::try_join(
            fetch(ctx, "scan_statements", self.source.scan_statements(filter)),
            fetch(ctx, "scan_transactions", self.source.scan_transactions(filter)),
        )
        .await?;
        Ok(CombinedStatsResponse {
            source: ResponseSource::StatisticsTables,
            statements: statements.into_iter().map(Into::into).collect(),
            transactions: transactions.into_iter().map(Into::into).collect(),
        })
    }
}

/// A read under the caller's deadline; data-layer failures surface as `ReadPath`.
async fn fetch<T, F>(ctx: &RunContext, op: &'static str, fut: F) -> Result<T, ActivityError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    ctx.read(op, fut).await.map_err(|err| match err {
        ActivityError::TransientData { source, .. } => ActivityError::ReadPath { source },
        other => other,
    })
}

/// Contiguous runs of buckets in `filter` that are absent from `covered`.
fn uncovered_ranges(filter: &ActivityFilter, covered: &BTreeSet<Bucket>) -> Vec<ActivityFilter> {
    let mut gaps = Vec::new();
    let mut cursor = filter.start;
    for bucket in covered.range(filter.start..=filter.end) {
        if *bucket > cursor {
            gaps.push(ActivityFilter {
                start: cursor,
                end: bucket.prev(),
                app_name: filter.app_name.clone(),
            });
        }
        cursor = bucket.next();
    }
    if cursor <= filter.end {
        gaps.push(ActivityFilter {
            start: cursor,
            end: filter.end,
            app_name: filter.app_name.clone(),
        });
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryActivityStore, MemoryStatsSource};
    use crate::types::{ActivityMetadata, ActivitySnapshot};
    use chrono::{TimeZone, Utc};

    fn bucket() -> Bucket {
        Bucket::containing(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap())
    }

    fn stmt(app: &str) -> StatisticsRecord {
        StatisticsRecord {
            bucket: bucket(),
            key: StatementKey::new(1, 2, app, "defaultdb"),
            query: "SELECT _".into(),
            stats: ExecStats {
                execution_count: 1,
                ..ExecStats::default()
            },
        }
    }

    #[tokio::test]
    async fn serves_activity_when_enabled_and_statistics_when_not() {
        let source = Arc::new(MemoryStatsSource::new());
        source.record_statement(stmt("A"));
        source.record_statement(stmt("B"));
        let store = Arc::new(MemoryActivityStore::new());
        store
            .replace_bucket(
                bucket(),
                ActivitySnapshot {
                    statements: vec![StatementActivity {
                        bucket: bucket(),
                        key: StatementKey::new(1, 2, "renamed", "defaultdb"),
                        query: "SELECT _".into(),
                        stats: ExecStats::default(),
                        execution_total_seconds: 0.0,
                        execution_total_cluster_seconds: 0.0,
                    }],
                    transactions: vec![TransactionActivity {
                        bucket: bucket(),
                        key: TransactionKey::new(2, "renamed"),
                        stats: ExecStats::default(),
                        execution_total_seconds: 0.0,
                        execution_total_cluster_seconds: 0.0,
                        metadata: ActivityMetadata::default(),
                    }],
                },
            )
            .await
            .unwrap();
        let read = ActivityReadPath::new(source, store);
        let filter = ActivityFilter::bucket(bucket());

        let enabled = read.read(&RunContext::default(), &filter, true).await.unwrap();
        assert_eq!(enabled.source, ResponseSource::ActivityTables);
        assert!(enabled.statements.iter().all(|s| s.key.app_name == "renamed"));

        let disabled = read.read(&RunContext::default(), &filter, false).await.unwrap();
        assert_eq!(disabled.source, ResponseSource::StatisticsTables);
        assert_eq!(disabled.statements.len(), 2);
    }

    #[tokio::test]
    async fn empty_activity_falls_back_to_statistics() {
        let source = Arc::new(MemoryStatsSource::new());
        source.record_statement(stmt("A"));
        let read = ActivityReadPath::new(source, Arc::new(MemoryActivityStore::new()));
        let res = read
            .read(
                &RunContext::default(),
                &ActivityFilter::bucket(bucket()).with_app("A"),
                true,
            )
            .await
            .unwrap();
        assert_eq!(res.source, ResponseSource::StatisticsTables);
        assert_eq!(res.statements.len(), 1);
    }

    #[tokio::test]
    async fn populated_range_is_authoritative_per_app() {
        let source = Arc::new(MemoryStatsSource::new());
        source.record_statement(stmt("A"));
        let store = Arc::new(MemoryActivityStore::new());
        store
            .replace_bucket(
                bucket(),
                ActivitySnapshot {
                    statements: vec![StatementActivity {
                        bucket: bucket(),
                        key: StatementKey::new(1, 2, "other", "defaultdb"),
                        query: "SELECT _".into(),
                        stats: ExecStats::default(),
                        execution_total_seconds: 0.0,
                        execution_total_cluster_seconds: 0.0,
                    }],
                    transactions: Vec::new(),
                },
            )
            .await
            .unwrap();
        let read = ActivityReadPath::new(source, store);
        let res = read
            .read(
                &RunContext::default(),
                &ActivityFilter::bucket(bucket()).with_app("A"),
                true,
            )
            .await
            .unwrap();
        assert_eq!(res.source, ResponseSource::ActivityTables);
        assert!(res.statements.is_empty());
    }

    #[tokio::test]
    async fn fallback_failure_is_surfaced() {
        let source = Arc::new(MemoryStatsSource::new());
        source.fail_all_reads(true);
        let read = ActivityReadPath::new(source, Arc::new(MemoryActivityStore::new()));
        let err = read
            .read(&RunContext::default(), &ActivityFilter::bucket(bucket()), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::ReadPath { .. }));
    }

    fn stmt_at(bucket: Bucket, fp: u64, app: &str) -> StatisticsRecord {
        StatisticsRecord {
            bucket,
            key: StatementKey::new(fp, fp + 100, app, "defaultdb"),
            query: format!("SELECT {fp}"),
            stats: ExecStats {
                execution_count: fp as i64,
                ..ExecStats::default()
            },
        }
    }

    #[tokio::test]
    async fn unmaterialized_hours_are_filled_from_statistics() {
        let eight = bucket().prev().prev();
        let source = Arc::new(MemoryStatsSource::new());
        source.record_statement(stmt_at(eight, 1, "A"));
        source.record_statement(stmt_at(bucket(), 2, "A"));
        let store = Arc::new(MemoryActivityStore::new());
        store
            .replace_bucket(
                bucket(),
                ActivitySnapshot {
                    statements: vec![StatementActivity {
                        bucket: bucket(),
                        key: StatementKey::new(2, 102, "A", "defaultdb"),
                        query: "SELECT 2".into(),
                        stats: ExecStats {
                            execution_count: 2,
                            ..ExecStats::default()
                        },
                        execution_total_seconds: 0.0,
                        execution_total_cluster_seconds: 0.0,
                    }],
                    transactions: Vec::new(),
                },
            )
            .await
            .unwrap();
        let read = ActivityReadPath::new(source, store);
        let filter = ActivityFilter {
            start: eight,
            end: bucket(),
            app_name: Some("A".into()),
        };
        let ctx = RunContext::default();

        let enabled = read.read(&ctx, &filter, true).await.unwrap();
        let disabled = read.read(&ctx, &filter, false).await.unwrap();
        assert_eq!(enabled.source, ResponseSource::Mixed);
        assert_eq!(enabled.statements.len(), 2);
        assert_eq!(enabled.statements, disabled.statements);
        assert_eq!(enabled.statements[0].bucket, eight);
    }

    #[test]
    fn gaps_skip_covered_buckets() {
        let b0 = bucket();
        let filter = ActivityFilter {
            start: b0,
            end: b0.next().next().next().next(),
            app_name: Some("A".into()),
        };
        let covered: BTreeSet<_> = [b0.next(), b0.next().next().next()].into_iter().collect();
        let gaps = uncovered_ranges(&filter, &covered);
        let spans: Vec<_> = gaps.iter().map(|g| (g.start, g.end)).collect();
        assert_eq!(
            spans,
            vec![
                (b0, b0),
                (b0.next().next(), b0.next().next()),
                (b0.next().next().next().next(), b0.next().next().next().next()),
            ]
        );
        assert!(gaps.iter().all(|g| g.app_name.as_deref() == Some("A")));

        let all: BTreeSet<_> = [b0].into_iter().collect();
        assert!(uncovered_ranges(&ActivityFilter::bucket(b0), &all).is_empty());
    }

    #[tokio::test]
    async fn reads_honor_cancellation_and_deadline() {
        let source = Arc::new(MemoryStatsSource::new());
        source.record_statement(stmt("A"));
        source.set_latency(std::time::Duration::from_secs(5));
        let read = ActivityReadPath::new(source, Arc::new(MemoryActivityStore::new()));
        let filter = ActivityFilter::bucket(bucket());

        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let cancelled = RunContext::new(token, std::time::Duration::from_secs(30));
        let err = read.read(&cancelled, &filter, false).await.unwrap_err();
        assert!(matches!(err, ActivityError::Cancelled));

        let short = RunContext::new(
            tokio_util::sync::CancellationToken::new(),
            std::time::Duration::from_millis(20),
        );
        let err = read.read(&short, &filter, false).await.unwrap_err();
        assert!(matches!(err, ActivityError::ReadPath { .. }));
    }
}
