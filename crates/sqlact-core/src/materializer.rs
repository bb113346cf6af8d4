use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::RunContext;
use crate::error::ActivityError;
use crate::merger::WorkingSet;
use crate::source::{ActivityStore, StatsSource};
use crate::types::{
    ActivityMetadata, ActivitySnapshot, Bucket, FingerprintId, StatementActivity,
    TransactionActivity, TransactionKey,
};

/// Optional hard caps on rows written per bucket, one per activity table.
///
/// Caps apply after the per-metric top-K union: the statement table keeps at
/// most `max_statement_rows` rows and the transaction table at most
/// `max_transaction_rows`, preferring rows with the most total execution time.
/// The per-metric limit itself is the `top_limit` passed alongside.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCaps {
    pub max_statement_rows: Option<usize>,
    pub max_transaction_rows: Option<usize>,
}

impl RowCaps {
    pub fn new(max_statement_rows: usize, max_transaction_rows: usize) -> Self {
        Self {
            max_statement_rows: Some(max_statement_rows),
            max_transaction_rows: Some(max_transaction_rows),
        }
    }
}

/// Turns a working set into activity rows and swaps them into the store.
#[derive(Clone)]
pub struct Materializer {
    source: Arc<dyn StatsSource>,
    store: Arc<dyn ActivityStore>,
}

impl Materializer {
    pub fn new(source: Arc<dyn StatsSource>, store: Arc<dyn ActivityStore>) -> Self {
        Self { source, store }
    }

    /// Reads everything needed for the bucket without touching the store.
    pub async fn build(
        &self,
        ctx: &RunContext,
        set: &WorkingSet,
        caps: RowCaps,
    ) -> Result<ActivitySnapshot, ActivityError> {
        let bucket = set.bucket;
        if set.is_empty() {
            return Ok(ActivitySnapshot::default());
        }

        let keys: Vec<_> = set.keys.iter().cloned().collect();
        let records = ctx
            .read("statement_stats", self.source.statement_stats(bucket, &keys))
            .await?;
        let totals = ctx
            .read("cluster_totals", self.source.cluster_totals(bucket))
            .await?;

        let mut statements: Vec<StatementActivity> = records
            .into_iter()
            .filter(|rec| rec.bucket == bucket && set.keys.contains(&rec.key))
            .map(|rec| StatementActivity {
                bucket,
                execution_total_seconds: rec.stats.total_execution_seconds(),
                execution_total_cluster_seconds: totals.statement_seconds,
                key: rec.key,
                query: rec.query,
                stats: rec.stats,
            })
            .collect();
        statements.sort_by(|a, b| a.key.cmp(&b.key));
        cap_by_runtime(
            &mut statements,
            caps.max_statement_rows,
            |row| row.execution_total_seconds,
            |a, b| a.key.cmp(&b.key),
        );

        let mut groups: BTreeMap<TransactionKey, BTreeSet<FingerprintId>> = BTreeMap::new();
        for row in &statements {
            groups
                .entry(row.key.transaction_key())
                .or_default()
                .insert(row.key.fingerprint_id);
        }
        let txn_keys: Vec<_> = groups.keys().cloned().collect();
        let txn_records = if txn_keys.is_empty() {
            Vec::new()
        } else {
            ctx.read(
                "transaction_stats",
                self.source.transaction_stats(bucket, &txn_keys),
            )
            .await?
        };

        let mut transactions = Vec::with_capacity(txn_records.len());
        for rec in txn_records {
            let Some(members) = groups.get(&rec.key) else {
                continue;
            };
            transactions.push(TransactionActivity {
                bucket,
                execution_total_seconds: rec.stats.total_execution_seconds(),
                execution_total_cluster_seconds: totals.transaction_seconds,
                metadata: ActivityMetadata::from_ids(members),
                key: rec.key,
                stats: rec.stats,
            });
        }
        if transactions.len() < groups.len() {
            tracing::debug!(
                target: "sqlact::job",
                %bucket,
                groups = groups.len(),
                found = transactions.len(),
                "some transaction groups have no transaction statistics"
            );
        }
        transactions.sort_by(|a, b| a.key.cmp(&b.key));
        transactions.dedup_by(|a, b| a.key == b.key);
        cap_by_runtime(
            &mut transactions,
            caps.max_transaction_rows,
            |row| row.execution_total_seconds,
            |a, b| a.key.cmp(&b.key),
        );

        Ok(ActivitySnapshot {
            statements,
            transactions,
        })
    }

    /// The single commit point of a run. Not cancellable once started.
    pub async fn commit(
        &self,
        bucket: Bucket,
        snapshot: ActivitySnapshot,
    ) -> Result<(), ActivityError> {
        self.store
            .replace_bucket(bucket, snapshot)
            .await
            .map_err(|source| ActivityError::Commit { bucket, source })
    }

    pub async fn materialize(
        &self,
        ctx: &RunContext,
        set: &WorkingSet,
        caps: RowCaps,
    ) -> Result<ActivitySnapshot, ActivityError> {
        let snapshot = self.build(ctx, set, caps).await?;
        ctx.check()?;
        self.commit(set.bucket, snapshot.clone()).await?;
        Ok(snapshot)
    }
}

/// Keeps the `cap` rows with the most runtime, then restores key order.
fn cap_by_runtime<T>(
    rows: &mut Vec<T>,
    cap: Option<usize>,
    runtime: impl Fn(&T) -> f64,
    key_order: impl Fn(&T, &T) -> std::cmp::Ordering,
) {
    let Some(cap) = cap else {
        return;
    };
    if rows.len() <= cap {
        return;
    }
    rows.sort_by(|a, b| runtime(b).total_cmp(&runtime(a)).then_with(|| key_order(a, b)));
    rows.truncate(cap);
    rows.sort_by(|a, b| key_order(a, b));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryActivityStore, MemoryStatsSource};
    use crate::merger::SelectionMode;
    use crate::types::{ExecStats, StatementKey, StatisticsRecord, TransactionStatisticsRecord};
    use chrono::{TimeZone, Utc};

    fn bucket() -> Bucket {
        Bucket::containing(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap())
    }

    fn stats(count: i64, latency: f64) -> ExecStats {
        ExecStats {
            execution_count: count,
            service_latency_mean: latency,
            ..ExecStats::default()
        }
    }

    fn seed(source: &MemoryStatsSource) {
        for (fp, txn, app, count) in [(1, 10, "a", 4), (2, 10, "a", 2), (3, 20, "b", 8)] {
            source.record_statement(StatisticsRecord {
                bucket: bucket(),
                key: StatementKey::new(fp, txn, app, "defaultdb"),
                query: format!("SELECT {fp}"),
                stats: stats(count, 0.5),
            });
        }
        source.record_transaction(TransactionStatisticsRecord {
            bucket: bucket(),
            key: TransactionKey::new(10, "a"),
            stats: stats(2, 1.0),
            statement_fingerprint_ids: vec![FingerprintId(1), FingerprintId(2), FingerprintId(9)],
        });
        source.record_transaction(TransactionStatisticsRecord {
            bucket: bucket(),
            key: TransactionKey::new(20, "b"),
            stats: stats(8, 0.5),
            statement_fingerprint_ids: vec![FingerprintId(3)],
        });
    }

    fn working_set(keys: &[StatementKey]) -> WorkingSet {
        WorkingSet {
            bucket: bucket(),
            mode: SelectionMode::TopK,
            keys: keys.iter().cloned().collect(),
        }
    }

    #[tokio::test]
    async fn groups_statements_into_transactions_with_metadata() {
        let source = Arc::new(MemoryStatsSource::new());
        seed(&source);
        let store = Arc::new(MemoryActivityStore::new());
        let materializer = Materializer::new(source, store.clone());
        let set = working_set(&[
            StatementKey::new(1, 10, "a", "defaultdb"),
            StatementKey::new(2, 10, "a", "defaultdb"),
            StatementKey::new(3, 20, "b", "defaultdb"),
        ]);

        let snapshot = materializer
            .materialize(&RunContext::default(), &set, RowCaps::default())
            .await
            .unwrap();
        assert_eq!(snapshot.statements.len(), 3);
        assert_eq!(snapshot.transactions.len(), 2);
        let txn_a = &snapshot.transactions[0];
        assert_eq!(txn_a.key, TransactionKey::new(10, "a"));
        // Only fingerprints from the working set, not the full transaction list.
        assert_eq!(
            txn_a.metadata.fingerprint_ids(),
            vec![FingerprintId(1), FingerprintId(2)]
        );
        // 4*0.5 + 2*0.5 + 8*0.5
        assert_eq!(snapshot.statements[0].execution_total_cluster_seconds, 7.0);
        assert_eq!(store.bucket(bucket()), Some(snapshot));
    }

    #[tokio::test]
    async fn caps_keep_the_heaviest_rows() {
        let source = Arc::new(MemoryStatsSource::new());
        seed(&source);
        let materializer = Materializer::new(source, Arc::new(MemoryActivityStore::new()));
        let set = working_set(&[
            StatementKey::new(1, 10, "a", "defaultdb"),
            StatementKey::new(2, 10, "a", "defaultdb"),
            StatementKey::new(3, 20, "b", "defaultdb"),
        ]);
        let snapshot = materializer
            .build(&RunContext::default(), &set, RowCaps::new(2, 1))
            .await
            .unwrap();
        let fps: Vec<u64> = snapshot
            .statements
            .iter()
            .map(|s| s.key.fingerprint_id.0)
            .collect();
        assert_eq!(fps, vec![1, 3]);
        assert_eq!(snapshot.transactions.len(), 1);
        assert_eq!(snapshot.transactions[0].key, TransactionKey::new(20, "b"));
    }

    #[tokio::test]
    async fn failed_commit_keeps_previous_snapshot() {
        let source = Arc::new(MemoryStatsSource::new());
        seed(&source);
        let store = Arc::new(MemoryActivityStore::new());
        let materializer = Materializer::new(source, store.clone());
        let set = working_set(&[StatementKey::new(3, 20, "b", "defaultdb")]);
        let first = materializer
            .materialize(&RunContext::default(), &set, RowCaps::default())
            .await
            .unwrap();

        store.fail_commits(true);
        let wider = working_set(&[
            StatementKey::new(1, 10, "a", "defaultdb"),
            StatementKey::new(3, 20, "b", "defaultdb"),
        ]);
        let err = materializer
            .materialize(&RunContext::default(), &wider, RowCaps::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::Commit { .. }));
        assert_eq!(store.bucket(bucket()), Some(first));
    }
}
