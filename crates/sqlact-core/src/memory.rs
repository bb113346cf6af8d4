//! In-memory statistics and activity backends for single-process use and tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::ranking::RankingMetric;
use crate::selector::rank_order;
use crate::source::{ActivityStore, ClusterTotals, RankedKey, StatsSource};
use crate::types::{
    ActivityFilter, ActivitySnapshot, Bucket, StatementKey, StatisticsRecord, TransactionKey,
    TransactionStatisticsRecord,
};

#[derive(Default)]
struct StatsTables {
    statements: BTreeMap<(Bucket, StatementKey), StatisticsRecord>,
    transactions: BTreeMap<(Bucket, TransactionKey), TransactionStatisticsRecord>,
}

/// Statistics held in sorted maps, with switchable read faults.
#[derive(Default)]
pub struct MemoryStatsSource {
    tables: RwLock<StatsTables>,
    failing_metrics: Mutex<HashSet<RankingMetric>>,
    fail_all: AtomicBool,
    latency: Mutex<Duration>,
}

impl MemoryStatsSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts by bucket and key, like a flush would.
    pub fn record_statement(&self, record: StatisticsRecord) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables
            .statements
            .insert((record.bucket, record.key.clone()), record);
    }

    pub fn record_transaction(&self, record: TransactionStatisticsRecord) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables
            .transactions
            .insert((record.bucket, record.key.clone()), record);
    }

    pub fn reset(&self) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        *tables = StatsTables::default();
    }

    pub fn statement_count(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .statements
            .len()
    }

    pub fn transaction_count(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .transactions
            .len()
    }

    /// Makes ranking reads for `metric` fail until [`Self::clear_faults`].
    pub fn fail_metric(&self, metric: RankingMetric) {
        self.failing_metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(metric);
    }

    pub fn fail_all_reads(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.failing_metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.fail_all.store(false, Ordering::SeqCst);
    }

    /// Delay added to every read.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    async fn before_read(&self, op: &str) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.fail_all.load(Ordering::SeqCst) {
            bail!("injected failure in {op}");
        }
        Ok(())
    }

    fn with_tables<T>(&self, f: impl FnOnce(&StatsTables) -> T) -> T {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        f(&tables)
    }
}

#[async_trait::async_trait]
impl StatsSource for MemoryStatsSource {
    async fn top_statements_by_metric(
        &self,
        bucket: Bucket,
        metric: RankingMetric,
        limit: usize,
    ) -> Result<Vec<RankedKey>> {
        self.before_read("top_statements_by_metric").await?;
        if self
            .failing_metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&metric)
        {
            return Err(anyhow!("injected failure ranking by {metric}"));
        }
        let mut ranked: Vec<RankedKey> = self.with_tables(|t| {
            t.statements
                .values()
                .filter(|rec| rec.bucket == bucket)
                .map(|rec| RankedKey {
                    key: rec.key.clone(),
                    value: metric.value(&rec.stats),
                })
                .collect()
        });
        rank_order(&mut ranked);
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn statement_key_count(&self, bucket: Bucket) -> Result<usize> {
        self.before_read("statement_key_count").await?;
        Ok(self.with_tables(|t| t.statements.keys().filter(|(b, _)| *b == bucket).count()))
    }

    async fn statement_keys(&self, bucket: Bucket) -> Result<Vec<StatementKey>> {
        self.before_read("statement_keys").await?;
        Ok(self.with_tables(|t| {
            t.statements
                .keys()
                .filter(|(b, _)| *b == bucket)
                .map(|(_, key)| key.clone())
                .collect()
        }))
    }

    async fn statement_stats(
        &self,
        bucket: Bucket,
        keys: &[StatementKey],
    ) -> Result<Vec<StatisticsRecord>> {
        self.before_read("statement_stats").await?;
        Ok(self.with_tables(|t| {
            keys.iter()
                .filter_map(|key| t.statements.get(&(bucket, key.clone())).cloned())
                .collect()
        }))
    }

    async fn transaction_stats(
        &self,
        bucket: Bucket,
        keys: &[TransactionKey],
    ) -> Result<Vec<TransactionStatisticsRecord>> {
        self.before_read("transaction_stats").await?;
        Ok(self.with_tables(|t| {
            keys.iter()
                .filter_map(|key| t.transactions.get(&(bucket, key.clone())).cloned())
                .collect()
        }))
    }

    async fn cluster_totals(&self, bucket: Bucket) -> Result<ClusterTotals> {
        self.before_read("cluster_totals").await?;
        Ok(self.with_tables(|t| ClusterTotals {
            statement_seconds: t
                .statements
                .values()
                .filter(|rec| rec.bucket == bucket)
                .map(|rec| rec.stats.total_execution_seconds())
                .sum(),
            transaction_seconds: t
                .transactions
                .values()
                .filter(|rec| rec.bucket == bucket)
                .map(|rec| rec.stats.total_execution_seconds())
                .sum(),
        }))
    }

    async fn scan_statements(&self, filter: &ActivityFilter) -> Result<Vec<StatisticsRecord>> {
        self.before_read("scan_statements").await?;
        Ok(self.with_tables(|t| {
            t.statements
                .values()
                .filter(|rec| filter.matches(rec.bucket, &rec.key.app_name))
                .cloned()
                .collect()
        }))
    }

    async fn scan_transactions(
        &self,
        filter: &ActivityFilter,
    ) -> Result<Vec<TransactionStatisticsRecord>> {
        self.before_read("scan_transactions").await?;
        Ok(self.with_tables(|t| {
            t.transactions
                .values()
                .filter(|rec| filter.matches(rec.bucket, &rec.key.app_name))
                .cloned()
                .collect()
        }))
    }
}

/// Activity snapshots keyed by bucket; a replace swaps the whole entry.
#[derive(Default)]
pub struct MemoryActivityStore {
    buckets: RwLock<BTreeMap<Bucket, ActivitySnapshot>>,
    fail_commits: AtomicBool,
}

impl MemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(&self, bucket: Bucket) -> Option<ActivitySnapshot> {
        self.buckets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&bucket)
            .cloned()
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.buckets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn row_count(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(ActivitySnapshot::row_count)
            .sum()
    }
}

#[async_trait::async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn replace_bucket(&self, bucket: Bucket, snapshot: ActivitySnapshot) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            bail!("injected commit failure");
        }
        let stray = snapshot.statements.iter().any(|r| r.bucket != bucket)
            || snapshot.transactions.iter().any(|r| r.bucket != bucket);
        if stray {
            bail!("snapshot contains rows outside bucket {bucket}");
        }
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        if snapshot.is_empty() {
            buckets.remove(&bucket);
        } else {
            buckets.insert(bucket, snapshot);
        }
        Ok(())
    }

    async fn query(&self, filter: &ActivityFilter) -> Result<ActivitySnapshot> {
        let mut out = ActivitySnapshot::default();
        if filter.start > filter.end {
            return Ok(out);
        }
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        for snapshot in buckets.range(filter.start..=filter.end).map(|(_, s)| s) {
            out.statements.extend(
                snapshot
                    .statements
                    .iter()
                    .filter(|r| filter.matches(r.bucket, &r.key.app_name))
                    .cloned(),
            );
            out.transactions.extend(
                snapshot
                    .transactions
                    .iter()
                    .filter(|r| filter.matches(r.bucket, &r.key.app_name))
                    .cloned(),
            );
        }
        Ok(out)
    }

    async fn materialized_buckets(&self, filter: &ActivityFilter) -> Result<BTreeSet<Bucket>> {
        if filter.start > filter.end {
            return Ok(BTreeSet::new());
        }
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        Ok(buckets
            .range(filter.start..=filter.end)
            .map(|(bucket, _)| *bucket)
            .collect())
    }
}
