//! Storage seams: where raw statistics come from and where activity rows go.

use std::collections::BTreeSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ranking::RankingMetric;
use crate::types::{
    ActivityFilter, ActivitySnapshot, Bucket, StatementKey, StatisticsRecord, TransactionKey,
    TransactionStatisticsRecord,
};

/// A statement key with the value it was ranked by.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankedKey {
    pub key: StatementKey,
    pub value: f64,
}

/// Sum of total execution time over every row of a bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTotals {
    pub statement_seconds: f64,
    pub transaction_seconds: f64,
}

/// Read-only access to flushed per-fingerprint statistics.
#[async_trait::async_trait]
pub trait StatsSource: Send + Sync {
    /// Up to `limit` keys of `bucket` ranked by `metric` descending, ties by
    /// key ascending.
    async fn top_statements_by_metric(
        &self,
        bucket: Bucket,
        metric: RankingMetric,
        limit: usize,
    ) -> Result<Vec<RankedKey>>;

    async fn statement_key_count(&self, bucket: Bucket) -> Result<usize>;

    async fn statement_keys(&self, bucket: Bucket) -> Result<Vec<StatementKey>>;

    /// Full rows for `keys`; keys without a row are omitted.
    async fn statement_stats(
        &self,
        bucket: Bucket,
        keys: &[StatementKey],
    ) -> Result<Vec<StatisticsRecord>>;

    async fn transaction_stats(
        &self,
        bucket: Bucket,
        keys: &[TransactionKey],
    ) -> Result<Vec<TransactionStatisticsRecord>>;

    async fn cluster_totals(&self, bucket: Bucket) -> Result<ClusterTotals>;

    /// Unbounded scan used when activity tables are not consulted.
    async fn scan_statements(&self, filter: &ActivityFilter) -> Result<Vec<StatisticsRecord>>;

    async fn scan_transactions(
        &self,
        filter: &ActivityFilter,
    ) -> Result<Vec<TransactionStatisticsRecord>>;
}

/// Bounded, denormalized tables read by the UI path.
#[async_trait::async_trait]
pub trait ActivityStore: Send + Sync {
    /// Replaces every activity row of `bucket` with `snapshot` in one
    /// all-or-nothing step.
    async fn replace_bucket(&self, bucket: Bucket, snapshot: ActivitySnapshot) -> Result<()>;

    async fn query(&self, filter: &ActivityFilter) -> Result<ActivitySnapshot>;

    /// Buckets in the filter's time range that hold activity rows for any
    /// application. Buckets outside this set were never materialized.
    async fn materialized_buckets(&self, filter: &ActivityFilter) -> Result<BTreeSet<Bucket>> {
        let range = ActivityFilter {
            app_name: None,
            ..filter.clone()
        };
        let snapshot = self.query(&range).await?;
        Ok(snapshot
            .statements
            .iter()
            .map(|row| row.bucket)
            .chain(snapshot.transactions.iter().map(|row| row.bucket))
            .collect())
    }
}
