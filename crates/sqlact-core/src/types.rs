use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const BUCKET_SECS: i64 = 3600;

/// Hour-aligned aggregation window shared by raw statistics and activity rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bucket(DateTime<Utc>);

impl Bucket {
    /// Truncates `ts` to the start of its hour.
    pub fn containing(ts: DateTime<Utc>) -> Self {
        let secs = ts.timestamp().div_euclid(BUCKET_SECS) * BUCKET_SECS;
        Self(DateTime::from_timestamp(secs, 0).unwrap_or(ts))
    }

    /// Accepts only instants that already sit on an hour boundary.
    pub fn at(ts: DateTime<Utc>) -> Option<Self> {
        let bucket = Self::containing(ts);
        (bucket.0 == ts).then_some(bucket)
    }

    pub fn from_unix(secs: i64) -> Option<Self> {
        DateTime::from_timestamp(secs, 0).and_then(Self::at)
    }

    pub fn unix(&self) -> i64 {
        self.0.timestamp()
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn next(&self) -> Self {
        Self::containing(self.0 + chrono::Duration::seconds(BUCKET_SECS))
    }

    pub fn prev(&self) -> Self {
        Self::containing(self.0 - chrono::Duration::seconds(BUCKET_SECS))
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Identifier of a normalized statement or transaction shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FingerprintId(pub u64);

impl FingerprintId {
    /// Fixed-width lowercase hex; lexical order matches numeric order.
    pub fn encode(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        if raw.len() != 16 {
            return None;
        }
        u64::from_str_radix(raw, 16).ok().map(Self)
    }
}

impl fmt::Display for FingerprintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Identity of one raw statement statistics row within a bucket.
///
/// Field order is the tie-break order used by ranking: fingerprint first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatementKey {
    pub fingerprint_id: FingerprintId,
    pub transaction_fingerprint_id: FingerprintId,
    pub app_name: String,
    pub db_name: String,
}

impl StatementKey {
    pub fn new(
        fingerprint_id: u64,
        transaction_fingerprint_id: u64,
        app_name: impl Into<String>,
        db_name: impl Into<String>,
    ) -> Self {
        Self {
            fingerprint_id: FingerprintId(fingerprint_id),
            transaction_fingerprint_id: FingerprintId(transaction_fingerprint_id),
            app_name: app_name.into(),
            db_name: db_name.into(),
        }
    }

    pub fn transaction_key(&self) -> TransactionKey {
        TransactionKey {
            fingerprint_id: self.transaction_fingerprint_id,
            app_name: self.app_name.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionKey {
    pub fingerprint_id: FingerprintId,
    pub app_name: String,
}

impl TransactionKey {
    pub fn new(fingerprint_id: u64, app_name: impl Into<String>) -> Self {
        Self {
            fingerprint_id: FingerprintId(fingerprint_id),
            app_name: app_name.into(),
        }
    }
}

/// Aggregated execution counters. Latencies are seconds, CPU is nanoseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecStats {
    pub execution_count: i64,
    pub service_latency_mean: f64,
    pub contention_time_mean: f64,
    pub cpu_sql_nanos_mean: f64,
    pub service_latency_p99: f64,
}

impl ExecStats {
    pub fn total_execution_seconds(&self) -> f64 {
        self.execution_count as f64 * self.service_latency_mean
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRecord {
    pub bucket: Bucket,
    pub key: StatementKey,
    pub query: String,
    pub stats: ExecStats,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionStatisticsRecord {
    pub bucket: Bucket,
    pub key: TransactionKey,
    pub stats: ExecStats,
    pub statement_fingerprint_ids: Vec<FingerprintId>,
}

/// Auxiliary document stored with each transaction activity row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityMetadata {
    #[serde(rename = "stmtFingerprintIDs", default)]
    pub stmt_fingerprint_ids: Vec<String>,
}

impl ActivityMetadata {
    pub fn from_ids(ids: &BTreeSet<FingerprintId>) -> Self {
        Self {
            stmt_fingerprint_ids: ids.iter().map(FingerprintId::encode).collect(),
        }
    }

    pub fn fingerprint_ids(&self) -> Vec<FingerprintId> {
        self.stmt_fingerprint_ids
            .iter()
            .filter_map(|raw| FingerprintId::decode(raw))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatementActivity {
    pub bucket: Bucket,
    pub key: StatementKey,
    pub query: String,
    pub stats: ExecStats,
    pub execution_total_seconds: f64,
    pub execution_total_cluster_seconds: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionActivity {
    pub bucket: Bucket,
    pub key: TransactionKey,
    pub stats: ExecStats,
    pub execution_total_seconds: f64,
    pub execution_total_cluster_seconds: f64,
    pub metadata: ActivityMetadata,
}

/// Complete contents of the activity tables for some set of buckets.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub statements: Vec<StatementActivity>,
    pub transactions: Vec<TransactionActivity>,
}

impl ActivitySnapshot {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty() && self.transactions.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.statements.len() + self.transactions.len()
    }
}

/// Bucket-inclusive time range plus an optional application filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityFilter {
    pub start: Bucket,
    pub end: Bucket,
    pub app_name: Option<String>,
}

impl ActivityFilter {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Bucket::containing(start),
            end: Bucket::containing(end),
            app_name: None,
        }
    }

    pub fn bucket(bucket: Bucket) -> Self {
        Self {
            start: bucket,
            end: bucket,
            app_name: None,
        }
    }

    pub fn with_app(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn matches(&self, bucket: Bucket, app_name: &str) -> bool {
        bucket >= self.start
            && bucket <= self.end
            && self.app_name.as_deref().is_none_or(|app| app == app_name)
    }
}
