//! SQLite persistence for raw statement/transaction statistics and the
//! activity tables materialized from them.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, ensure, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use sqlact_core::{
    ActivityFilter, ActivityMetadata, ActivitySnapshot, ActivityStore, Bucket, ClusterTotals,
    ExecStats, FingerprintId, RankedKey, RankingMetric, StatementActivity, StatementKey,
    StatisticsRecord, StatsSource, TransactionActivity, TransactionKey,
    TransactionStatisticsRecord,
};

const STATEMENT_KEY_ORDER: &str =
    "aggregated_ts ASC, fingerprint_id ASC, transaction_fingerprint_id ASC, app_name ASC, db_name ASC";
const TRANSACTION_KEY_ORDER: &str = "aggregated_ts ASC, fingerprint_id ASC, app_name ASC";

const STATEMENT_STATS_COLUMNS: &str = "aggregated_ts,fingerprint_id,transaction_fingerprint_id,app_name,db_name,query,\
     execution_count,service_latency_mean,contention_time_mean,cpu_sql_nanos_mean,service_latency_p99";
const TRANSACTION_STATS_COLUMNS: &str = "aggregated_ts,fingerprint_id,app_name,\
     execution_count,service_latency_mean,contention_time_mean,cpu_sql_nanos_mean,service_latency_p99,\
     statement_fingerprint_ids";
const STATEMENT_ACTIVITY_COLUMNS: &str = "aggregated_ts,fingerprint_id,transaction_fingerprint_id,app_name,db_name,query,\
     execution_count,service_latency_mean,contention_time_mean,cpu_sql_nanos_mean,service_latency_p99,\
     execution_total_seconds,execution_total_cluster_seconds";
const TRANSACTION_ACTIVITY_COLUMNS: &str = "aggregated_ts,fingerprint_id,app_name,\
     execution_count,service_latency_mean,contention_time_mean,cpu_sql_nanos_mean,service_latency_p99,\
     execution_total_seconds,execution_total_cluster_seconds,metadata";

/// Tables owned by the store, for row counting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    StatementStatistics,
    TransactionStatistics,
    StatementActivity,
    TransactionActivity,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::StatementStatistics,
        Table::TransactionStatistics,
        Table::StatementActivity,
        Table::TransactionActivity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::StatementStatistics => "statement_statistics",
            Table::TransactionStatistics => "transaction_statistics",
            Table::StatementActivity => "statement_activity",
            Table::TransactionActivity => "transaction_activity",
        }
    }
}

#[derive(Clone)]
pub struct SqliteStatsStore {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStatsStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("stats.sqlite");
        // Busy timeout (default 5000ms; override with SQLACT_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("SQLACT_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        let store = Self {
            db_path,
            busy_timeout: Duration::from_millis(busy_ms),
        };
        let conn = store.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Cache size: negative = KB units. Default ~= 20MB (20000 KB pages)
        let cache_pages: i64 = std::env::var("SQLACT_SQLITE_CACHE_PAGES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(-20000);
        let _ = conn.pragma_update(None, "cache_size", cache_pages);
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        tracing::debug!(
            target: "sqlact::store",
            path = %store.db_path.display(),
            "statistics store opened"
        );
        Ok(store)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Raw statistics written by the flush pipeline; immutable once a bucket closes.
            CREATE TABLE IF NOT EXISTS statement_statistics (
              aggregated_ts INTEGER NOT NULL,
              fingerprint_id TEXT NOT NULL,             -- 16 hex digits
              transaction_fingerprint_id TEXT NOT NULL,
              app_name TEXT NOT NULL,
              db_name TEXT NOT NULL,
              query TEXT NOT NULL,
              execution_count INTEGER NOT NULL,
              service_latency_mean REAL NOT NULL,       -- seconds
              contention_time_mean REAL NOT NULL,       -- seconds
              cpu_sql_nanos_mean REAL NOT NULL,
              service_latency_p99 REAL NOT NULL,        -- seconds
              PRIMARY KEY (aggregated_ts, fingerprint_id, transaction_fingerprint_id, app_name, db_name)
            );
            CREATE INDEX IF NOT EXISTS idx_stmt_stats_app ON statement_statistics(app_name);

            CREATE TABLE IF NOT EXISTS transaction_statistics (
              aggregated_ts INTEGER NOT NULL,
              fingerprint_id TEXT NOT NULL,
              app_name TEXT NOT NULL,
              execution_count INTEGER NOT NULL,
              service_latency_mean REAL NOT NULL,
              contention_time_mean REAL NOT NULL,
              cpu_sql_nanos_mean REAL NOT NULL,
              service_latency_p99 REAL NOT NULL,
              statement_fingerprint_ids TEXT NOT NULL,  -- JSON array
              PRIMARY KEY (aggregated_ts, fingerprint_id, app_name)
            );
            CREATE INDEX IF NOT EXISTS idx_txn_stats_app ON transaction_statistics(app_name);

            -- Bounded activity tables; each bucket is replaced as a whole.
            CREATE TABLE IF NOT EXISTS statement_activity (
              aggregated_ts INTEGER NOT NULL,
              fingerprint_id TEXT NOT NULL,
              transaction_fingerprint_id TEXT NOT NULL,
              app_name TEXT NOT NULL,
              db_name TEXT NOT NULL,
              query TEXT NOT NULL,
              execution_count INTEGER NOT NULL,
              service_latency_mean REAL NOT NULL,
              contention_time_mean REAL NOT NULL,
              cpu_sql_nanos_mean REAL NOT NULL,
              service_latency_p99 REAL NOT NULL,
              execution_total_seconds REAL NOT NULL,
              execution_total_cluster_seconds REAL NOT NULL,
              PRIMARY KEY (aggregated_ts, fingerprint_id, transaction_fingerprint_id, app_name, db_name)
            );
            CREATE INDEX IF NOT EXISTS idx_stmt_activity_app ON statement_activity(app_name);

            CREATE TABLE IF NOT EXISTS transaction_activity (
              aggregated_ts INTEGER NOT NULL,
              fingerprint_id TEXT NOT NULL,
              app_name TEXT NOT NULL,
              execution_count INTEGER NOT NULL,
              service_latency_mean REAL NOT NULL,
              contention_time_mean REAL NOT NULL,
              cpu_sql_nanos_mean REAL NOT NULL,
              service_latency_p99 REAL NOT NULL,
              execution_total_seconds REAL NOT NULL,
              execution_total_cluster_seconds REAL NOT NULL,
              metadata TEXT NOT NULL,                   -- {"stmtFingerprintIDs": [...]}
              PRIMARY KEY (aggregated_ts, fingerprint_id, app_name)
            );
            CREATE INDEX IF NOT EXISTS idx_txn_activity_app ON transaction_activity(app_name);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------- Ingestion (flush side) ----------------

    /// Writes one flush worth of rows in a single transaction, upserting by key.
    pub fn flush(
        &self,
        statements: &[StatisticsRecord],
        transactions: &[TransactionStatisticsRecord],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO statement_statistics(aggregated_ts,fingerprint_id,transaction_fingerprint_id,app_name,db_name,query,\
                 execution_count,service_latency_mean,contention_time_mean,cpu_sql_nanos_mean,service_latency_p99) \
                 VALUES (?,?,?,?,?,?,?,?,?,?,?) \
                 ON CONFLICT(aggregated_ts,fingerprint_id,transaction_fingerprint_id,app_name,db_name) DO UPDATE SET \
                 query=excluded.query, execution_count=excluded.execution_count, \
                 service_latency_mean=excluded.service_latency_mean, contention_time_mean=excluded.contention_time_mean, \
                 cpu_sql_nanos_mean=excluded.cpu_sql_nanos_mean, service_latency_p99=excluded.service_latency_p99",
            )?;
            for rec in statements {
                stmt.execute(params![
                    rec.bucket.unix(),
                    rec.key.fingerprint_id.encode(),
                    rec.key.transaction_fingerprint_id.encode(),
                    rec.key.app_name,
                    rec.key.db_name,
                    rec.query,
                    rec.stats.execution_count,
                    rec.stats.service_latency_mean,
                    rec.stats.contention_time_mean,
                    rec.stats.cpu_sql_nanos_mean,
                    rec.stats.service_latency_p99,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO transaction_statistics(aggregated_ts,fingerprint_id,app_name,\
                 execution_count,service_latency_mean,contention_time_mean,cpu_sql_nanos_mean,service_latency_p99,\
                 statement_fingerprint_ids) VALUES (?,?,?,?,?,?,?,?,?) \
                 ON CONFLICT(aggregated_ts,fingerprint_id,app_name) DO UPDATE SET \
                 execution_count=excluded.execution_count, service_latency_mean=excluded.service_latency_mean, \
                 contention_time_mean=excluded.contention_time_mean, cpu_sql_nanos_mean=excluded.cpu_sql_nanos_mean, \
                 service_latency_p99=excluded.service_latency_p99, \
                 statement_fingerprint_ids=excluded.statement_fingerprint_ids",
            )?;
            for rec in transactions {
                let ids: Vec<String> = rec
                    .statement_fingerprint_ids
                    .iter()
                    .map(FingerprintId::encode)
                    .collect();
                stmt.execute(params![
                    rec.bucket.unix(),
                    rec.key.fingerprint_id.encode(),
                    rec.key.app_name,
                    rec.stats.execution_count,
                    rec.stats.service_latency_mean,
                    rec.stats.contention_time_mean,
                    rec.stats.cpu_sql_nanos_mean,
                    rec.stats.service_latency_p99,
                    serde_json::to_string(&ids)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn record_statement(&self, rec: &StatisticsRecord) -> Result<()> {
        self.flush(std::slice::from_ref(rec), &[])
    }

    pub fn record_transaction(&self, rec: &TransactionStatisticsRecord) -> Result<()> {
        self.flush(&[], std::slice::from_ref(rec))
    }

    /// Clears raw statistics and activity for every bucket in one transaction.
    pub fn reset_stats(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for table in Table::ALL {
            tx.execute(&format!("DELETE FROM {}", table.name()), [])?;
        }
        tx.commit()?;
        tracing::info!(target: "sqlact::store", "statistics and activity reset");
        Ok(())
    }

    pub fn count_rows(&self, table: Table, app_name: Option<&str>) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE (?1 IS NULL OR app_name = ?1)",
                table.name()
            ),
            params![app_name],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    // ---------------- Statistics reads ----------------

    pub fn top_by_metric(
        &self,
        bucket: Bucket,
        metric: RankingMetric,
        limit: usize,
    ) -> Result<Vec<RankedKey>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT fingerprint_id,transaction_fingerprint_id,app_name,db_name,{} AS rank_value \
             FROM statement_statistics WHERE aggregated_ts = ?1 \
             ORDER BY rank_value DESC, fingerprint_id ASC, transaction_fingerprint_id ASC, app_name ASC, db_name ASC \
             LIMIT ?2",
            metric.sql_rank_expr()
        );
        let mut stmt = conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![bucket.unix(), limit], |row| {
            Ok(RankedKey {
                key: statement_key_at(row, 0)?,
                value: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn count_statement_keys(&self, bucket: Bucket) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM statement_statistics WHERE aggregated_ts = ?1",
            params![bucket.unix()],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    pub fn list_statement_keys(&self, bucket: Bucket) -> Result<Vec<StatementKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT fingerprint_id,transaction_fingerprint_id,app_name,db_name \
             FROM statement_statistics WHERE aggregated_ts = ?1 ORDER BY {STATEMENT_KEY_ORDER}"
        ))?;
        let rows = stmt.query_map(params![bucket.unix()], |row| statement_key_at(row, 0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn fetch_statement_stats(
        &self,
        bucket: Bucket,
        keys: &[StatementKey],
    ) -> Result<Vec<StatisticsRecord>> {
        let mut conn = self.conn()?;
        // One read transaction so every key sees the same snapshot.
        let tx = conn.transaction()?;
        let mut out = Vec::with_capacity(keys.len());
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {STATEMENT_STATS_COLUMNS} FROM statement_statistics \
                 WHERE aggregated_ts = ?1 AND fingerprint_id = ?2 AND transaction_fingerprint_id = ?3 \
                 AND app_name = ?4 AND db_name = ?5"
            ))?;
            for key in keys {
                let rec = stmt
                    .query_row(
                        params![
                            bucket.unix(),
                            key.fingerprint_id.encode(),
                            key.transaction_fingerprint_id.encode(),
                            key.app_name,
                            key.db_name,
                        ],
                        statement_record_from_row,
                    )
                    .optional()?;
                if let Some(rec) = rec {
                    out.push(rec);
                }
            }
        }
        tx.finish()?;
        Ok(out)
    }

    pub fn fetch_transaction_stats(
        &self,
        bucket: Bucket,
        keys: &[TransactionKey],
    ) -> Result<Vec<TransactionStatisticsRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut out = Vec::with_capacity(keys.len());
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {TRANSACTION_STATS_COLUMNS} FROM transaction_statistics \
                 WHERE aggregated_ts = ?1 AND fingerprint_id = ?2 AND app_name = ?3"
            ))?;
            for key in keys {
                let rec = stmt
                    .query_row(
                        params![bucket.unix(), key.fingerprint_id.encode(), key.app_name],
                        transaction_record_from_row,
                    )
                    .optional()?;
                if let Some(rec) = rec {
                    out.push(rec);
                }
            }
        }
        tx.finish()?;
        Ok(out)
    }

    pub fn bucket_totals(&self, bucket: Bucket) -> Result<ClusterTotals> {
        let conn = self.conn()?;
        let sum = |table: &str| -> Result<f64> {
            Ok(conn.query_row(
                &format!(
                    "SELECT COALESCE(SUM(CAST(execution_count AS REAL) * service_latency_mean), 0.0) \
                     FROM {table} WHERE aggregated_ts = ?1"
                ),
                params![bucket.unix()],
                |r| r.get(0),
            )?)
        };
        Ok(ClusterTotals {
            statement_seconds: sum("statement_statistics")?,
            transaction_seconds: sum("transaction_statistics")?,
        })
    }

    pub fn scan_statement_stats(&self, filter: &ActivityFilter) -> Result<Vec<StatisticsRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATEMENT_STATS_COLUMNS} FROM statement_statistics \
             WHERE aggregated_ts >= ?1 AND aggregated_ts <= ?2 AND (?3 IS NULL OR app_name = ?3) \
             ORDER BY {STATEMENT_KEY_ORDER}"
        ))?;
        let rows = stmt.query_map(
            params![filter.start.unix(), filter.end.unix(), filter.app_name],
            statement_record_from_row,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn scan_transaction_stats(
        &self,
        filter: &ActivityFilter,
    ) -> Result<Vec<TransactionStatisticsRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRANSACTION_STATS_COLUMNS} FROM transaction_statistics \
             WHERE aggregated_ts >= ?1 AND aggregated_ts <= ?2 AND (?3 IS NULL OR app_name = ?3) \
             ORDER BY {TRANSACTION_KEY_ORDER}"
        ))?;
        let rows = stmt.query_map(
            params![filter.start.unix(), filter.end.unix(), filter.app_name],
            transaction_record_from_row,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---------------- Activity tables ----------------

    /// Delete-then-insert inside one IMMEDIATE transaction; readers see either
    /// the old bucket or the new one.
    pub fn replace_activity_bucket(&self, bucket: Bucket, snapshot: &ActivitySnapshot) -> Result<()> {
        let ts = bucket.unix();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM statement_activity WHERE aggregated_ts = ?1",
            params![ts],
        )?;
        tx.execute(
            "DELETE FROM transaction_activity WHERE aggregated_ts = ?1",
            params![ts],
        )?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO statement_activity({STATEMENT_ACTIVITY_COLUMNS}) \
                 VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)"
            ))?;
            for row in &snapshot.statements {
                ensure!(
                    row.bucket == bucket,
                    "statement row for bucket {} in snapshot of {}",
                    row.bucket,
                    bucket
                );
                stmt.execute(params![
                    ts,
                    row.key.fingerprint_id.encode(),
                    row.key.transaction_fingerprint_id.encode(),
                    row.key.app_name,
                    row.key.db_name,
                    row.query,
                    row.stats.execution_count,
                    row.stats.service_latency_mean,
                    row.stats.contention_time_mean,
                    row.stats.cpu_sql_nanos_mean,
                    row.stats.service_latency_p99,
                    row.execution_total_seconds,
                    row.execution_total_cluster_seconds,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO transaction_activity({TRANSACTION_ACTIVITY_COLUMNS}) \
                 VALUES (?,?,?,?,?,?,?,?,?,?,?)"
            ))?;
            for row in &snapshot.transactions {
                ensure!(
                    row.bucket == bucket,
                    "transaction row for bucket {} in snapshot of {}",
                    row.bucket,
                    bucket
                );
                stmt.execute(params![
                    ts,
                    row.key.fingerprint_id.encode(),
                    row.key.app_name,
                    row.stats.execution_count,
                    row.stats.service_latency_mean,
                    row.stats.contention_time_mean,
                    row.stats.cpu_sql_nanos_mean,
                    row.stats.service_latency_p99,
                    row.execution_total_seconds,
                    row.execution_total_cluster_seconds,
                    serde_json::to_string(&row.metadata)?,
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(
            target: "sqlact::store",
            %bucket,
            statements = snapshot.statements.len(),
            transactions = snapshot.transactions.len(),
            "activity bucket committed"
        );
        Ok(())
    }

    pub fn query_activity(&self, filter: &ActivityFilter) -> Result<ActivitySnapshot> {
        self.load_activity(
            Some(filter.start.unix()),
            Some(filter.end.unix()),
            filter.app_name.as_deref(),
        )
    }

    pub fn activity_buckets(&self, filter: &ActivityFilter) -> Result<BTreeSet<Bucket>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT aggregated_ts FROM statement_activity WHERE aggregated_ts >= ?1 AND aggregated_ts <= ?2 \
             UNION SELECT aggregated_ts FROM transaction_activity WHERE aggregated_ts >= ?1 AND aggregated_ts <= ?2",
        )?;
        let rows = stmt.query_map(params![filter.start.unix(), filter.end.unix()], |row| {
            bucket_at(row, 0)
        })?;
        let mut out = BTreeSet::new();
        for r in rows {
            out.insert(r?);
        }
        Ok(out)
    }

    /// Canonical JSON of both activity tables, ordered by primary key.
    pub fn dump_activity(&self) -> Result<String> {
        let all = self.load_activity(None, None, None)?;
        Ok(serde_json::to_string(&all)?)
    }

    fn load_activity(
        &self,
        start: Option<i64>,
        end: Option<i64>,
        app_name: Option<&str>,
    ) -> Result<ActivitySnapshot> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut snapshot = ActivitySnapshot::default();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {STATEMENT_ACTIVITY_COLUMNS} FROM statement_activity \
                 WHERE (?1 IS NULL OR aggregated_ts >= ?1) AND (?2 IS NULL OR aggregated_ts <= ?2) \
                 AND (?3 IS NULL OR app_name = ?3) ORDER BY {STATEMENT_KEY_ORDER}"
            ))?;
            let rows = stmt.query_map(params![start, end, app_name], statement_activity_from_row)?;
            for r in rows {
                snapshot.statements.push(r?);
            }
        }
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {TRANSACTION_ACTIVITY_COLUMNS} FROM transaction_activity \
                 WHERE (?1 IS NULL OR aggregated_ts >= ?1) AND (?2 IS NULL OR aggregated_ts <= ?2) \
                 AND (?3 IS NULL OR app_name = ?3) ORDER BY {TRANSACTION_KEY_ORDER}"
            ))?;
            let rows = stmt.query_map(params![start, end, app_name], transaction_activity_from_row)?;
            for r in rows {
                snapshot.transactions.push(r?);
            }
        }
        tx.finish()?;
        Ok(snapshot)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------
    // These helpers offload rusqlite work from async executors.

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(SqliteStatsStore) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn reset_stats_async(&self) -> Result<()> {
        self.blocking(|s| s.reset_stats()).await
    }
}

fn conversion_error(col: usize, ty: Type, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, ty, msg.into())
}

fn fingerprint_at(row: &Row<'_>, col: usize) -> rusqlite::Result<FingerprintId> {
    let raw: String = row.get(col)?;
    FingerprintId::decode(&raw)
        .ok_or_else(|| conversion_error(col, Type::Text, format!("bad fingerprint `{raw}`")))
}

fn bucket_at(row: &Row<'_>, col: usize) -> rusqlite::Result<Bucket> {
    let ts: i64 = row.get(col)?;
    Bucket::from_unix(ts)
        .ok_or_else(|| conversion_error(col, Type::Integer, format!("unaligned bucket {ts}")))
}

fn statement_key_at(row: &Row<'_>, col: usize) -> rusqlite::Result<StatementKey> {
    Ok(StatementKey {
        fingerprint_id: fingerprint_at(row, col)?,
        transaction_fingerprint_id: fingerprint_at(row, col + 1)?,
        app_name: row.get(col + 2)?,
        db_name: row.get(col + 3)?,
    })
}

fn stats_at(row: &Row<'_>, col: usize) -> rusqlite::Result<ExecStats> {
    Ok(ExecStats {
        execution_count: row.get(col)?,
        service_latency_mean: row.get(col + 1)?,
        contention_time_mean: row.get(col + 2)?,
        cpu_sql_nanos_mean: row.get(col + 3)?,
        service_latency_p99: row.get(col + 4)?,
    })
}

fn statement_record_from_row(row: &Row<'_>) -> rusqlite::Result<StatisticsRecord> {
    Ok(StatisticsRecord {
        bucket: bucket_at(row, 0)?,
        key: statement_key_at(row, 1)?,
        query: row.get(5)?,
        stats: stats_at(row, 6)?,
    })
}

fn transaction_record_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionStatisticsRecord> {
    let raw_ids: String = row.get(8)?;
    let ids: Vec<String> = serde_json::from_str(&raw_ids)
        .map_err(|e| conversion_error(8, Type::Text, e.to_string()))?;
    let statement_fingerprint_ids = ids
        .iter()
        .map(|raw| {
            FingerprintId::decode(raw)
                .ok_or_else(|| conversion_error(8, Type::Text, format!("bad fingerprint `{raw}`")))
        })
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(TransactionStatisticsRecord {
        bucket: bucket_at(row, 0)?,
        key: TransactionKey {
            fingerprint_id: fingerprint_at(row, 1)?,
            app_name: row.get(2)?,
        },
        stats: stats_at(row, 3)?,
        statement_fingerprint_ids,
    })
}

fn statement_activity_from_row(row: &Row<'_>) -> rusqlite::Result<StatementActivity> {
    Ok(StatementActivity {
        bucket: bucket_at(row, 0)?,
        key: statement_key_at(row, 1)?,
        query: row.get(5)?,
        stats: stats_at(row, 6)?,
        execution_total_seconds: row.get(11)?,
        execution_total_cluster_seconds: row.get(12)?,
    })
}

fn transaction_activity_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionActivity> {
    let raw_meta: String = row.get(10)?;
    let metadata: ActivityMetadata = serde_json::from_str(&raw_meta)
        .map_err(|e| conversion_error(10, Type::Text, e.to_string()))?;
    Ok(TransactionActivity {
        bucket: bucket_at(row, 0)?,
        key: TransactionKey {
            fingerprint_id: fingerprint_at(row, 1)?,
            app_name: row.get(2)?,
        },
        stats: stats_at(row, 3)?,
        execution_total_seconds: row.get(8)?,
        execution_total_cluster_seconds: row.get(9)?,
        metadata,
    })
}

#[async_trait::async_trait]
impl StatsSource for SqliteStatsStore {
    async fn top_statements_by_metric(
        &self,
        bucket: Bucket,
        metric: RankingMetric,
        limit: usize,
    ) -> Result<Vec<RankedKey>> {
        self.blocking(move |s| s.top_by_metric(bucket, metric, limit))
            .await
    }

    async fn statement_key_count(&self, bucket: Bucket) -> Result<usize> {
        self.blocking(move |s| s.count_statement_keys(bucket)).await
    }

    async fn statement_keys(&self, bucket: Bucket) -> Result<Vec<StatementKey>> {
        self.blocking(move |s| s.list_statement_keys(bucket)).await
    }

    async fn statement_stats(
        &self,
        bucket: Bucket,
        keys: &[StatementKey],
    ) -> Result<Vec<StatisticsRecord>> {
        let keys = keys.to_vec();
        self.blocking(move |s| s.fetch_statement_stats(bucket, &keys))
            .await
    }

    async fn transaction_stats(
        &self,
        bucket: Bucket,
        keys: &[TransactionKey],
    ) -> Result<Vec<TransactionStatisticsRecord>> {
        let keys = keys.to_vec();
        self.blocking(move |s| s.fetch_transaction_stats(bucket, &keys))
            .await
    }

    async fn cluster_totals(&self, bucket: Bucket) -> Result<ClusterTotals> {
        self.blocking(move |s| s.bucket_totals(bucket)).await
    }

    async fn scan_statements(&self, filter: &ActivityFilter) -> Result<Vec<StatisticsRecord>> {
        let filter = filter.clone();
        self.blocking(move |s| s.scan_statement_stats(&filter)).await
    }

    async fn scan_transactions(
        &self,
        filter: &ActivityFilter,
    ) -> Result<Vec<TransactionStatisticsRecord>> {
        let filter = filter.clone();
        self.blocking(move |s| s.scan_transaction_stats(&filter))
            .await
    }
}

#[async_trait::async_trait]
impl ActivityStore for SqliteStatsStore {
    async fn replace_bucket(&self, bucket: Bucket, snapshot: ActivitySnapshot) -> Result<()> {
        self.blocking(move |s| s.replace_activity_bucket(bucket, &snapshot))
            .await
    }

    async fn query(&self, filter: &ActivityFilter) -> Result<ActivitySnapshot> {
        let filter = filter.clone();
        self.blocking(move |s| s.query_activity(&filter)).await
    }

    async fn materialized_buckets(&self, filter: &ActivityFilter) -> Result<BTreeSet<Bucket>> {
        let filter = filter.clone();
        self.blocking(move |s| s.activity_buckets(&filter)).await
    }
}
