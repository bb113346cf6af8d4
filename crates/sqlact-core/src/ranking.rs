use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ExecStats;

/// One of the fixed columns a bucket is top-K'd by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingMetric {
    ExecutionCount,
    ServiceLatency,
    TotalExecutionTime,
    ContentionTime,
    CpuTime,
    P99Latency,
}

struct MetricSpec {
    name: &'static str,
    sql_rank_expr: &'static str,
    value: fn(&ExecStats) -> f64,
}

// Indexed by discriminant; keep in declaration order.
const SPECS: [MetricSpec; 6] = [
    MetricSpec {
        name: "execution_count",
        sql_rank_expr: "CAST(execution_count AS REAL)",
        value: |s| s.execution_count as f64,
    },
    MetricSpec {
        name: "service_latency",
        sql_rank_expr: "service_latency_mean",
        value: |s| s.service_latency_mean,
    },
    MetricSpec {
        name: "total_execution_time",
        sql_rank_expr: "(CAST(execution_count AS REAL) * service_latency_mean)",
        value: ExecStats::total_execution_seconds,
    },
    MetricSpec {
        name: "contention_time",
        sql_rank_expr: "contention_time_mean",
        value: |s| s.contention_time_mean,
    },
    MetricSpec {
        name: "cpu_time",
        sql_rank_expr: "cpu_sql_nanos_mean",
        value: |s| s.cpu_sql_nanos_mean,
    },
    MetricSpec {
        name: "p99_latency",
        sql_rank_expr: "service_latency_p99",
        value: |s| s.service_latency_p99,
    },
];

impl RankingMetric {
    pub const ALL: [RankingMetric; 6] = [
        RankingMetric::ExecutionCount,
        RankingMetric::ServiceLatency,
        RankingMetric::TotalExecutionTime,
        RankingMetric::ContentionTime,
        RankingMetric::CpuTime,
        RankingMetric::P99Latency,
    ];

    fn spec(&self) -> &'static MetricSpec {
        &SPECS[*self as usize]
    }

    pub fn as_str(&self) -> &'static str {
        self.spec().name
    }

    /// Ranking value for one row; higher ranks first.
    pub fn value(&self, stats: &ExecStats) -> f64 {
        (self.spec().value)(stats)
    }

    /// SQL expression over `statement_statistics` columns that yields the same
    /// value as [`RankingMetric::value`].
    pub fn sql_rank_expr(&self) -> &'static str {
        self.spec().sql_rank_expr
    }
}

impl fmt::Display for RankingMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lines_up_with_variants() {
        let names: std::collections::BTreeSet<_> =
            RankingMetric::ALL.iter().map(RankingMetric::as_str).collect();
        assert_eq!(names.len(), RankingMetric::ALL.len());
        for metric in RankingMetric::ALL {
            assert_eq!(metric.to_string(), metric.as_str());
        }
    }

    #[test]
    fn total_time_is_its_own_ranking() {
        let stats = ExecStats {
            execution_count: 40,
            service_latency_mean: 0.5,
            contention_time_mean: 0.1,
            cpu_sql_nanos_mean: 900.0,
            service_latency_p99: 2.0,
        };
        assert_eq!(RankingMetric::ExecutionCount.value(&stats), 40.0);
        assert_eq!(RankingMetric::ServiceLatency.value(&stats), 0.5);
        assert_eq!(RankingMetric::TotalExecutionTime.value(&stats), 20.0);
        assert_eq!(RankingMetric::ContentionTime.value(&stats), 0.1);
        assert_eq!(RankingMetric::CpuTime.value(&stats), 900.0);
        assert_eq!(RankingMetric::P99Latency.value(&stats), 2.0);
    }
}
