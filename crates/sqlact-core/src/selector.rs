use std::sync::Arc;

use crate::context::RunContext;
use crate::error::ActivityError;
use crate::ranking::RankingMetric;
use crate::source::{RankedKey, StatsSource};
use crate::types::{Bucket, StatementKey};

/// Top-K selection over a single ranking metric.
#[derive(Clone)]
pub struct MetricSelector {
    source: Arc<dyn StatsSource>,
}

impl MetricSelector {
    pub fn new(source: Arc<dyn StatsSource>) -> Self {
        Self { source }
    }

    /// Keys of the `k` highest-ranked rows of `bucket`, best first.
    pub async fn select(
        &self,
        ctx: &RunContext,
        bucket: Bucket,
        metric: RankingMetric,
        k: i64,
    ) -> Result<Vec<StatementKey>, ActivityError> {
        if k <= 0 {
            return Ok(Vec::new());
        }
        let limit = usize::try_from(k).unwrap_or(usize::MAX);
        let mut ranked = ctx
            .read(
                "top_statements_by_metric",
                self.source.top_statements_by_metric(bucket, metric, limit),
            )
            .await?;
        rank_order(&mut ranked);
        ranked.truncate(limit);
        tracing::trace!(
            target: "sqlact::job",
            %bucket,
            metric = metric.as_str(),
            selected = ranked.len(),
            "metric selection complete"
        );
        Ok(ranked.into_iter().map(|r| r.key).collect())
    }
}

/// Value descending, then key ascending.
pub fn rank_order(rows: &mut [RankedKey]) {
    rows.sort_by(|a, b| b.value.total_cmp(&a.value).then_with(|| a.key.cmp(&b.key)));
}
