use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::future::try_join_all;
use serde::Serialize;

use crate::context::RunContext;
use crate::error::ActivityError;
use crate::ranking::RankingMetric;
use crate::selector::MetricSelector;
use crate::source::StatsSource;
use crate::types::{Bucket, StatementKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// The bucket was small enough to keep every row.
    TransferAll,
    TopK,
}

/// Deduplicated statement keys to materialize for one bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkingSet {
    pub bucket: Bucket,
    pub mode: SelectionMode,
    pub keys: BTreeSet<StatementKey>,
}

impl WorkingSet {
    pub fn empty(bucket: Bucket) -> Self {
        Self {
            bucket,
            mode: SelectionMode::TopK,
            keys: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Union of the per-metric top-K selections.
#[derive(Clone)]
pub struct TopKUnionMerger {
    source: Arc<dyn StatsSource>,
    selector: MetricSelector,
}

impl TopKUnionMerger {
    pub fn new(source: Arc<dyn StatsSource>) -> Self {
        Self {
            selector: MetricSelector::new(source.clone()),
            source,
        }
    }

    /// Upper bound on the working set for limit `k`.
    pub fn max_rows(k: i64) -> usize {
        usize::try_from(k.max(0))
            .unwrap_or(usize::MAX)
            .saturating_mul(RankingMetric::ALL.len())
    }

    pub async fn merge(
        &self,
        ctx: &RunContext,
        bucket: Bucket,
        k: i64,
    ) -> Result<WorkingSet, ActivityError> {
        if k <= 0 {
            return Ok(WorkingSet::empty(bucket));
        }
        let bound = Self::max_rows(k);

        let count = ctx
            .read(
                "statement_key_count",
                self.source.statement_key_count(bucket),
            )
            .await?;
        if count <= bound {
            let keys = ctx
                .read("statement_keys", self.source.statement_keys(bucket))
                .await?;
            // A late flush into the live bucket can grow it past the bound.
            if keys.len() <= bound {
                return Ok(WorkingSet {
                    bucket,
                    mode: SelectionMode::TransferAll,
                    keys: keys.into_iter().collect(),
                });
            }
        }

        // Any failed selection drops the whole union.
        let selections = try_join_all(
            RankingMetric::ALL
                .iter()
                .map(|metric| self.selector.select(ctx, bucket, *metric, k)),
        )
        .await?;

        let keys: BTreeSet<StatementKey> = selections.into_iter().flatten().collect();
        Ok(WorkingSet {
            bucket,
            mode: SelectionMode::TopK,
            keys,
        })
    }
}
