//! Statistics activity materialization: compacts raw per-fingerprint
//! statement and transaction statistics into small, bounded activity tables
//! holding only the rows that rank in the top K by one of a fixed set of
//! metrics, replacing each hourly bucket atomically.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod materializer;
pub mod memory;
pub mod merger;
pub mod ranking;
pub mod read_path;
pub mod scheduler;
pub mod selector;
pub mod source;
pub mod types;

pub use clock::{FixedClock, SystemClock, TimeSource};
pub use config::{load_settings, ActivitySettings, ConfigProvider, RunConfig, SettingsHandle};
pub use context::RunContext;
pub use error::ActivityError;
pub use job::{ActivityJob, JobState, RunOutcome, RunReport};
pub use materializer::{Materializer, RowCaps};
pub use merger::{SelectionMode, TopKUnionMerger, WorkingSet};
pub use ranking::RankingMetric;
pub use read_path::{ActivityReadPath, CombinedStatsResponse, ResponseSource};
pub use scheduler::ActivityScheduler;
pub use selector::MetricSelector;
pub use source::{ActivityStore, ClusterTotals, RankedKey, StatsSource};
pub use types::*;
