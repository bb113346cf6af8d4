use crate::types::Bucket;

#[derive(thiserror::Error, Debug)]
pub enum ActivityError {
    /// A statistics read failed or ran past its deadline. Retried on the next run.
    #[error("statistics read `{op}` failed: {source}")]
    TransientData {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// The atomic bucket replace did not commit; the previous snapshot is intact.
    #[error("activity commit for bucket {bucket} failed: {source}")]
    Commit {
        bucket: Bucket,
        #[source]
        source: anyhow::Error,
    },
    #[error("run cancelled before commit")]
    Cancelled,
    #[error("activity read failed: {source}")]
    ReadPath {
        #[source]
        source: anyhow::Error,
    },
}

impl ActivityError {
    /// Whether the scheduler should simply try again on its next wake.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ActivityError::TransientData { .. } | ActivityError::Commit { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ActivityError::TransientData { .. } => "transient_data",
            ActivityError::Configuration(_) => "configuration",
            ActivityError::Commit { .. } => "commit",
            ActivityError::Cancelled => "cancelled",
            ActivityError::ReadPath { .. } => "read_path",
        }
    }
}
