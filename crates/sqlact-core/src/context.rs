use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

use crate::error::ActivityError;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Cancellation and per-call deadline shared by every read of one run.
#[derive(Clone, Debug)]
pub struct RunContext {
    cancel: CancellationToken,
    query_timeout: Duration,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, query_timeout: Duration) -> Self {
        Self {
            cancel,
            query_timeout,
        }
    }

    pub fn check(&self) -> Result<(), ActivityError> {
        if self.cancel.is_cancelled() {
            return Err(ActivityError::Cancelled);
        }
        Ok(())
    }

    /// Runs one data-layer read under the run's token and deadline.
    pub async fn read<T, F>(&self, op: &'static str, fut: F) -> Result<T, ActivityError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ActivityError::Cancelled),
            res = tokio::time::timeout(self.query_timeout, fut) => match res {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(source)) => Err(ActivityError::TransientData { op, source }),
                Err(_) => Err(ActivityError::TransientData {
                    op,
                    source: anyhow!("deadline of {:?} exceeded", self.query_timeout),
                }),
            },
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(CancellationToken::new(), DEFAULT_QUERY_TIMEOUT)
    }
}
