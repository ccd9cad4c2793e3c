use tokio_util::sync::CancellationToken;

use cafetal_core::WorkItemId;

/// Per-attempt context handed to a work function.
///
/// Cancellation is cooperative: the token fires when a caller cancels a
/// running job or the executor's timeout elapses. Work functions that never
/// look at it still get their slot reclaimed, but keep running in the
/// background until they return.
#[derive(Debug, Clone)]
pub struct WorkContext {
    job_id: WorkItemId,
    attempt: u32,
    cancellation: CancellationToken,
}

impl WorkContext {
    pub fn new(job_id: WorkItemId, attempt: u32, cancellation: CancellationToken) -> Self {
        Self {
            job_id,
            attempt,
            cancellation,
        }
    }

    pub fn job_id(&self) -> WorkItemId {
        self.job_id
    }

    /// 1-based attempt number of this execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the attempt has been cancelled or timed out.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}
