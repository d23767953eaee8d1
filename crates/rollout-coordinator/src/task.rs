//! Task executor contract: the opaque work run on each target node.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rollout_kernel::{NodeId, TaskSpec};

/// Result of one task invocation. Anything but `Success` counts as one failed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskResult {
    Success,
    Failure(String),
    Timeout,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success)
    }

    /// Error text recorded on the node for a failed attempt.
    pub fn error_message(&self) -> Option<String> {
        match self {
            TaskResult::Success => None,
            TaskResult::Failure(reason) => Some(reason.clone()),
            TaskResult::Timeout => Some("task timed out".to_string()),
        }
    }
}

/// Runs a task against one node.
///
/// `timeout` is advisory: the coordinator enforces it as well and drops the future when it
/// elapses. `cancel` fires when the phase or run is aborted; implementations should stop
/// promptly and may return any result.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &NodeId,
        task: &TaskSpec,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> TaskResult;
}
