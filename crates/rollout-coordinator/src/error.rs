//! Coordinator error type.

use rollout_kernel::{KernelError, PlanError};

use crate::registry::RegistryError;
use crate::slot::SlotError;

/// Errors that stop a run. Node-level failures never surface here; they are retried,
/// checkpointed, and reported through the run report instead.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid deployment plan: {0}")]
    Plan(#[from] PlanError),
    /// Checkpoint write or replay failed; progress can no longer be recorded.
    #[error("checkpoint log failure: {0}")]
    Checkpoint(#[from] KernelError),
    #[error("node registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("slot manager: {0}")]
    Slot(#[from] SlotError),
    #[error("configuration: {0}")]
    Config(String),
    #[error("worker task failed: {0}")]
    Join(String),
}

impl CoordinatorError {
    /// Fatal errors leave the run without a terminal checkpoint; a restart resumes it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Plan(_) | CoordinatorError::Checkpoint(_) | CoordinatorError::Config(_)
        )
    }
}

impl From<tokio::task::JoinError> for CoordinatorError {
    fn from(err: tokio::task::JoinError) -> Self {
        CoordinatorError::Join(err.to_string())
    }
}
