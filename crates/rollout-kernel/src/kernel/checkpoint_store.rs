//! In-memory CheckpointLog implementation.
//!
//! Append is serialized through one write lock; scan returns checkpoints in ascending seq order.
//! Nothing survives the process, so this store is for tests and dry runs.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::kernel::checkpoint::{Checkpoint, CheckpointLog, KernelError, NewCheckpoint};
use crate::kernel::identity::{DeploymentId, Seq};

/// In-memory checkpoint log: one ledger per deployment, seq assigned on append.
pub struct InMemoryCheckpointLog {
    /// deployment_id -> ordered checkpoints (seq 1, 2, 3, ...)
    logs: RwLock<HashMap<DeploymentId, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointLog {
    pub fn new() -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
        }
    }

    fn next_seq(log: &[Checkpoint]) -> Seq {
        log.last().map(|c| c.seq + 1).unwrap_or(1)
    }
}

impl Default for InMemoryCheckpointLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointLog for InMemoryCheckpointLog {
    fn append(&self, checkpoint: NewCheckpoint) -> Result<Checkpoint, KernelError> {
        let mut logs = self
            .logs
            .write()
            .map_err(|e| KernelError::CheckpointLog(e.to_string()))?;
        let log = logs.entry(checkpoint.deployment_id.clone()).or_default();
        let stored = checkpoint.sequenced(Self::next_seq(log));
        log.push(stored.clone());
        Ok(stored)
    }

    fn scan(&self, deployment_id: &str, from: Seq) -> Result<Vec<Checkpoint>, KernelError> {
        let logs = self
            .logs
            .read()
            .map_err(|e| KernelError::CheckpointLog(e.to_string()))?;
        let log = match logs.get(deployment_id) {
            Some(l) => l,
            None => return Ok(Vec::new()),
        };
        Ok(log.iter().filter(|c| c.seq >= from).cloned().collect())
    }

    fn head(&self, deployment_id: &str) -> Result<Seq, KernelError> {
        let logs = self
            .logs
            .read()
            .map_err(|e| KernelError::CheckpointLog(e.to_string()))?;
        Ok(logs
            .get(deployment_id)
            .and_then(|l| l.last())
            .map(|c| c.seq)
            .unwrap_or(0))
    }
}
