//! Checkpoint type and CheckpointLog for the rollout kernel.
//!
//! Checkpoints are the source of truth. All node and phase state is derived by replaying them.
//! Constraints: append is atomic and durable before it returns; seq is assigned by the log,
//! strictly increasing from 1 with no gaps; scan returns ordered by seq.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kernel::identity::{DeploymentId, NodeId, PhaseName, Seq};

/// One progress event recorded in the checkpoint log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CheckpointEvent {
    /// A phase began; carries the resolved node set so replay does not depend on fleet membership.
    PhaseStarted { nodes: Vec<NodeId> },
    /// A node reached Succeeded after `attempts` executions.
    NodeSucceeded { attempts: u32 },
    /// A node is terminally Failed (retries exhausted or cancelled).
    NodeFailed { error: String, attempts: u32 },
    PhaseCompleted,
    /// A phase was aborted; not-yet-terminal nodes of the phase are Skipped.
    PhaseAborted { reason: String, failure_rate: f64 },
    /// A phase was never scheduled because a dependency did not complete.
    PhaseSkipped { reason: String },
    RunCompleted,
    RunAborted { reason: String },
}

impl CheckpointEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CheckpointEvent::PhaseStarted { .. } => "PhaseStarted",
            CheckpointEvent::NodeSucceeded { .. } => "NodeSucceeded",
            CheckpointEvent::NodeFailed { .. } => "NodeFailed",
            CheckpointEvent::PhaseCompleted => "PhaseCompleted",
            CheckpointEvent::PhaseAborted { .. } => "PhaseAborted",
            CheckpointEvent::PhaseSkipped { .. } => "PhaseSkipped",
            CheckpointEvent::RunCompleted => "RunCompleted",
            CheckpointEvent::RunAborted { .. } => "RunAborted",
        }
    }
}

/// A checkpoint as stored: immutable, with its assigned sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: Seq,
    pub deployment_id: DeploymentId,
    pub phase: Option<PhaseName>,
    pub node_id: Option<NodeId>,
    pub event: CheckpointEvent,
    pub recorded_at: DateTime<Utc>,
}

/// A checkpoint before the log assigns its sequence number.
#[derive(Clone, Debug, PartialEq)]
pub struct NewCheckpoint {
    pub deployment_id: DeploymentId,
    pub phase: Option<PhaseName>,
    pub node_id: Option<NodeId>,
    pub event: CheckpointEvent,
    pub recorded_at: DateTime<Utc>,
}

impl NewCheckpoint {
    /// Run-scoped checkpoint (RunCompleted, RunAborted).
    pub fn run(deployment_id: impl Into<DeploymentId>, event: CheckpointEvent) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            phase: None,
            node_id: None,
            event,
            recorded_at: now_millis(),
        }
    }

    /// Phase-scoped checkpoint.
    pub fn phase(
        deployment_id: impl Into<DeploymentId>,
        phase: impl Into<PhaseName>,
        event: CheckpointEvent,
    ) -> Self {
        Self {
            phase: Some(phase.into()),
            ..Self::run(deployment_id, event)
        }
    }

    /// Node-scoped checkpoint.
    pub fn node(
        deployment_id: impl Into<DeploymentId>,
        phase: impl Into<PhaseName>,
        node_id: impl Into<NodeId>,
        event: CheckpointEvent,
    ) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::phase(deployment_id, phase, event)
        }
    }

    pub fn at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }

    pub fn sequenced(self, seq: Seq) -> Checkpoint {
        Checkpoint {
            seq,
            deployment_id: self.deployment_id,
            phase: self.phase,
            node_id: self.node_id,
            event: self.event,
            recorded_at: self.recorded_at,
        }
    }
}

/// Current time truncated to milliseconds, the precision every store keeps.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Finite, ordered sequence of checkpoints returned by [CheckpointLog::replay].
///
/// Every call to `replay` starts again from sequence 1; this is not a live stream.
#[derive(Debug)]
pub struct ReplayIter {
    inner: std::vec::IntoIter<Checkpoint>,
}

impl ReplayIter {
    pub fn new(checkpoints: Vec<Checkpoint>) -> Self {
        Self {
            inner: checkpoints.into_iter(),
        }
    }
}

impl Iterator for ReplayIter {
    type Item = Checkpoint;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for ReplayIter {}

/// Checkpoint log: append-only ledger per deployment, source of truth.
///
/// **Constraints (must hold in all implementations and tests):**
/// - `append` is durable before it returns and assigns `head + 1` as seq.
/// - Concurrent appends are serialized: no gaps, no duplicate seqs.
/// - `scan(deployment_id, from)` returns checkpoints in **ascending seq order**.
pub trait CheckpointLog: Send + Sync {
    /// Appends one checkpoint and returns it with its assigned seq.
    fn append(&self, checkpoint: NewCheckpoint) -> Result<Checkpoint, KernelError>;

    /// Scans checkpoints for the deployment starting at `from` (inclusive).
    fn scan(&self, deployment_id: &str, from: Seq) -> Result<Vec<Checkpoint>, KernelError>;

    /// Returns the highest seq for the deployment (0 if the log is empty).
    fn head(&self, deployment_id: &str) -> Result<Seq, KernelError>;

    /// Full replay from sequence 1.
    fn replay(&self, deployment_id: &str) -> Result<ReplayIter, KernelError> {
        const FROM_SEQ: Seq = 1;
        Ok(ReplayIter::new(self.scan(deployment_id, FROM_SEQ)?))
    }
}

impl<L: CheckpointLog + ?Sized> CheckpointLog for std::sync::Arc<L> {
    fn append(&self, checkpoint: NewCheckpoint) -> Result<Checkpoint, KernelError> {
        (**self).append(checkpoint)
    }

    fn scan(&self, deployment_id: &str, from: Seq) -> Result<Vec<Checkpoint>, KernelError> {
        (**self).scan(deployment_id, from)
    }

    fn head(&self, deployment_id: &str) -> Result<Seq, KernelError> {
        (**self).head(deployment_id)
    }
}

/// Kernel-level error type.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("CheckpointLog error: {0}")]
    CheckpointLog(String),
    #[error("Replay error: {0}")]
    Replay(String),
    #[error("PlanLoader error: {0}")]
    PlanLoader(String),
}
