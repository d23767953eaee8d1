//! Node and phase state shared by the registry and the replay reducer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kernel::identity::{NodeId, PhaseName};

/// Status of one node within one phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Pending,
    Queued,
    Executing,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "Pending",
            NodeStatus::Queued => "Queued",
            NodeStatus::Executing => "Executing",
            NodeStatus::Succeeded => "Succeeded",
            NodeStatus::Failed => "Failed",
            NodeStatus::Skipped => "Skipped",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress record of one node within one phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: NodeId,
    pub phase: PhaseName,
    pub status: NodeStatus,
    /// Number of times the node was requeued after a failed attempt.
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// A `Failed` node with this flag set will not be retried.
    pub failure_final: bool,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeState {
    pub fn pending(node_id: impl Into<NodeId>, phase: impl Into<PhaseName>, at: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.into(),
            phase: phase.into(),
            status: NodeStatus::Pending,
            retry_count: 0,
            last_error: None,
            failure_final: false,
            updated_at: at,
            started_at: None,
            finished_at: None,
        }
    }

    /// Succeeded, Skipped, or Failed with no retries left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            NodeStatus::Succeeded | NodeStatus::Skipped => true,
            NodeStatus::Failed => self.failure_final,
            _ => false,
        }
    }

    /// Attempts made so far (the first execution plus every retry).
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }
}

/// Lifecycle status of a phase within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseStatus {
    NotStarted,
    Running,
    Completed,
    Aborted,
    Skipped,
}

impl PhaseStatus {
    /// Dependents of a phase in this status can never be scheduled.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, PhaseStatus::Aborted | PhaseStatus::Skipped)
    }
}

/// Aggregate over the node states of one phase. Derived, never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseRunState {
    pub phase: PhaseName,
    pub status: PhaseStatus,
    pub total: usize,
    /// Nodes not yet terminal (Pending, Queued, Executing, or Failed awaiting retry).
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failure_rate: f64,
}

impl PhaseRunState {
    pub fn from_nodes<'a>(
        phase: impl Into<PhaseName>,
        status: PhaseStatus,
        nodes: impl IntoIterator<Item = &'a NodeState>,
    ) -> Self {
        let mut out = Self {
            phase: phase.into(),
            status,
            total: 0,
            pending: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            failure_rate: 0.0,
        };
        for node in nodes {
            out.total += 1;
            match node.status {
                NodeStatus::Succeeded => out.succeeded += 1,
                NodeStatus::Skipped => out.skipped += 1,
                NodeStatus::Failed if node.failure_final => out.failed += 1,
                _ => out.pending += 1,
            }
        }
        out.failure_rate = failure_rate(out.succeeded, out.failed);
        out
    }
}

/// `failed / (failed + succeeded)`, 0.0 when nothing has been observed.
pub fn failure_rate(succeeded: usize, failed: usize) -> f64 {
    let observed = succeeded + failed;
    if observed == 0 {
        0.0
    } else {
        failed as f64 / observed as f64
    }
}
