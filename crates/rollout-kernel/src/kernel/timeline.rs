//! Run timeline: the observable sequence of checkpoints for a deployment (audit, post-mortem).
//!
//! Built from the CheckpointLog; serializes to JSON for UI/CLI.

use serde::{Deserialize, Serialize};

use crate::kernel::checkpoint::{CheckpointEvent, CheckpointLog, KernelError};
use crate::kernel::identity::{DeploymentId, Seq};

/// One entry in a run timeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub seq: Seq,
    /// Checkpoint kind: PhaseStarted, NodeSucceeded, NodeFailed, PhaseCompleted, ...
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Full timeline for a deployment: ordered entries and final status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunTimeline {
    pub deployment_id: DeploymentId,
    pub events: Vec<TimelineEntry>,
    pub final_status: RunStatusSummary,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum RunStatusSummary {
    NotStarted,
    InProgress { node_failures: usize },
    Completed,
    Aborted { reason: String },
}

pub fn run_timeline(log: &dyn CheckpointLog, deployment_id: &str) -> Result<RunTimeline, KernelError> {
    let mut entries = Vec::new();
    let mut node_failures = 0usize;
    let mut final_status = RunStatusSummary::NotStarted;

    for cp in log.replay(deployment_id)? {
        let detail = match &cp.event {
            CheckpointEvent::PhaseStarted { nodes } => Some(format!("{} nodes", nodes.len())),
            CheckpointEvent::NodeFailed { error, attempts } => {
                node_failures += 1;
                Some(format!("{error} after {attempts} attempts"))
            }
            CheckpointEvent::PhaseAborted {
                reason,
                failure_rate,
            } => Some(format!("{reason} (failure rate {failure_rate:.3})")),
            CheckpointEvent::PhaseSkipped { reason } => Some(reason.clone()),
            CheckpointEvent::RunAborted { reason } => {
                final_status = RunStatusSummary::Aborted {
                    reason: reason.clone(),
                };
                Some(reason.clone())
            }
            CheckpointEvent::RunCompleted => {
                final_status = RunStatusSummary::Completed;
                None
            }
            CheckpointEvent::NodeSucceeded { .. } | CheckpointEvent::PhaseCompleted => None,
        };
        if matches!(final_status, RunStatusSummary::NotStarted | RunStatusSummary::InProgress { .. }) {
            final_status = RunStatusSummary::InProgress { node_failures };
        }
        entries.push(TimelineEntry {
            seq: cp.seq,
            kind: cp.event.kind().to_string(),
            phase: cp.phase,
            node_id: cp.node_id,
            detail,
            recorded_at: cp.recorded_at,
        });
    }

    Ok(RunTimeline {
        deployment_id: deployment_id.to_string(),
        events: entries,
        final_status,
    })
}
