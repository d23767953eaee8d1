//! Replay reducer: rebuilds node and phase state from the checkpoint log.
//!
//! Constraints: the reducer is pure over checkpoints (timestamps come from the log, never the
//! clock), and a checkpoint whose seq is not above the last applied seq is skipped, so replaying
//! twice or replaying a duplicated tail yields the same state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kernel::checkpoint::{Checkpoint, CheckpointEvent, CheckpointLog, KernelError};
use crate::kernel::identity::{DeploymentId, NodeId, PhaseName, Seq};
use crate::kernel::state::{NodeState, NodeStatus, PhaseRunState, PhaseStatus};

/// Final outcome of a run as recorded in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed,
    Aborted { reason: String },
}

/// Replayed view of one phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    /// Node set resolved when the phase started.
    pub nodes: Vec<NodeId>,
    pub abort_reason: Option<String>,
    pub failure_rate_at_abort: Option<f64>,
    pub skip_reason: Option<String>,
}

impl PhaseRecord {
    pub fn not_started() -> Self {
        Self {
            status: PhaseStatus::NotStarted,
            nodes: Vec::new(),
            abort_reason: None,
            failure_rate_at_abort: None,
            skip_reason: None,
        }
    }
}

impl Default for PhaseRecord {
    fn default() -> Self {
        Self::not_started()
    }
}

/// Everything a restarted controller needs to resume a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplayedRun {
    pub deployment_id: DeploymentId,
    pub last_seq: Seq,
    pub phases: BTreeMap<PhaseName, PhaseRecord>,
    pub nodes: BTreeMap<(PhaseName, NodeId), NodeState>,
    pub run_status: Option<RunOutcome>,
}

impl ReplayedRun {
    pub fn new(deployment_id: impl Into<DeploymentId>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            last_seq: 0,
            phases: BTreeMap::new(),
            nodes: BTreeMap::new(),
            run_status: None,
        }
    }

    pub fn phase_status(&self, phase: &str) -> PhaseStatus {
        self.phases
            .get(phase)
            .map(|p| p.status)
            .unwrap_or(PhaseStatus::NotStarted)
    }

    pub fn node(&self, phase: &str, node_id: &str) -> Option<&NodeState> {
        self.nodes.get(&(phase.to_string(), node_id.to_string()))
    }

    pub fn nodes_in_phase<'a>(&'a self, phase: &'a str) -> impl Iterator<Item = &'a NodeState> + 'a {
        self.nodes
            .iter()
            .filter(move |((p, _), _)| p == phase)
            .map(|(_, state)| state)
    }

    pub fn phase_run_state(&self, phase: &str) -> PhaseRunState {
        PhaseRunState::from_nodes(phase, self.phase_status(phase), self.nodes_in_phase(phase))
    }

    /// Nodes recorded as terminally failed, in (phase, node) order.
    pub fn failures(&self) -> Vec<&NodeState> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Failed && n.failure_final)
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.run_status.is_some()
    }
}

/// Applies checkpoints one at a time to a [ReplayedRun].
#[derive(Debug)]
pub struct RunReplayer {
    run: ReplayedRun,
}

impl RunReplayer {
    pub fn new(deployment_id: impl Into<DeploymentId>) -> Self {
        Self {
            run: ReplayedRun::new(deployment_id),
        }
    }

    pub fn state(&self) -> &ReplayedRun {
        &self.run
    }

    pub fn finish(self) -> ReplayedRun {
        self.run
    }

    /// Returns `Ok(false)` when the checkpoint was already applied.
    pub fn apply(&mut self, checkpoint: &Checkpoint) -> Result<bool, KernelError> {
        if checkpoint.deployment_id != self.run.deployment_id {
            return Err(KernelError::Replay(format!(
                "checkpoint {} belongs to deployment {}, not {}",
                checkpoint.seq, checkpoint.deployment_id, self.run.deployment_id
            )));
        }
        if checkpoint.seq <= self.run.last_seq {
            tracing::debug!(
                deployment_id = %self.run.deployment_id,
                seq = checkpoint.seq,
                last_seq = self.run.last_seq,
                "skipping already applied checkpoint"
            );
            return Ok(false);
        }

        let at = checkpoint.recorded_at;
        match &checkpoint.event {
            CheckpointEvent::PhaseStarted { nodes } => {
                let phase = require_phase(checkpoint)?;
                let record = self.run.phases.entry(phase.clone()).or_default();
                record.status = PhaseStatus::Running;
                record.nodes = nodes.clone();
                for node in nodes {
                    self.run
                        .nodes
                        .entry((phase.clone(), node.clone()))
                        .or_insert_with(|| NodeState::pending(node.clone(), phase.clone(), at));
                }
            }
            CheckpointEvent::NodeSucceeded { attempts } => {
                let state = self.node_mut(checkpoint)?;
                state.status = NodeStatus::Succeeded;
                state.retry_count = attempts.saturating_sub(1);
                state.failure_final = false;
                state.updated_at = at;
                state.finished_at = Some(at);
            }
            CheckpointEvent::NodeFailed { error, attempts } => {
                let state = self.node_mut(checkpoint)?;
                state.status = NodeStatus::Failed;
                state.retry_count = attempts.saturating_sub(1);
                state.failure_final = true;
                state.last_error = Some(error.clone());
                state.updated_at = at;
                state.finished_at = Some(at);
            }
            CheckpointEvent::PhaseCompleted => {
                let phase = require_phase(checkpoint)?;
                self.run.phases.entry(phase.clone()).or_default().status = PhaseStatus::Completed;
            }
            CheckpointEvent::PhaseAborted {
                reason,
                failure_rate,
            } => {
                let phase = require_phase(checkpoint)?;
                let record = self.run.phases.entry(phase.clone()).or_default();
                record.status = PhaseStatus::Aborted;
                record.abort_reason = Some(reason.clone());
                record.failure_rate_at_abort = Some(*failure_rate);
                self.skip_open_nodes(phase, at);
            }
            CheckpointEvent::PhaseSkipped { reason } => {
                let phase = require_phase(checkpoint)?;
                let record = self.run.phases.entry(phase.clone()).or_default();
                record.status = PhaseStatus::Skipped;
                record.skip_reason = Some(reason.clone());
                self.skip_open_nodes(phase, at);
            }
            CheckpointEvent::RunCompleted => {
                self.run.run_status = Some(RunOutcome::Completed);
            }
            CheckpointEvent::RunAborted { reason } => {
                self.run.run_status = Some(RunOutcome::Aborted {
                    reason: reason.clone(),
                });
            }
        }
        self.run.last_seq = checkpoint.seq;
        Ok(true)
    }

    fn node_mut(&mut self, checkpoint: &Checkpoint) -> Result<&mut NodeState, KernelError> {
        let phase = require_phase(checkpoint)?;
        let node = checkpoint.node_id.as_ref().ok_or_else(|| {
            KernelError::Replay(format!(
                "{} checkpoint {} has no node id",
                checkpoint.event.kind(),
                checkpoint.seq
            ))
        })?;
        self.run
            .nodes
            .get_mut(&(phase.clone(), node.clone()))
            .ok_or_else(|| {
                KernelError::Replay(format!(
                    "checkpoint {} references node {node} outside the started set of phase {phase}",
                    checkpoint.seq
                ))
            })
    }

    fn skip_open_nodes(&mut self, phase: &str, at: chrono::DateTime<chrono::Utc>) {
        for ((p, _), state) in self.run.nodes.iter_mut() {
            if p == phase && !state.is_terminal() {
                state.status = NodeStatus::Skipped;
                state.updated_at = at;
            }
        }
    }
}

fn require_phase(checkpoint: &Checkpoint) -> Result<&PhaseName, KernelError> {
    checkpoint.phase.as_ref().ok_or_else(|| {
        KernelError::Replay(format!(
            "{} checkpoint {} has no phase",
            checkpoint.event.kind(),
            checkpoint.seq
        ))
    })
}

/// Replays the full log of `deployment_id` from sequence 1.
pub fn replay_run(log: &dyn CheckpointLog, deployment_id: &str) -> Result<ReplayedRun, KernelError> {
    let mut replayer = RunReplayer::new(deployment_id);
    for checkpoint in log.replay(deployment_id)? {
        replayer.apply(&checkpoint)?;
    }
    Ok(replayer.finish())
}
