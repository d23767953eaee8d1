//! Phase table, controller state, and the read-only status query API.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use rollout_kernel::{
    DeploymentId, NodeId, NodeState, PhaseName, PhaseRecord, PhaseRunState, PhaseStatus, RunOutcome,
};

use crate::registry::NodeRegistry;

/// Controller state machine position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    Initializing,
    ValidatingPlan,
    SchedulingPhase(usize),
    AwaitingPhaseCompletion(usize),
    Completed,
    Aborted,
    Failed,
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControllerState::Completed | ControllerState::Aborted | ControllerState::Failed
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Aborted,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub phase: PhaseName,
    pub node_id: NodeId,
    pub error: String,
    pub attempts: u32,
}

/// Summary for deciding between forward fix and rollback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub deployment_id: DeploymentId,
    pub status: RunStatus,
    pub aborted_phase: Option<PhaseName>,
    pub abort_reason: Option<String>,
    pub failure_rate_at_abort: Option<f64>,
    pub node_failures: Vec<NodeFailure>,
    /// Per-phase state in execution order.
    pub phases: Vec<PhaseRunState>,
}

struct BoardInner {
    deployment_id: DeploymentId,
    order: Vec<PhaseName>,
    phases: HashMap<PhaseName, PhaseRecord>,
    state: ControllerState,
    outcome: Option<RunOutcome>,
}

/// Phase table shared by the controller (writer) and status queries (readers).
pub struct PhaseBoard {
    inner: RwLock<BoardInner>,
}

impl Default for PhaseBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseBoard {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BoardInner {
                deployment_id: DeploymentId::new(),
                order: Vec::new(),
                phases: HashMap::new(),
                state: ControllerState::Initializing,
                outcome: None,
            }),
        }
    }

    /// Clears everything and starts tracking `deployment_id`.
    pub fn reset(&self, deployment_id: &str) {
        let mut inner = self.inner.write();
        inner.deployment_id = deployment_id.to_string();
        inner.order.clear();
        inner.phases.clear();
        inner.state = ControllerState::Initializing;
        inner.outcome = None;
    }

    pub fn deployment_id(&self) -> DeploymentId {
        self.inner.read().deployment_id.clone()
    }

    pub fn set_order(&self, order: Vec<PhaseName>) {
        let mut inner = self.inner.write();
        for phase in &order {
            inner.phases.entry(phase.clone()).or_default();
        }
        inner.order = order;
    }

    pub fn order(&self) -> Vec<PhaseName> {
        let inner = self.inner.read();
        if inner.order.is_empty() {
            let mut names: Vec<PhaseName> = inner.phases.keys().cloned().collect();
            names.sort();
            return names;
        }
        inner.order.clone()
    }

    pub fn restore(&self, phase: &str, record: PhaseRecord) {
        self.inner.write().phases.insert(phase.to_string(), record);
    }

    pub fn record(&self, phase: &str) -> Option<PhaseRecord> {
        self.inner.read().phases.get(phase).cloned()
    }

    pub fn phase_status(&self, phase: &str) -> PhaseStatus {
        self.inner
            .read()
            .phases
            .get(phase)
            .map(|r| r.status)
            .unwrap_or(PhaseStatus::NotStarted)
    }

    pub fn mark_started(&self, phase: &str, nodes: Vec<NodeId>) {
        let mut inner = self.inner.write();
        let record = inner.phases.entry(phase.to_string()).or_default();
        record.status = PhaseStatus::Running;
        record.nodes = nodes;
    }

    pub fn mark_completed(&self, phase: &str) {
        self.inner
            .write()
            .phases
            .entry(phase.to_string())
            .or_default()
            .status = PhaseStatus::Completed;
    }

    pub fn mark_aborted(&self, phase: &str, reason: &str, failure_rate: f64) {
        let mut inner = self.inner.write();
        let record = inner.phases.entry(phase.to_string()).or_default();
        record.status = PhaseStatus::Aborted;
        record.abort_reason = Some(reason.to_string());
        record.failure_rate_at_abort = Some(failure_rate);
    }

    pub fn mark_skipped(&self, phase: &str, reason: &str) {
        let mut inner = self.inner.write();
        let record = inner.phases.entry(phase.to_string()).or_default();
        record.status = PhaseStatus::Skipped;
        record.skip_reason = Some(reason.to_string());
    }

    pub fn set_state(&self, state: ControllerState) {
        self.inner.write().state = state;
    }

    pub fn state(&self) -> ControllerState {
        self.inner.read().state
    }

    pub fn set_outcome(&self, outcome: RunOutcome) {
        self.inner.write().outcome = Some(outcome);
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.inner.read().outcome.clone()
    }
}

/// Cheap-to-clone read handle; safe to use while a run is in progress.
#[derive(Clone)]
pub struct StatusQuery {
    registry: Arc<NodeRegistry>,
    board: Arc<PhaseBoard>,
}

impl StatusQuery {
    pub fn new(registry: Arc<NodeRegistry>, board: Arc<PhaseBoard>) -> Self {
        Self { registry, board }
    }

    pub fn phase(&self, name: &str) -> Option<PhaseRunState> {
        let record = self.board.record(name)?;
        let mut state = self.registry.snapshot(name);
        state.status = record.status;
        Some(state)
    }

    pub fn node(&self, node: &str, phase: &str) -> Option<NodeState> {
        self.registry.get(node, phase)
    }

    pub fn phases(&self) -> Vec<PhaseRunState> {
        self.board
            .order()
            .iter()
            .filter_map(|name| self.phase(name))
            .collect()
    }

    pub fn controller_state(&self) -> ControllerState {
        self.board.state()
    }

    pub fn report(&self) -> RunReport {
        let status = match self.board.state() {
            ControllerState::Initializing | ControllerState::ValidatingPlan => RunStatus::Pending,
            ControllerState::SchedulingPhase(_) | ControllerState::AwaitingPhaseCompletion(_) => {
                RunStatus::Running
            }
            ControllerState::Completed => RunStatus::Completed,
            ControllerState::Aborted => RunStatus::Aborted,
            ControllerState::Failed => RunStatus::Failed,
        };

        let aborted = self
            .board
            .order()
            .into_iter()
            .filter_map(|name| self.board.record(&name).map(|r| (name, r)))
            .find(|(_, r)| r.status == PhaseStatus::Aborted);
        let (aborted_phase, abort_reason, failure_rate_at_abort) = match aborted {
            Some((name, record)) => (
                Some(name),
                record.abort_reason,
                record.failure_rate_at_abort,
            ),
            None => (None, None, None),
        };

        let node_failures = self
            .registry
            .failures()
            .into_iter()
            .map(|n| NodeFailure {
                attempts: n.attempts(),
                phase: n.phase,
                node_id: n.node_id,
                error: n.last_error.unwrap_or_default(),
            })
            .collect();

        RunReport {
            deployment_id: self.board.deployment_id(),
            status,
            aborted_phase,
            abort_reason,
            failure_rate_at_abort,
            node_failures,
            phases: self.phases(),
        }
    }
}
