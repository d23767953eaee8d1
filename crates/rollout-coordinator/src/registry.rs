//! Node registry: fleet membership and per-phase node state.
//!
//! Constraints: node status only moves forward along the allowed transitions; a rejected
//! transition leaves the stored state untouched. The registry is the only writer of NodeState.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use parking_lot::RwLock;

use rollout_kernel::{NodeId, NodeState, NodeStatus, NodeTarget, PhaseName, PhaseRunState, PhaseStatus};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid transition for node {node} in phase {phase}: {from} -> {to}")]
    InvalidTransition {
        node: NodeId,
        phase: PhaseName,
        from: NodeStatus,
        to: NodeStatus,
    },
    #[error("node {node} is not part of phase {phase}")]
    UnknownNode { node: NodeId, phase: PhaseName },
    #[error("node {0} is not registered in the fleet")]
    UnknownFleetNode(NodeId),
}

/// Fleet membership entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub labels: BTreeMap<String, String>,
    pub healthy: bool,
}

impl NodeInfo {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            labels: BTreeMap::new(),
            healthy: true,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    fn matches(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|have| have == v))
    }
}

#[derive(Default)]
struct RegistryInner {
    fleet: BTreeMap<NodeId, NodeInfo>,
    states: HashMap<PhaseName, BTreeMap<NodeId, NodeState>>,
}

pub struct NodeRegistry {
    max_retries: u32,
    inner: RwLock<RegistryInner>,
}

impl NodeRegistry {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Drops all per-phase node state; fleet membership is kept.
    pub fn clear_states(&self) {
        self.inner.write().states.clear();
    }

    pub fn register_node(&self, info: NodeInfo) {
        self.inner.write().fleet.insert(info.id.clone(), info);
    }

    pub fn set_health(&self, node: &str, healthy: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let info = inner
            .fleet
            .get_mut(node)
            .ok_or_else(|| RegistryError::UnknownFleetNode(node.to_string()))?;
        info.healthy = healthy;
        Ok(())
    }

    /// Resolves a phase target to concrete node ids.
    ///
    /// Explicit lists keep their order (duplicates dropped). Selectors return the healthy
    /// registered nodes carrying every selector label, sorted by id.
    pub fn resolve(&self, target: &NodeTarget) -> Vec<NodeId> {
        match target {
            NodeTarget::Nodes(nodes) => {
                let mut seen = std::collections::HashSet::new();
                nodes
                    .iter()
                    .filter(|n| seen.insert(n.as_str()))
                    .cloned()
                    .collect()
            }
            NodeTarget::Selector(selector) => self
                .inner
                .read()
                .fleet
                .values()
                .filter(|info| info.healthy && info.matches(selector))
                .map(|info| info.id.clone())
                .collect(),
        }
    }

    /// Creates `Pending` state for every node of the phase that has none yet.
    pub fn begin_phase(&self, phase: &str, nodes: &[NodeId]) {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let states = inner.states.entry(phase.to_string()).or_default();
        for node in nodes {
            states
                .entry(node.clone())
                .or_insert_with(|| NodeState::pending(node.clone(), phase, now));
        }
    }

    /// Installs a replayed state as-is.
    pub fn restore(&self, state: NodeState) {
        self.inner
            .write()
            .states
            .entry(state.phase.clone())
            .or_default()
            .insert(state.node_id.clone(), state);
    }

    pub fn get(&self, node: &str, phase: &str) -> Option<NodeState> {
        self.inner
            .read()
            .states
            .get(phase)
            .and_then(|s| s.get(node))
            .cloned()
    }

    pub fn nodes(&self, phase: &str) -> Vec<NodeState> {
        self.inner
            .read()
            .states
            .get(phase)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Node-level aggregate. The status is `NotStarted` for an unknown phase and `Running`
    /// otherwise; callers holding the phase table substitute the real phase status.
    pub fn snapshot(&self, phase: &str) -> PhaseRunState {
        let inner = self.inner.read();
        match inner.states.get(phase) {
            Some(states) => PhaseRunState::from_nodes(phase, PhaseStatus::Running, states.values()),
            None => PhaseRunState::from_nodes(phase, PhaseStatus::NotStarted, std::iter::empty()),
        }
    }

    /// Applies one transition and returns the updated state.
    pub fn set_status(
        &self,
        node: &str,
        phase: &str,
        to: NodeStatus,
        error: Option<String>,
    ) -> Result<NodeState, RegistryError> {
        let mut inner = self.inner.write();
        let state = lookup(&mut inner, node, phase)?;
        if !self.allowed(state, to) {
            return Err(RegistryError::InvalidTransition {
                node: node.to_string(),
                phase: phase.to_string(),
                from: state.status,
                to,
            });
        }

        let now = Utc::now();
        match to {
            NodeStatus::Queued if state.status == NodeStatus::Failed => state.retry_count += 1,
            NodeStatus::Executing => {
                state.started_at.get_or_insert(now);
            }
            NodeStatus::Failed => {
                state.last_error = error;
                state.failure_final = state.retry_count >= self.max_retries;
                if state.failure_final {
                    state.finished_at = Some(now);
                }
            }
            NodeStatus::Succeeded | NodeStatus::Skipped => state.finished_at = Some(now),
            _ => {}
        }
        state.status = to;
        state.updated_at = now;
        Ok(state.clone())
    }

    /// Marks a node terminally `Failed` regardless of remaining retries (cancellation).
    /// Allowed from `Queued`, `Executing`, or a `Failed` still awaiting retry.
    pub fn finalize_failed(
        &self,
        node: &str,
        phase: &str,
        error: impl Into<String>,
    ) -> Result<NodeState, RegistryError> {
        let mut inner = self.inner.write();
        let state = lookup(&mut inner, node, phase)?;
        let allowed = match state.status {
            NodeStatus::Queued | NodeStatus::Executing => true,
            NodeStatus::Failed => !state.failure_final,
            _ => false,
        };
        if !allowed {
            return Err(RegistryError::InvalidTransition {
                node: node.to_string(),
                phase: phase.to_string(),
                from: state.status,
                to: NodeStatus::Failed,
            });
        }
        let now = Utc::now();
        state.status = NodeStatus::Failed;
        state.failure_final = true;
        state.last_error = Some(error.into());
        state.updated_at = now;
        state.finished_at = Some(now);
        Ok(state.clone())
    }

    /// Marks every node of the phase that never started (`Pending`, `Queued`) as `Skipped`.
    pub fn skip_remaining(&self, phase: &str) -> Vec<NodeId> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let Some(states) = inner.states.get_mut(phase) else {
            return Vec::new();
        };
        let mut skipped = Vec::new();
        for state in states.values_mut() {
            if matches!(state.status, NodeStatus::Pending | NodeStatus::Queued) {
                state.status = NodeStatus::Skipped;
                state.updated_at = now;
                state.finished_at = Some(now);
                skipped.push(state.node_id.clone());
            }
        }
        skipped
    }

    /// Terminal failures across all phases.
    pub fn failures(&self) -> Vec<NodeState> {
        let inner = self.inner.read();
        let mut out: Vec<NodeState> = inner
            .states
            .values()
            .flat_map(|s| s.values())
            .filter(|n| n.status == NodeStatus::Failed && n.failure_final)
            .cloned()
            .collect();
        out.sort_by(|a, b| (&a.phase, &a.node_id).cmp(&(&b.phase, &b.node_id)));
        out
    }

    fn allowed(&self, state: &NodeState, to: NodeStatus) -> bool {
        use NodeStatus::*;
        match (state.status, to) {
            (Pending, Queued) | (Pending, Skipped) => true,
            (Queued, Executing) | (Queued, Skipped) => true,
            (Executing, Succeeded) | (Executing, Failed) => true,
            (Failed, Queued) => !state.failure_final && state.retry_count < self.max_retries,
            _ => false,
        }
    }
}

fn lookup<'a>(
    inner: &'a mut RegistryInner,
    node: &str,
    phase: &str,
) -> Result<&'a mut NodeState, RegistryError> {
    inner
        .states
        .get_mut(phase)
        .and_then(|s| s.get_mut(node))
        .ok_or_else(|| RegistryError::UnknownNode {
            node: node.to_string(),
            phase: phase.to_string(),
        })
}
