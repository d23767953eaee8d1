//! Deployment plan model and the plan loader contract.
//!
//! A plan is immutable once submitted. Parsing of front-end formats (YAML, CLI flags)
//! lives outside this crate; loaders only hand over a [DeploymentPlan].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::checkpoint::KernelError;
use crate::kernel::identity::{DeploymentId, NodeId, PhaseName};

const DEFAULT_NODE_TIMEOUT_MS: u64 = 30_000;

/// Immutable description of one orchestration run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: DeploymentId,
    pub phases: Vec<PhaseSpec>,
    /// Failure fraction tolerated by phases that do not set their own.
    pub failure_threshold: f64,
    /// Whole-run deadline; the run is aborted when it passes.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl DeploymentPlan {
    pub fn new(id: impl Into<DeploymentId>, failure_threshold: f64) -> Self {
        Self {
            id: id.into(),
            phases: Vec::new(),
            failure_threshold,
            timeout_ms: None,
        }
    }

    pub fn with_phase(mut self, phase: PhaseSpec) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Threshold in effect for `phase` (its own, else the plan-wide one).
    pub fn threshold_for(&self, phase: &PhaseSpec) -> f64 {
        phase.failure_threshold.unwrap_or(self.failure_threshold)
    }
}

/// Which nodes a phase targets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeTarget {
    /// Explicit node list, used as given.
    Nodes(Vec<NodeId>),
    /// Every healthy registered node carrying all of these labels.
    Selector(BTreeMap<String, String>),
}

/// Opaque unit of work handed to the task executor for every node of a phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self::new("deploy", Value::Null)
    }
}

/// A named stage of the rollout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: PhaseName,
    pub target: NodeTarget,
    #[serde(default)]
    pub depends_on: Vec<PhaseName>,
    /// Maximum nodes executing at once within this phase.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub failure_threshold: Option<f64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    #[serde(default)]
    pub task: TaskSpec,
}

fn default_concurrency() -> usize {
    1
}

fn default_node_timeout_ms() -> u64 {
    DEFAULT_NODE_TIMEOUT_MS
}

impl PhaseSpec {
    pub fn new(name: impl Into<PhaseName>, target: NodeTarget) -> Self {
        Self {
            name: name.into(),
            target,
            depends_on: Vec::new(),
            concurrency: 1,
            failure_threshold: None,
            timeout_ms: None,
            node_timeout_ms: DEFAULT_NODE_TIMEOUT_MS,
            task: TaskSpec::default(),
        }
    }

    /// Phase over an explicit node list.
    pub fn with_nodes<I, N>(name: impl Into<PhaseName>, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        Self::new(name, NodeTarget::Nodes(nodes.into_iter().map(Into::into).collect()))
    }

    pub fn depends_on(mut self, phase: impl Into<PhaseName>) -> Self {
        self.depends_on.push(phase.into());
        self
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit;
        self
    }

    pub fn failure_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn task(mut self, task: TaskSpec) -> Self {
        self.task = task;
        self
    }

    pub fn phase_timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn node_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }
}

/// Supplies a deployment plan to the coordinator.
pub trait PlanLoader: Send + Sync {
    fn load(&self) -> Result<DeploymentPlan, KernelError>;
}

/// Loader over an already-built plan.
#[derive(Clone, Debug)]
pub struct StaticPlanLoader(pub DeploymentPlan);

impl PlanLoader for StaticPlanLoader {
    fn load(&self) -> Result<DeploymentPlan, KernelError> {
        Ok(self.0.clone())
    }
}

/// Loader over the plan's serde JSON representation.
#[derive(Clone, Debug)]
pub struct JsonPlanLoader {
    source: String,
}

impl JsonPlanLoader {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self, KernelError> {
        let mut source = String::new();
        reader
            .read_to_string(&mut source)
            .map_err(|e| KernelError::PlanLoader(format!("read plan: {e}")))?;
        Ok(Self { source })
    }
}

impl PlanLoader for JsonPlanLoader {
    fn load(&self) -> Result<DeploymentPlan, KernelError> {
        serde_json::from_str(&self.source)
            .map_err(|e| KernelError::PlanLoader(format!("decode plan: {e}")))
    }
}
