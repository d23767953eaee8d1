//! Rollout kernel API.
//!
//! Minimal set of interfaces: Plan (what to roll out), Graph (in which order),
//! Checkpoint Log (source of truth), Replay (state is a projection of the log),
//! Retry policy and Notification sink (the governable edges).

pub mod checkpoint;
pub mod checkpoint_store;
pub mod graph;
pub mod identity;
pub mod notification;
pub mod plan;
pub mod policy;
pub mod replay;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_store;
pub mod state;
pub mod timeline;

pub use checkpoint::{Checkpoint, CheckpointEvent, CheckpointLog, KernelError, NewCheckpoint, ReplayIter};
pub use checkpoint_store::InMemoryCheckpointLog;
pub use graph::{validate, DependencyGraph, PlanError};
pub use identity::{DeploymentId, NodeId, PhaseName, Seq};
pub use notification::{
    CollectingNotificationSink, LifecycleEvent, NoopNotificationSink, NotificationSink,
};
pub use plan::{
    DeploymentPlan, JsonPlanLoader, NodeTarget, PhaseSpec, PlanLoader, StaticPlanLoader, TaskSpec,
};
pub use policy::{RetryDecision, RetryPolicy};
pub use replay::{replay_run, PhaseRecord, ReplayedRun, RunOutcome, RunReplayer};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_store::SqliteCheckpointLog;
pub use state::{NodeState, NodeStatus, PhaseRunState, PhaseStatus};
pub use timeline::{run_timeline, RunStatusSummary, RunTimeline, TimelineEntry};
