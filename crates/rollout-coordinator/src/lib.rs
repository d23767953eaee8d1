//! Rollout coordinator: drives a [`DeploymentPlan`](rollout_kernel::DeploymentPlan) across a fleet.
//!
//! Phases run in dependency order. Within a phase, nodes run under a concurrency slot limit,
//! retry with backoff, and feed a failure-rate circuit breaker that aborts the phase (and every
//! dependent phase) once the threshold is crossed. Every state change is written to the
//! checkpoint log before it is acted on, so a restarted coordinator resumes where it stopped.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use rollout_coordinator::{Coordinator, CoordinatorConfig, TaskExecutor};
//! # async fn demo(executor: Arc<dyn TaskExecutor>, plan: rollout_kernel::DeploymentPlan)
//! #     -> Result<(), rollout_coordinator::CoordinatorError> {
//! let config = CoordinatorConfig::from_env()?;
//! let coordinator = Coordinator::new(config.open_checkpoint_log()?, executor, &config);
//! let report = coordinator.run(&plan).await?;
//! println!("{:?}", report.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod failure_policy;
pub mod notify;
pub mod phase_executor;
pub mod recovery;
pub mod registry;
pub mod slot;
pub mod status;
pub mod task;

pub use config::{CheckpointBackend, CoordinatorConfig};
pub use controller::Coordinator;
pub use error::CoordinatorError;
pub use failure_policy::{Decision, FailurePolicyConfig, FailurePolicyEngine, PhaseFailureStats};
pub use notify::ChannelNotificationSink;
pub use phase_executor::{AbortReason, PhaseContext, PhaseExecutor, PhaseOutcome};
pub use recovery::RecoveryReport;
pub use registry::{NodeInfo, NodeRegistry, RegistryError};
pub use slot::{ReleaseOutcome, Slot, SlotError, SlotManager};
pub use status::{ControllerState, NodeFailure, PhaseBoard, RunReport, RunStatus, StatusQuery};
pub use task::{TaskExecutor, TaskResult};
