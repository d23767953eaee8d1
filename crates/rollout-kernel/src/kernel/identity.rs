//! Identity types for the rollout kernel.
//!
//! DeploymentId identifies one orchestration run; PhaseName and NodeId identify
//! a stage and a fleet member; Seq is the per-deployment checkpoint sequence number.

/// Identifies one deployment run (one checkpoint log).
pub type DeploymentId = String;

/// Name of a phase within a plan (unique per plan).
pub type PhaseName = String;

/// Identifies a target node in the fleet.
pub type NodeId = String;

/// Monotonically increasing checkpoint sequence number per deployment, starting at 1.
pub type Seq = u64;
