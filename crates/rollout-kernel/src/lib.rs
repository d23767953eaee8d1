//! Rollout kernel: the deterministic core of the deployment coordinator.
//!
//! Plan model and dependency ordering, the append-only checkpoint log (source of
//! truth), replay of that log into node and phase state, retry policy, and the
//! notification contract. Nothing here spawns tasks or talks to nodes.

pub mod kernel;

pub use kernel::*;
