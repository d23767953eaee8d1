//! Crash recovery: install a replayed run into the live registry and phase table.
//!
//! Failure-policy counters are not restored here; the phase executor seeds them from the
//! registry when it registers a phase, because the threshold comes from the plan.

use rollout_kernel::{PhaseStatus, ReplayedRun, Seq};

use crate::registry::NodeRegistry;
use crate::status::PhaseBoard;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub last_seq: Seq,
    pub phases_restored: usize,
    pub nodes_restored: usize,
    pub completed_phases: usize,
    pub run_finished: bool,
}

pub fn restore(replayed: &ReplayedRun, registry: &NodeRegistry, board: &PhaseBoard) -> RecoveryReport {
    for (phase, record) in &replayed.phases {
        board.restore(phase, record.clone());
    }
    for state in replayed.nodes.values() {
        registry.restore(state.clone());
    }
    if let Some(outcome) = &replayed.run_status {
        board.set_outcome(outcome.clone());
    }

    let report = RecoveryReport {
        last_seq: replayed.last_seq,
        phases_restored: replayed.phases.len(),
        nodes_restored: replayed.nodes.len(),
        completed_phases: replayed
            .phases
            .values()
            .filter(|r| r.status == PhaseStatus::Completed)
            .count(),
        run_finished: replayed.is_finished(),
    };
    if report.last_seq > 0 {
        tracing::info!(
            deployment_id = %replayed.deployment_id,
            last_seq = report.last_seq,
            phases = report.phases_restored,
            nodes = report.nodes_restored,
            completed_phases = report.completed_phases,
            run_finished = report.run_finished,
            "restored run from checkpoint log"
        );
    }
    report
}
