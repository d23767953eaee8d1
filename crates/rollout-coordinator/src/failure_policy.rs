//! Failure policy engine: per-phase failure rate and the abort circuit breaker.
//!
//! Constraints: the breaker is a one-way latch per phase; it is only evaluated once the
//! minimum sample guard is met; an outcome reported twice for the same node counts once.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use rollout_kernel::{NodeId, PhaseName};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Abort,
}

/// Minimum-sample guard settings.
#[derive(Clone, Debug, PartialEq)]
pub struct FailurePolicyConfig {
    pub min_samples: usize,
    pub min_sample_ratio: f64,
}

impl Default for FailurePolicyConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            min_sample_ratio: 0.05,
        }
    }
}

impl FailurePolicyConfig {
    /// Outcomes required before the breaker is evaluated: `max(min_samples,
    /// ceil(ratio * total))`, capped at `total` so small phases are still judged.
    pub fn guard(&self, total: usize) -> usize {
        let by_ratio = (self.min_sample_ratio * total as f64).ceil() as usize;
        self.min_samples.max(by_ratio).min(total)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PhaseFailureStats {
    pub total: usize,
    pub threshold: f64,
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: bool,
    pub rate_at_abort: Option<f64>,
}

impl PhaseFailureStats {
    pub fn observed(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn failure_rate(&self) -> f64 {
        rollout_kernel::state::failure_rate(self.succeeded, self.failed)
    }
}

struct PhaseCounters {
    stats: PhaseFailureStats,
    seen: HashSet<NodeId>,
}

pub struct FailurePolicyEngine {
    config: FailurePolicyConfig,
    phases: Mutex<HashMap<PhaseName, PhaseCounters>>,
}

impl FailurePolicyEngine {
    pub fn new(config: FailurePolicyConfig) -> Self {
        Self {
            config,
            phases: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FailurePolicyConfig {
        &self.config
    }

    /// Starts tracking a phase. Returns false if it was already tracked (counters kept).
    pub fn register_phase(&self, phase: &str, total: usize, threshold: f64) -> bool {
        let mut phases = self.phases.lock();
        if phases.contains_key(phase) {
            return false;
        }
        phases.insert(
            phase.to_string(),
            PhaseCounters {
                stats: PhaseFailureStats {
                    total,
                    threshold,
                    succeeded: 0,
                    failed: 0,
                    aborted: false,
                    rate_at_abort: None,
                },
                seen: HashSet::new(),
            },
        );
        true
    }

    /// Restores counters from replayed outcomes, then evaluates the breaker once.
    pub fn seed<I>(&self, phase: &str, outcomes: I) -> Decision
    where
        I: IntoIterator<Item = (NodeId, bool)>,
    {
        let mut phases = self.phases.lock();
        let Some(counters) = phases.get_mut(phase) else {
            return Decision::Continue;
        };
        for (node, succeeded) in outcomes {
            if counters.seen.insert(node) {
                count(&mut counters.stats, succeeded);
            }
        }
        self.evaluate(phase, &mut counters.stats)
    }

    pub fn record_outcome(&self, phase: &str, node: &str, succeeded: bool) -> Decision {
        let mut phases = self.phases.lock();
        let Some(counters) = phases.get_mut(phase) else {
            tracing::warn!(phase, node, "outcome for untracked phase ignored");
            return Decision::Continue;
        };
        if !counters.seen.insert(node.to_string()) {
            tracing::debug!(phase, node, "duplicate outcome ignored");
            return latched(&counters.stats);
        }
        count(&mut counters.stats, succeeded);
        self.evaluate(phase, &mut counters.stats)
    }

    pub fn stats(&self, phase: &str) -> Option<PhaseFailureStats> {
        self.phases.lock().get(phase).map(|c| c.stats.clone())
    }

    pub fn reset(&self) {
        self.phases.lock().clear();
    }

    pub fn is_aborted(&self, phase: &str) -> bool {
        self.phases
            .lock()
            .get(phase)
            .map(|c| c.stats.aborted)
            .unwrap_or(false)
    }

    fn evaluate(&self, phase: &str, stats: &mut PhaseFailureStats) -> Decision {
        if stats.aborted {
            return Decision::Abort;
        }
        let guard = self.config.guard(stats.total);
        let rate = stats.failure_rate();
        if stats.observed() >= guard && rate > stats.threshold {
            stats.aborted = true;
            stats.rate_at_abort = Some(rate);
            tracing::error!(
                phase,
                failure_rate = rate,
                threshold = stats.threshold,
                succeeded = stats.succeeded,
                failed = stats.failed,
                "failure threshold exceeded; tripping circuit breaker"
            );
            return Decision::Abort;
        }
        Decision::Continue
    }
}

fn count(stats: &mut PhaseFailureStats, succeeded: bool) {
    if succeeded {
        stats.succeeded += 1;
    } else {
        stats.failed += 1;
    }
}

fn latched(stats: &PhaseFailureStats) -> Decision {
    if stats.aborted {
        Decision::Abort
    } else {
        Decision::Continue
    }
}
