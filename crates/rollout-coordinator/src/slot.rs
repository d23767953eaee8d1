//! Per-phase concurrency slots.
//!
//! A counting semaphore per phase; a [Slot] holds one permit until it is released.
//! Constraints: outstanding slots for a phase never exceed its limit, and releasing a slot twice
//! is a logged no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use rollout_kernel::{NodeId, PhaseName};

/// Capacity token for one node executing within a phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    pub id: u64,
    pub phase: PhaseName,
    pub node_id: NodeId,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    DoubleRelease,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("slot acquisition for node {node} in phase {phase} was cancelled")]
    Cancelled { phase: PhaseName, node: NodeId },
    #[error("slot acquisition for node {node} in phase {phase} timed out")]
    TimedOut { phase: PhaseName, node: NodeId },
    #[error("phase {phase} concurrency limit must be at least 1")]
    InvalidLimit { phase: PhaseName },
    #[error("phase {phase} already has limit {existing}, requested {requested}")]
    LimitMismatch {
        phase: PhaseName,
        existing: usize,
        requested: usize,
    },
    #[error("slot pool for phase {phase} is closed")]
    Closed { phase: PhaseName },
}

struct PhaseSlots {
    semaphore: Arc<Semaphore>,
    limit: usize,
    outstanding: HashMap<u64, OwnedSemaphorePermit>,
}

#[derive(Default)]
pub struct SlotManager {
    phases: Mutex<HashMap<PhaseName, PhaseSlots>>,
    next_id: AtomicU64,
}

impl SlotManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets every phase and drops any permits still outstanding.
    pub fn reset(&self) {
        self.phases.lock().clear();
    }

    /// Waits until the phase has capacity.
    pub async fn acquire(&self, phase: &str, node: &str, limit: usize) -> Result<Slot, SlotError> {
        self.acquire_with(phase, node, limit, &CancellationToken::new(), None)
            .await
    }

    /// Waits for capacity, giving up when `cancel` fires or `timeout` elapses.
    pub async fn acquire_with(
        &self,
        phase: &str,
        node: &str,
        limit: usize,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Slot, SlotError> {
        if limit == 0 {
            return Err(SlotError::InvalidLimit {
                phase: phase.to_string(),
            });
        }
        let semaphore = {
            let mut phases = self.phases.lock();
            let entry = phases.entry(phase.to_string()).or_insert_with(|| PhaseSlots {
                semaphore: Arc::new(Semaphore::new(limit)),
                limit,
                outstanding: HashMap::new(),
            });
            if entry.limit != limit {
                return Err(SlotError::LimitMismatch {
                    phase: phase.to_string(),
                    existing: entry.limit,
                    requested: limit,
                });
            }
            Arc::clone(&entry.semaphore)
        };

        let closed = || SlotError::Closed {
            phase: phase.to_string(),
        };
        let wait = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, Arc::clone(&semaphore).acquire_owned())
                    .await
                    .map_err(|_| SlotError::TimedOut {
                        phase: phase.to_string(),
                        node: node.to_string(),
                    })?
                    .map_err(|_| closed()),
                None => Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| closed()),
            }
        };
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(SlotError::Cancelled {
                    phase: phase.to_string(),
                    node: node.to_string(),
                });
            }
            permit = wait => permit?,
        };

        let slot = Slot {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            phase: phase.to_string(),
            node_id: node.to_string(),
            acquired_at: Utc::now(),
        };
        let mut phases = self.phases.lock();
        match phases.get_mut(phase) {
            Some(entry) => {
                entry.outstanding.insert(slot.id, permit);
            }
            // Pool was dropped while waiting; the permit is returned on drop.
            None => return Err(closed()),
        }
        tracing::trace!(phase, node, slot_id = slot.id, "slot acquired");
        Ok(slot)
    }

    pub fn release(&self, slot: &Slot) -> ReleaseOutcome {
        let permit = self
            .phases
            .lock()
            .get_mut(&slot.phase)
            .and_then(|entry| entry.outstanding.remove(&slot.id));
        match permit {
            Some(permit) => {
                drop(permit);
                ReleaseOutcome::Released
            }
            None => {
                tracing::warn!(
                    phase = %slot.phase,
                    node = %slot.node_id,
                    slot_id = slot.id,
                    "slot released twice; ignoring"
                );
                ReleaseOutcome::DoubleRelease
            }
        }
    }

    pub fn outstanding(&self, phase: &str) -> usize {
        self.phases
            .lock()
            .get(phase)
            .map(|entry| entry.outstanding.len())
            .unwrap_or(0)
    }

    pub fn limit(&self, phase: &str) -> Option<usize> {
        self.phases.lock().get(phase).map(|entry| entry.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_respects_limit_and_release_frees_capacity() {
        let slots = SlotManager::new();
        let a = slots.acquire("web", "w1", 2).await.unwrap();
        let _b = slots.acquire("web", "w2", 2).await.unwrap();
        assert_eq!(slots.outstanding("web"), 2);

        let blocked = slots
            .acquire_with("web", "w3", 2, &CancellationToken::new(), Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(blocked, Err(SlotError::TimedOut { .. })));

        assert_eq!(slots.release(&a), ReleaseOutcome::Released);
        let c = slots.acquire("web", "w3", 2).await.unwrap();
        assert_eq!(c.node_id, "w3");
        assert_eq!(slots.outstanding("web"), 2);
    }

    #[tokio::test]
    async fn double_release_is_a_noop() {
        let slots = SlotManager::new();
        let s = slots.acquire("db", "d1", 1).await.unwrap();
        assert_eq!(slots.release(&s), ReleaseOutcome::Released);
        assert_eq!(slots.release(&s), ReleaseOutcome::DoubleRelease);
        assert_eq!(slots.outstanding("db"), 0);
        slots.acquire("db", "d2", 1).await.unwrap();
        assert_eq!(slots.outstanding("db"), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_returns_cancelled() {
        let slots = Arc::new(SlotManager::new());
        let _held = slots.acquire("app", "a1", 1).await.unwrap();
        let token = CancellationToken::new();
        let waiter = {
            let slots = Arc::clone(&slots);
            let token = token.clone();
            tokio::spawn(async move { slots.acquire_with("app", "a2", 1, &token, None).await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SlotError::Cancelled { .. })));
        assert_eq!(slots.outstanding("app"), 1);
    }

    #[tokio::test]
    async fn invalid_and_mismatched_limits() {
        let slots = SlotManager::new();
        assert!(matches!(
            slots.acquire("web", "w1", 0).await,
            Err(SlotError::InvalidLimit { .. })
        ));
        slots.acquire("web", "w1", 3).await.unwrap();
        assert!(matches!(
            slots.acquire("web", "w2", 4).await,
            Err(SlotError::LimitMismatch { existing: 3, .. })
        ));
        assert_eq!(slots.limit("web"), Some(3));
    }
}
