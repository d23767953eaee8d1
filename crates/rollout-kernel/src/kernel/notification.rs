//! Lifecycle notifications for external observers.
//!
//! Delivery is best effort: a sink must never block the caller or fail the run.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::kernel::identity::{DeploymentId, NodeId, PhaseName};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum LifecycleEvent {
    PhaseStarted {
        deployment_id: DeploymentId,
        phase: PhaseName,
        nodes: usize,
    },
    PhaseCompleted {
        deployment_id: DeploymentId,
        phase: PhaseName,
    },
    PhaseAborted {
        deployment_id: DeploymentId,
        phase: PhaseName,
        reason: String,
        failure_rate: f64,
    },
    PhaseSkipped {
        deployment_id: DeploymentId,
        phase: PhaseName,
        reason: String,
    },
    NodeFailed {
        deployment_id: DeploymentId,
        phase: PhaseName,
        node_id: NodeId,
        error: String,
    },
    RunCompleted {
        deployment_id: DeploymentId,
    },
    RunAborted {
        deployment_id: DeploymentId,
        reason: String,
    },
}

impl LifecycleEvent {
    pub fn deployment_id(&self) -> &str {
        match self {
            LifecycleEvent::PhaseStarted { deployment_id, .. }
            | LifecycleEvent::PhaseCompleted { deployment_id, .. }
            | LifecycleEvent::PhaseAborted { deployment_id, .. }
            | LifecycleEvent::PhaseSkipped { deployment_id, .. }
            | LifecycleEvent::NodeFailed { deployment_id, .. }
            | LifecycleEvent::RunCompleted { deployment_id }
            | LifecycleEvent::RunAborted { deployment_id, .. } => deployment_id,
        }
    }

    pub fn phase(&self) -> Option<&str> {
        match self {
            LifecycleEvent::PhaseStarted { phase, .. }
            | LifecycleEvent::PhaseCompleted { phase, .. }
            | LifecycleEvent::PhaseAborted { phase, .. }
            | LifecycleEvent::PhaseSkipped { phase, .. }
            | LifecycleEvent::NodeFailed { phase, .. } => Some(phase),
            LifecycleEvent::RunCompleted { .. } | LifecycleEvent::RunAborted { .. } => None,
        }
    }
}

/// Receives lifecycle events. Implementations must return promptly.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &LifecycleEvent);
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotificationSink;

impl NotificationSink for NoopNotificationSink {
    fn notify(&self, _event: &LifecycleEvent) {}
}

/// Keeps every event in memory; intended for tests.
#[derive(Debug, Default)]
pub struct CollectingNotificationSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl CollectingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl NotificationSink for CollectingNotificationSink {
    fn notify(&self, event: &LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = CollectingNotificationSink::new();
        sink.notify(&LifecycleEvent::PhaseStarted {
            deployment_id: "d".into(),
            phase: "db".into(),
            nodes: 2,
        });
        sink.notify(&LifecycleEvent::RunCompleted {
            deployment_id: "d".into(),
        });
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase(), Some("db"));
        assert_eq!(events[1].phase(), None);
        assert_eq!(events[1].deployment_id(), "d");
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(LifecycleEvent::NodeFailed {
            deployment_id: "d".into(),
            phase: "web".into(),
            node_id: "w-3".into(),
            error: "exit 1".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "NodeFailed");
        assert_eq!(json["node_id"], "w-3");
    }
}
