//! Coordinator controller: the top-level state machine of a run.
//!
//! Initializing (replay + restore) -> ValidatingPlan -> for each phase in dependency order
//! SchedulingPhase(n) -> AwaitingPhaseCompletion(n) -> Completed | Aborted, with Failed for fatal
//! errors. Phases run one at a time; `PhaseCompleted` is durable before any dependent starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rollout_kernel::{
    replay_run, CheckpointEvent, CheckpointLog, DependencyGraph, DeploymentPlan, LifecycleEvent,
    NewCheckpoint, NoopNotificationSink, NotificationSink, PhaseStatus, PlanLoader, RetryPolicy,
    RunOutcome,
};

use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::failure_policy::FailurePolicyEngine;
use crate::phase_executor::{AbortReason, PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::recovery;
use crate::registry::NodeRegistry;
use crate::slot::SlotManager;
use crate::status::{ControllerState, PhaseBoard, RunReport, StatusQuery};
use crate::task::TaskExecutor;

const DEPLOYMENT_TIMEOUT_REASON: &str = "deployment timeout";

/// Cancels the run token when the deployment deadline passes.
struct Deadline {
    expired: Arc<AtomicBool>,
    watchdog: Option<JoinHandle<()>>,
}

impl Deadline {
    fn start(limit: Option<Duration>, run_token: &CancellationToken) -> Self {
        let expired = Arc::new(AtomicBool::new(false));
        let watchdog = limit.map(|limit| {
            let expired = Arc::clone(&expired);
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        expired.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });
        Self { expired, watchdog }
    }

    fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

pub struct Coordinator {
    log: Arc<dyn CheckpointLog>,
    executor: Arc<dyn TaskExecutor>,
    sink: Arc<dyn NotificationSink>,
    registry: Arc<NodeRegistry>,
    slots: Arc<SlotManager>,
    failures: Arc<FailurePolicyEngine>,
    board: Arc<PhaseBoard>,
    retry: RetryPolicy,
    /// Token for the current (or next) run.
    cancel: Mutex<CancellationToken>,
}

impl Coordinator {
    pub fn new(
        log: Arc<dyn CheckpointLog>,
        executor: Arc<dyn TaskExecutor>,
        config: &CoordinatorConfig,
    ) -> Self {
        let retry = config.retry_policy();
        Self {
            log,
            executor,
            sink: Arc::new(NoopNotificationSink),
            registry: Arc::new(NodeRegistry::new(retry.max_retries)),
            slots: Arc::new(SlotManager::new()),
            failures: Arc::new(FailurePolicyEngine::new(config.failure_config())),
            board: Arc::new(PhaseBoard::new()),
            retry,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Installs a bounded channel sink sized by `notify_buffer` and returns its receiver.
    pub fn with_channel_sink(self, config: &CoordinatorConfig) -> (Self, mpsc::Receiver<LifecycleEvent>) {
        let (sink, rx) = config.notification_channel();
        (self.with_sink(Arc::new(sink)), rx)
    }

    /// Fleet membership; register nodes here before running plans with selector targets.
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn status(&self) -> StatusQuery {
        StatusQuery::new(Arc::clone(&self.registry), Arc::clone(&self.board))
    }

    /// Cancelling this token aborts the current (or next) run with reason "run cancelled".
    /// Once that run has finished, later runs get a fresh token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    pub async fn run_from(&self, loader: &dyn PlanLoader) -> Result<RunReport, CoordinatorError> {
        let plan = loader.load().map_err(|e| {
            error!(error = %e, "plan loader failed");
            self.board.set_state(ControllerState::Failed);
            CoordinatorError::from(e)
        })?;
        self.run(&plan).await
    }

    /// Runs (or resumes) `plan`. Returns the report for `Completed` and `Aborted` runs; fatal
    /// errors leave the controller `Failed` and are returned as `Err`.
    pub async fn run(&self, plan: &DeploymentPlan) -> Result<RunReport, CoordinatorError> {
        let result = self.drive(plan).await;
        {
            let mut cancel = self.cancel.lock();
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
        }
        match result {
            Ok(report) => Ok(report),
            Err(err) => {
                error!(deployment_id = %plan.id, error = %err, "run failed");
                self.resync(&plan.id);
                self.board.set_state(ControllerState::Failed);
                Err(err)
            }
        }
    }

    /// Rebuilds registry and phase table from the log after a fatal error, dropping any
    /// in-memory state whose checkpoint never landed.
    fn resync(&self, deployment_id: &str) {
        let replayed = match replay_run(self.log.as_ref(), deployment_id) {
            Ok(replayed) => replayed,
            Err(e) => {
                warn!(deployment_id, error = %e, "replay after failure failed; live state may be ahead of the log");
                return;
            }
        };
        let order = self.board.order();
        self.board.reset(deployment_id);
        self.registry.clear_states();
        recovery::restore(&replayed, &self.registry, &self.board);
        if !order.is_empty() {
            self.board.set_order(order);
        }
    }

    async fn drive(&self, plan: &DeploymentPlan) -> Result<RunReport, CoordinatorError> {
        self.board.reset(&plan.id);
        self.registry.clear_states();
        self.failures.reset();
        self.slots.reset();
        self.board.set_state(ControllerState::Initializing);
        let replayed = replay_run(self.log.as_ref(), &plan.id)?;
        let recovered = recovery::restore(&replayed, &self.registry, &self.board);
        if let Some(outcome) = &replayed.run_status {
            info!(deployment_id = %plan.id, last_seq = recovered.last_seq, "run already finished; reporting");
            match DependencyGraph::build(plan) {
                Ok(graph) => self.board.set_order(graph.order()),
                Err(e) => warn!(deployment_id = %plan.id, error = %e, "finished run's plan no longer validates; phases reported by name"),
            }
            self.board.set_state(match outcome {
                RunOutcome::Completed => ControllerState::Completed,
                RunOutcome::Aborted { .. } => ControllerState::Aborted,
            });
            return Ok(self.status().report());
        }

        self.board.set_state(ControllerState::ValidatingPlan);
        let graph = DependencyGraph::build(plan)?;
        let order = graph.order();
        self.board.set_order(order.clone());
        info!(deployment_id = %plan.id, phases = ?order, "plan validated");

        let run_token = self.cancel.lock().child_token();
        let deadline = Deadline::start(plan.timeout(), &run_token);
        let executor = PhaseExecutor::new(PhaseContext {
            deployment_id: plan.id.clone(),
            registry: Arc::clone(&self.registry),
            slots: Arc::clone(&self.slots),
            failures: Arc::clone(&self.failures),
            log: Arc::clone(&self.log),
            executor: Arc::clone(&self.executor),
            sink: Arc::clone(&self.sink),
            retry: self.retry.clone(),
        });

        for (n, name) in order.iter().enumerate() {
            self.board.set_state(ControllerState::SchedulingPhase(n));
            let Some(spec) = plan.phase(name) else {
                continue;
            };

            match self.board.phase_status(name) {
                PhaseStatus::Completed | PhaseStatus::Skipped => continue,
                PhaseStatus::Aborted => {
                    // Crashed between PhaseAborted and RunAborted: finish the abort.
                    let record = self.board.record(name).unwrap_or_default();
                    let reason = record.abort_reason.unwrap_or_else(|| "aborted".to_string());
                    return self.finish_aborted(plan, &graph, name, &reason, None);
                }
                PhaseStatus::NotStarted | PhaseStatus::Running => {}
            }

            let blocked: Vec<String> = graph
                .dependencies(name)
                .into_iter()
                .filter(|dep| self.board.phase_status(dep).blocks_dependents())
                .collect();
            if !blocked.is_empty() {
                let reason = format!("dependency {} did not complete", blocked.join(", "));
                self.skip_phase(&plan.id, name, &reason)?;
                continue;
            }

            let nodes = match self.board.record(name) {
                Some(record) if record.status == PhaseStatus::Running => {
                    info!(deployment_id = %plan.id, phase = %name, nodes = record.nodes.len(), "resuming phase");
                    record.nodes
                }
                _ => {
                    let nodes = self.registry.resolve(&spec.target);
                    self.append(NewCheckpoint::phase(
                        plan.id.clone(),
                        name.clone(),
                        CheckpointEvent::PhaseStarted {
                            nodes: nodes.clone(),
                        },
                    ))?;
                    self.board.mark_started(name, nodes.clone());
                    self.sink.notify(&LifecycleEvent::PhaseStarted {
                        deployment_id: plan.id.clone(),
                        phase: name.clone(),
                        nodes: nodes.len(),
                    });
                    info!(deployment_id = %plan.id, phase = %name, nodes = nodes.len(), "phase started");
                    nodes
                }
            };

            self.board.set_state(ControllerState::AwaitingPhaseCompletion(n));
            let threshold = plan.threshold_for(spec);
            match executor.run(spec, &nodes, threshold, &run_token).await? {
                PhaseOutcome::Completed => {
                    self.append(NewCheckpoint::phase(
                        plan.id.clone(),
                        name.clone(),
                        CheckpointEvent::PhaseCompleted,
                    ))?;
                    self.board.mark_completed(name);
                    self.sink.notify(&LifecycleEvent::PhaseCompleted {
                        deployment_id: plan.id.clone(),
                        phase: name.clone(),
                    });
                    info!(deployment_id = %plan.id, phase = %name, "phase completed");
                }
                PhaseOutcome::Aborted {
                    reason,
                    failure_rate,
                } => {
                    let reason = if reason == AbortReason::RunCancelled && deadline.expired() {
                        DEPLOYMENT_TIMEOUT_REASON.to_string()
                    } else {
                        reason.to_string()
                    };
                    return self.finish_aborted(plan, &graph, name, &reason, Some(failure_rate));
                }
            }
        }

        self.append(NewCheckpoint::run(plan.id.clone(), CheckpointEvent::RunCompleted))?;
        self.board.set_outcome(RunOutcome::Completed);
        self.board.set_state(ControllerState::Completed);
        self.sink.notify(&LifecycleEvent::RunCompleted {
            deployment_id: plan.id.clone(),
        });
        info!(deployment_id = %plan.id, "run completed");
        Ok(self.status().report())
    }

    /// Records the phase abort (unless `failure_rate` is `None`, meaning it is already in the
    /// log), skips what can no longer run, and ends the run `Aborted`.
    fn finish_aborted(
        &self,
        plan: &DeploymentPlan,
        graph: &DependencyGraph,
        phase: &str,
        reason: &str,
        failure_rate: Option<f64>,
    ) -> Result<RunReport, CoordinatorError> {
        if let Some(failure_rate) = failure_rate {
            self.append(NewCheckpoint::phase(
                plan.id.clone(),
                phase,
                CheckpointEvent::PhaseAborted {
                    reason: reason.to_string(),
                    failure_rate,
                },
            ))?;
            self.board.mark_aborted(phase, reason, failure_rate);
            self.sink.notify(&LifecycleEvent::PhaseAborted {
                deployment_id: plan.id.clone(),
                phase: phase.to_string(),
                reason: reason.to_string(),
                failure_rate,
            });
            error!(deployment_id = %plan.id, phase, reason, failure_rate, "phase aborted");
        }

        let skipped_nodes = self.registry.skip_remaining(phase);
        if !skipped_nodes.is_empty() {
            warn!(deployment_id = %plan.id, phase, skipped = skipped_nodes.len(), "nodes skipped");
        }
        let dependent_reason = format!("dependency {phase} aborted");
        for dependent in graph.transitive_dependents(phase) {
            if self.board.phase_status(&dependent) == PhaseStatus::NotStarted {
                self.skip_phase(&plan.id, &dependent, &dependent_reason)?;
            }
        }

        let run_reason = format!("phase {phase} aborted: {reason}");
        self.append(NewCheckpoint::run(
            plan.id.clone(),
            CheckpointEvent::RunAborted {
                reason: run_reason.clone(),
            },
        ))?;
        self.board.set_outcome(RunOutcome::Aborted {
            reason: run_reason.clone(),
        });
        self.board.set_state(ControllerState::Aborted);
        self.sink.notify(&LifecycleEvent::RunAborted {
            deployment_id: plan.id.clone(),
            reason: run_reason,
        });
        error!(deployment_id = %plan.id, phase, "run aborted");
        Ok(self.status().report())
    }

    fn skip_phase(&self, deployment_id: &str, phase: &str, reason: &str) -> Result<(), CoordinatorError> {
        self.append(NewCheckpoint::phase(
            deployment_id,
            phase,
            CheckpointEvent::PhaseSkipped {
                reason: reason.to_string(),
            },
        ))?;
        self.board.mark_skipped(phase, reason);
        self.sink.notify(&LifecycleEvent::PhaseSkipped {
            deployment_id: deployment_id.to_string(),
            phase: phase.to_string(),
            reason: reason.to_string(),
        });
        warn!(deployment_id, phase, reason, "phase skipped");
        Ok(())
    }

    fn append(&self, checkpoint: NewCheckpoint) -> Result<(), CoordinatorError> {
        let kind = checkpoint.event.kind();
        match self.log.append(checkpoint) {
            Ok(stored) => {
                tracing::debug!(deployment_id = %stored.deployment_id, seq = stored.seq, kind, "checkpoint appended");
                Ok(())
            }
            Err(e) => {
                error!(kind, error = %e, "checkpoint append failed");
                Err(e.into())
            }
        }
    }
}
