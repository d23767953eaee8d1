//! Phase executor: drives one phase across its node set.
//!
//! One worker task per non-terminal node. A worker queues its node, acquires a slot, invokes the
//! task executor, and retries with backoff until the node succeeds or its retries run out. The
//! terminal result is checkpointed before it is reported to the failure policy. An abort decision
//! or the phase timeout cancels the phase token: in-flight invocations are recorded as failed and
//! nodes that never started stay queued for the controller to skip.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rollout_kernel::{
    Checkpoint, CheckpointEvent, CheckpointLog, DeploymentId, LifecycleEvent, NewCheckpoint, NodeId,
    NodeState, NodeStatus, NotificationSink, PhaseSpec, RetryPolicy,
};

use crate::error::CoordinatorError;
use crate::failure_policy::{Decision, FailurePolicyEngine};
use crate::registry::NodeRegistry;
use crate::slot::{SlotError, SlotManager};
use crate::task::{TaskExecutor, TaskResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    FailureThreshold,
    /// Every node reported, the breaker held, but not every node succeeded.
    NodeFailures,
    PhaseTimeout,
    RunCancelled,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::FailureThreshold => "failure threshold exceeded",
            AbortReason::NodeFailures => "node failures",
            AbortReason::PhaseTimeout => "phase timeout",
            AbortReason::RunCancelled => "run cancelled",
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PhaseOutcome {
    Completed,
    Aborted { reason: AbortReason, failure_rate: f64 },
}

/// Collaborators shared by every worker of a run.
#[derive(Clone)]
pub struct PhaseContext {
    pub deployment_id: DeploymentId,
    pub registry: Arc<NodeRegistry>,
    pub slots: Arc<SlotManager>,
    pub failures: Arc<FailurePolicyEngine>,
    pub log: Arc<dyn CheckpointLog>,
    pub executor: Arc<dyn TaskExecutor>,
    pub sink: Arc<dyn NotificationSink>,
    pub retry: RetryPolicy,
}

impl PhaseContext {
    fn append(&self, checkpoint: NewCheckpoint) -> Result<Checkpoint, CoordinatorError> {
        let kind = checkpoint.event.kind();
        self.log.append(checkpoint).map_err(|e| {
            error!(deployment_id = %self.deployment_id, kind, error = %e, "checkpoint append failed");
            CoordinatorError::from(e)
        })
    }
}

pub struct PhaseExecutor {
    ctx: PhaseContext,
}

impl PhaseExecutor {
    pub fn new(ctx: PhaseContext) -> Self {
        Self { ctx }
    }

    /// Runs `spec` over `nodes` until every node is terminal or the phase is cancelled.
    /// Nodes already terminal in the registry are not executed again.
    pub async fn run(
        &self,
        spec: &PhaseSpec,
        nodes: &[NodeId],
        threshold: f64,
        run_token: &CancellationToken,
    ) -> Result<PhaseOutcome, CoordinatorError> {
        let ctx = &self.ctx;
        let phase = spec.name.as_str();

        ctx.registry.begin_phase(phase, nodes);
        if ctx.failures.register_phase(phase, nodes.len(), threshold) {
            let replayed = ctx.registry.nodes(phase).into_iter().filter_map(|n| match n.status {
                NodeStatus::Succeeded => Some((n.node_id, true)),
                NodeStatus::Failed if n.failure_final => Some((n.node_id, false)),
                _ => None,
            });
            ctx.failures.seed(phase, replayed);
        }
        if ctx.failures.is_aborted(phase) {
            return Ok(self.aborted(phase, AbortReason::FailureThreshold));
        }

        let phase_token = run_token.child_token();
        let shared_spec = Arc::new(spec.clone());
        let mut workers = JoinSet::new();
        for node in nodes {
            let terminal = ctx
                .registry
                .get(node, phase)
                .map(|s| s.is_terminal())
                .unwrap_or(false);
            if terminal {
                continue;
            }
            let worker = NodeWorker {
                ctx: ctx.clone(),
                spec: Arc::clone(&shared_spec),
                node: node.clone(),
                token: phase_token.clone(),
            };
            workers.spawn(worker.run());
        }
        info!(
            deployment_id = %ctx.deployment_id,
            phase,
            nodes = nodes.len(),
            scheduled = workers.len(),
            concurrency = spec.concurrency,
            "phase executing"
        );

        let mut timed_out = false;
        let drain = drain_workers(&mut workers, &phase_token);
        tokio::pin!(drain);
        let fatal = match spec.phase_timeout() {
            Some(limit) => tokio::select! {
                fatal = &mut drain => fatal,
                _ = tokio::time::sleep(limit) => {
                    timed_out = true;
                    warn!(deployment_id = %ctx.deployment_id, phase, timeout_ms = limit.as_millis() as u64, "phase timed out; cancelling");
                    phase_token.cancel();
                    (&mut drain).await
                }
            },
            None => drain.await,
        };
        if let Some(err) = fatal {
            return Err(err);
        }

        let reason = if run_token.is_cancelled() {
            Some(AbortReason::RunCancelled)
        } else if timed_out {
            Some(AbortReason::PhaseTimeout)
        } else if ctx.failures.is_aborted(phase) {
            Some(AbortReason::FailureThreshold)
        } else {
            None
        };
        if let Some(reason) = reason {
            return Ok(self.aborted(phase, reason));
        }

        let snapshot = ctx.registry.snapshot(phase);
        if snapshot.succeeded == snapshot.total {
            Ok(PhaseOutcome::Completed)
        } else {
            Ok(self.aborted(phase, AbortReason::NodeFailures))
        }
    }

    fn aborted(&self, phase: &str, reason: AbortReason) -> PhaseOutcome {
        let snapshot_rate = self.ctx.registry.snapshot(phase).failure_rate;
        let failure_rate = match reason {
            AbortReason::FailureThreshold => self
                .ctx
                .failures
                .stats(phase)
                .and_then(|s| s.rate_at_abort)
                .unwrap_or(snapshot_rate),
            _ => snapshot_rate,
        };
        PhaseOutcome::Aborted {
            reason,
            failure_rate,
        }
    }
}

/// Joins every worker. The first fatal error cancels the phase; the rest are still awaited.
async fn drain_workers(
    workers: &mut JoinSet<Result<(), CoordinatorError>>,
    phase_token: &CancellationToken,
) -> Option<CoordinatorError> {
    let mut fatal = None;
    while let Some(joined) = workers.join_next().await {
        let result = joined.map_err(CoordinatorError::from).and_then(|r| r);
        if let Err(err) = result {
            if fatal.is_none() {
                error!(error = %err, "phase worker failed; cancelling phase");
                phase_token.cancel();
                fatal = Some(err);
            }
        }
    }
    fatal
}

enum Attempt {
    Finished(TaskResult),
    Cancelled,
}

struct NodeWorker {
    ctx: PhaseContext,
    spec: Arc<PhaseSpec>,
    node: NodeId,
    token: CancellationToken,
}

impl NodeWorker {
    async fn run(self) -> Result<(), CoordinatorError> {
        let phase = self.spec.name.as_str();
        let node = self.node.as_str();
        if self.token.is_cancelled() {
            return Ok(());
        }
        self.ctx
            .registry
            .set_status(node, phase, NodeStatus::Queued, None)?;

        loop {
            let slot = match self
                .ctx
                .slots
                .acquire_with(phase, node, self.spec.concurrency, &self.token, None)
                .await
            {
                Ok(slot) => slot,
                Err(SlotError::Cancelled { .. }) => {
                    let retried = self
                        .ctx
                        .registry
                        .get(node, phase)
                        .map(|s| s.retry_count > 0)
                        .unwrap_or(false);
                    if !retried {
                        debug!(phase, node, "phase cancelled before node started");
                        return Ok(());
                    }
                    let state = self
                        .ctx
                        .registry
                        .finalize_failed(node, phase, "cancelled before retry")?;
                    return self.report_failure(state);
                }
                Err(err) => return Err(err.into()),
            };

            let attempt = match self
                .ctx
                .registry
                .set_status(node, phase, NodeStatus::Executing, None)
            {
                Ok(_) => self.attempt().await,
                Err(err) => {
                    self.ctx.slots.release(&slot);
                    return Err(err.into());
                }
            };
            self.ctx.slots.release(&slot);

            match attempt {
                Attempt::Cancelled => {
                    let state = self.ctx.registry.finalize_failed(node, phase, "cancelled")?;
                    return self.report_failure(state);
                }
                Attempt::Finished(TaskResult::Success) => {
                    // Durable first: the registry never shows a success the log does not hold.
                    let attempts = self
                        .ctx
                        .registry
                        .get(node, phase)
                        .map(|s| s.attempts())
                        .unwrap_or(1);
                    self.ctx.append(NewCheckpoint::node(
                        self.ctx.deployment_id.clone(),
                        phase,
                        node,
                        CheckpointEvent::NodeSucceeded { attempts },
                    ))?;
                    let state = self
                        .ctx
                        .registry
                        .set_status(node, phase, NodeStatus::Succeeded, None)?;
                    debug!(phase, node, attempts = state.attempts(), "node succeeded");
                    if self.ctx.failures.record_outcome(phase, node, true) == Decision::Abort {
                        self.token.cancel();
                    }
                    return Ok(());
                }
                Attempt::Finished(result) => {
                    let error = result.error_message().unwrap_or_default();
                    let state = self.ctx.registry.set_status(
                        node,
                        phase,
                        NodeStatus::Failed,
                        Some(error.clone()),
                    )?;
                    if state.failure_final {
                        return self.report_failure(state);
                    }

                    let delay = self.ctx.retry.delay(state.retry_count);
                    warn!(
                        deployment_id = %self.ctx.deployment_id,
                        phase,
                        node,
                        attempt = state.attempts(),
                        error = %error,
                        retry_in_ms = delay.as_millis() as u64,
                        "node attempt failed; retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => {
                            let state = self.ctx.registry.finalize_failed(
                                node,
                                phase,
                                format!("cancelled during retry backoff: {error}"),
                            )?;
                            return self.report_failure(state);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.ctx
                        .registry
                        .set_status(node, phase, NodeStatus::Queued, None)?;
                }
            }
        }
    }

    async fn attempt(&self) -> Attempt {
        let timeout = self.spec.node_timeout_duration();
        let invocation =
            self.ctx
                .executor
                .execute(&self.node, &self.spec.task, timeout, self.token.child_token());
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Attempt::Cancelled,
            result = tokio::time::timeout(timeout, invocation) => match result {
                Ok(result) => Attempt::Finished(result),
                Err(_) => Attempt::Finished(TaskResult::Timeout),
            },
        }
    }

    /// Checkpoints a terminal failure, notifies, then feeds the breaker.
    fn report_failure(&self, state: NodeState) -> Result<(), CoordinatorError> {
        let phase = self.spec.name.as_str();
        let error = state.last_error.clone().unwrap_or_default();
        self.ctx.append(NewCheckpoint::node(
            self.ctx.deployment_id.clone(),
            phase,
            self.node.clone(),
            CheckpointEvent::NodeFailed {
                error: error.clone(),
                attempts: state.attempts(),
            },
        ))?;
        warn!(
            deployment_id = %self.ctx.deployment_id,
            phase,
            node = %self.node,
            attempts = state.attempts(),
            error = %error,
            "node failed"
        );
        self.ctx.sink.notify(&LifecycleEvent::NodeFailed {
            deployment_id: self.ctx.deployment_id.clone(),
            phase: phase.to_string(),
            node_id: self.node.clone(),
            error,
        });
        if self.ctx.failures.record_outcome(phase, &self.node, false) == Decision::Abort {
            self.token.cancel();
        }
        Ok(())
    }
}
