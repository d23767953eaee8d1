//! End-to-end rollout scenarios against the in-memory checkpoint log.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use rollout_coordinator::{
    ChannelNotificationSink, ControllerState, Coordinator, CoordinatorConfig, CoordinatorError,
    RunStatus, TaskExecutor, TaskResult,
};
use rollout_kernel::{
    run_timeline, Checkpoint, CheckpointEvent, CheckpointLog, DeploymentPlan, InMemoryCheckpointLog,
    KernelError, LifecycleEvent, NewCheckpoint, NodeId, NodeStatus, PhaseSpec, PhaseStatus, PlanError,
    RunStatusSummary, Seq, TaskSpec,
};

/// Fleet stand-in: nodes in `failing` always fail, nodes in `hanging` block until cancelled.
#[derive(Default)]
struct FleetExecutor {
    failing: HashSet<NodeId>,
    hanging: HashSet<NodeId>,
    executed: Mutex<Vec<NodeId>>,
}

impl FleetExecutor {
    fn failing<I: IntoIterator<Item = &'static str>>(nodes: I) -> Self {
        Self {
            failing: nodes.into_iter().map(String::from).collect(),
            ..Self::default()
        }
    }

    fn hanging<I: IntoIterator<Item = &'static str>>(nodes: I) -> Self {
        Self {
            hanging: nodes.into_iter().map(String::from).collect(),
            ..Self::default()
        }
    }

    fn executed(&self) -> Vec<NodeId> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl TaskExecutor for FleetExecutor {
    async fn execute(
        &self,
        node: &NodeId,
        _task: &TaskSpec,
        _timeout: Duration,
        cancel: CancellationToken,
    ) -> TaskResult {
        self.executed.lock().push(node.clone());
        if self.hanging.contains(node) {
            cancel.cancelled().await;
            return TaskResult::Failure("interrupted".into());
        }
        tokio::task::yield_now().await;
        if self.failing.contains(node) {
            TaskResult::Failure(format!("{node}: health check failed"))
        } else {
            TaskResult::Success
        }
    }
}

/// Accepts `allowed` appends, then fails every write like a full disk.
struct FlakyLog {
    inner: Arc<InMemoryCheckpointLog>,
    allowed: usize,
    appended: AtomicUsize,
}

impl CheckpointLog for FlakyLog {
    fn append(&self, checkpoint: NewCheckpoint) -> Result<Checkpoint, KernelError> {
        if self.appended.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(KernelError::CheckpointLog("disk full".into()));
        }
        self.inner.append(checkpoint)
    }

    fn scan(&self, deployment_id: &str, from: Seq) -> Result<Vec<Checkpoint>, KernelError> {
        self.inner.scan(deployment_id, from)
    }

    fn head(&self, deployment_id: &str) -> Result<Seq, KernelError> {
        self.inner.head(deployment_id)
    }
}

fn deployment_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

fn kinds(log: &dyn CheckpointLog, deployment_id: &str) -> Vec<(String, Option<String>)> {
    log.scan(deployment_id, 1)
        .unwrap()
        .into_iter()
        .filter(|cp| cp.node_id.is_none())
        .map(|cp| (cp.event.kind().to_string(), cp.phase))
        .collect()
}

fn entry(kind: &str, phase: Option<&str>) -> (String, Option<String>) {
    (kind.to_string(), phase.map(String::from))
}

fn three_tier_plan(id: &str) -> DeploymentPlan {
    DeploymentPlan::new(id, 0.1)
        .with_phase(PhaseSpec::with_nodes("db", ["db-1", "db-2"]))
        .with_phase(
            PhaseSpec::with_nodes("app", ["app-1", "app-2", "app-3"])
                .depends_on("db")
                .concurrency(2),
        )
        .with_phase(
            PhaseSpec::with_nodes("web", (1..=5).map(|n| format!("web-{n}")))
                .depends_on("app")
                .concurrency(3),
        )
}

#[tokio::test]
async fn three_tier_rollout_completes_in_dependency_order() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let log = Arc::new(InMemoryCheckpointLog::new());
    let executor = Arc::new(FleetExecutor::default());
    let (sink, mut events) = ChannelNotificationSink::new(64);
    let coordinator = Coordinator::new(log.clone(), executor.clone(), &CoordinatorConfig::default())
        .with_sink(Arc::new(sink));
    let id = deployment_id("three-tier");

    let report = coordinator.run(&three_tier_plan(&id)).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.node_failures.is_empty());
    assert_eq!(
        report.phases.iter().map(|p| (p.phase.as_str(), p.status, p.succeeded)).collect::<Vec<_>>(),
        vec![
            ("db", PhaseStatus::Completed, 2),
            ("app", PhaseStatus::Completed, 3),
            ("web", PhaseStatus::Completed, 5),
        ]
    );
    assert_eq!(executor.executed().len(), 10);
    assert_eq!(
        kinds(log.as_ref(), &id),
        vec![
            entry("PhaseStarted", Some("db")),
            entry("PhaseCompleted", Some("db")),
            entry("PhaseStarted", Some("app")),
            entry("PhaseCompleted", Some("app")),
            entry("PhaseStarted", Some("web")),
            entry("PhaseCompleted", Some("web")),
            entry("RunCompleted", None),
        ]
    );
    assert_eq!(log.head(&id).unwrap(), 17);
    assert_eq!(coordinator.status().controller_state(), ControllerState::Completed);

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert_eq!(received.len(), 7);
    assert_eq!(
        received.last(),
        Some(&LifecycleEvent::RunCompleted {
            deployment_id: id.clone()
        })
    );
}

#[tokio::test]
async fn failure_threshold_aborts_phase_and_skips_dependents() {
    let log = Arc::new(InMemoryCheckpointLog::new());
    let web: Vec<String> = (1..=10).map(|n| format!("web-{n}")).collect();
    let executor = Arc::new(FleetExecutor {
        failing: web.iter().cloned().collect(),
        ..FleetExecutor::default()
    });
    let config = CoordinatorConfig {
        max_retries: 0,
        min_samples: 2,
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::new(log.clone(), executor.clone(), &config);
    let id = deployment_id("threshold");
    let plan = DeploymentPlan::new(&id, 0.2)
        .with_phase(PhaseSpec::with_nodes("web", web.clone()))
        .with_phase(PhaseSpec::with_nodes("cdn", ["edge-1"]).depends_on("web"))
        .with_phase(PhaseSpec::with_nodes("edge-cache", ["cache-1"]).depends_on("cdn"));

    let report = coordinator.run(&plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.aborted_phase.as_deref(), Some("web"));
    assert_eq!(report.abort_reason.as_deref(), Some("failure threshold exceeded"));
    assert_eq!(report.failure_rate_at_abort, Some(1.0));
    let web_state = &report.phases[0];
    assert!(web_state.failed >= 2);
    assert_eq!(web_state.succeeded, 0);
    assert_eq!(web_state.failed + web_state.skipped, 10);
    assert_eq!(report.node_failures.len(), web_state.failed);
    assert_eq!(report.phases[1].status, PhaseStatus::Skipped);
    assert_eq!(report.phases[2].status, PhaseStatus::Skipped);
    assert!(!executor.executed().iter().any(|n| n == "edge-1" || n == "cache-1"));

    assert_eq!(
        kinds(log.as_ref(), &id),
        vec![
            entry("PhaseStarted", Some("web")),
            entry("PhaseAborted", Some("web")),
            entry("PhaseSkipped", Some("cdn")),
            entry("PhaseSkipped", Some("edge-cache")),
            entry("RunAborted", None),
        ]
    );
    let timeline = run_timeline(log.as_ref(), &id).unwrap();
    assert_eq!(
        timeline.final_status,
        RunStatusSummary::Aborted {
            reason: "phase web aborted: failure threshold exceeded".into()
        }
    );
}

#[tokio::test]
async fn two_failures_in_five_trip_a_ten_percent_threshold() {
    let log = Arc::new(InMemoryCheckpointLog::new());
    let executor = Arc::new(FleetExecutor::failing(["web-2", "web-4"]));
    let config = CoordinatorConfig {
        max_retries: 0,
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::new(log.clone(), executor.clone(), &config);
    let id = deployment_id("web-threshold");
    let plan = DeploymentPlan::new(&id, 0.1)
        .with_phase(PhaseSpec::with_nodes("web", (1..=5).map(|n| format!("web-{n}"))).concurrency(5))
        .with_phase(PhaseSpec::with_nodes("cdn", ["edge-1"]).depends_on("web"));

    let report = coordinator.run(&plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.abort_reason.as_deref(), Some("failure threshold exceeded"));
    assert_eq!(report.failure_rate_at_abort, Some(0.4));
    assert_eq!(report.phases[1].status, PhaseStatus::Skipped);
    assert_eq!(report.node_failures.len(), 2);
}

#[tokio::test]
async fn replayed_phase_with_every_node_succeeded_is_closed_on_restart() {
    let log = Arc::new(InMemoryCheckpointLog::new());
    let id = deployment_id("app-done");
    let app = ["app-1", "app-2", "app-3"];
    log.append(NewCheckpoint::phase(
        id.as_str(),
        "db",
        CheckpointEvent::PhaseStarted {
            nodes: vec!["db-1".into(), "db-2".into()],
        },
    ))
    .unwrap();
    for node in ["db-1", "db-2"] {
        log.append(NewCheckpoint::node(id.as_str(), "db", node, CheckpointEvent::NodeSucceeded { attempts: 1 }))
            .unwrap();
    }
    log.append(NewCheckpoint::phase(id.as_str(), "db", CheckpointEvent::PhaseCompleted))
        .unwrap();
    log.append(NewCheckpoint::phase(
        id.as_str(),
        "app",
        CheckpointEvent::PhaseStarted {
            nodes: app.iter().map(|n| n.to_string()).collect(),
        },
    ))
    .unwrap();
    for node in app {
        log.append(NewCheckpoint::node(id.as_str(), "app", node, CheckpointEvent::NodeSucceeded { attempts: 1 }))
            .unwrap();
    }

    let replayed = rollout_kernel::replay_run(log.as_ref(), &id).unwrap();
    let app_state = replayed.phase_run_state("app");
    assert_eq!(app_state.status, PhaseStatus::Running);
    assert_eq!((app_state.succeeded, app_state.total), (3, 3));

    let executor = Arc::new(FleetExecutor::default());
    let coordinator = Coordinator::new(log.clone(), executor.clone(), &CoordinatorConfig::default());
    let plan = three_tier_plan(&id);
    let report = coordinator.run(&plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let executed = executor.executed();
    assert_eq!(executed.len(), 5);
    assert!(executed.iter().all(|n| n.starts_with("web-")));
}

#[tokio::test]
async fn crashed_run_resumes_without_repeating_recorded_work() {
    let inner = Arc::new(InMemoryCheckpointLog::new());
    let id = deployment_id("resume");
    let plan = DeploymentPlan::new(&id, 0.5)
        .with_phase(PhaseSpec::with_nodes("db", ["db-1", "db-2"]))
        .with_phase(PhaseSpec::with_nodes("app", ["app-1"]).depends_on("db"));

    // PhaseStarted(db) and the first NodeSucceeded land; the second write fails.
    let flaky = Arc::new(FlakyLog {
        inner: Arc::clone(&inner),
        allowed: 2,
        appended: AtomicUsize::new(0),
    });
    let first = Coordinator::new(flaky, Arc::new(FleetExecutor::default()), &CoordinatorConfig::default());
    let err = first.run(&plan).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Checkpoint(_)));
    assert!(err.is_fatal());
    assert_eq!(first.status().controller_state(), ControllerState::Failed);
    assert_eq!(inner.head(&id).unwrap(), 2);
    let recorded = inner.scan(&id, 2).unwrap()[0]
        .node_id
        .clone()
        .unwrap();

    let executor = Arc::new(FleetExecutor::default());
    let second = Coordinator::new(inner.clone(), executor.clone(), &CoordinatorConfig::default());
    let report = second.run(&plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let executed = executor.executed();
    assert_eq!(executed.len(), 2);
    assert!(!executed.contains(&recorded));
    assert!(executed.contains(&"app-1".to_string()));
    let starts = kinds(inner.as_ref(), &id)
        .into_iter()
        .filter(|(kind, phase)| kind == "PhaseStarted" && phase.as_deref() == Some("db"))
        .count();
    assert_eq!(starts, 1);
}

#[tokio::test]
async fn failed_node_checkpoint_leaves_live_state_matching_the_log() {
    for (executor, max_retries) in [
        (FleetExecutor::default(), 2),
        (FleetExecutor::failing(["db-1"]), 0),
    ] {
        let inner = Arc::new(InMemoryCheckpointLog::new());
        let flaky = Arc::new(FlakyLog {
            inner: Arc::clone(&inner),
            allowed: 1,
            appended: AtomicUsize::new(0),
        });
        let config = CoordinatorConfig {
            max_retries,
            ..CoordinatorConfig::default()
        };
        let coordinator = Coordinator::new(flaky, Arc::new(executor), &config);
        let id = deployment_id("durable");
        let plan = DeploymentPlan::new(&id, 0.5).with_phase(PhaseSpec::with_nodes("db", ["db-1"]));

        let err = coordinator.run(&plan).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Checkpoint(_)));

        let durable = rollout_kernel::replay_run(inner.as_ref(), &id).unwrap();
        let live = coordinator.status().node("db-1", "db").unwrap();
        assert_eq!(live.status, durable.node("db", "db-1").unwrap().status);
        assert_eq!(live.status, NodeStatus::Pending);
        assert_eq!(coordinator.status().phase("db").unwrap().status, PhaseStatus::Running);
        assert_eq!(coordinator.status().controller_state(), ControllerState::Failed);
    }
}

#[tokio::test]
async fn finished_run_reports_phases_in_execution_order() {
    let log = Arc::new(InMemoryCheckpointLog::new());
    let id = deployment_id("order");
    let plan = DeploymentPlan::new(&id, 0.1)
        .with_phase(PhaseSpec::with_nodes("zeta", ["z1"]))
        .with_phase(PhaseSpec::with_nodes("alpha", ["a1"]).depends_on("zeta"));
    let names = |report: &rollout_coordinator::RunReport| -> Vec<String> {
        report.phases.iter().map(|p| p.phase.clone()).collect()
    };

    let first = Coordinator::new(log.clone(), Arc::new(FleetExecutor::default()), &CoordinatorConfig::default())
        .run(&plan)
        .await
        .unwrap();
    let again = Coordinator::new(log.clone(), Arc::new(FleetExecutor::default()), &CoordinatorConfig::default())
        .run(&plan)
        .await
        .unwrap();

    assert_eq!(names(&first), vec!["zeta".to_string(), "alpha".to_string()]);
    assert_eq!(names(&again), names(&first));
    assert_eq!(again.status, RunStatus::Completed);
}

#[tokio::test]
async fn configured_channel_sink_receives_lifecycle_events() {
    let config = CoordinatorConfig {
        notify_buffer: 1,
        ..CoordinatorConfig::default()
    };
    let (coordinator, mut events) = Coordinator::new(
        Arc::new(InMemoryCheckpointLog::new()),
        Arc::new(FleetExecutor::default()),
        &config,
    )
    .with_channel_sink(&config);
    let id = deployment_id("channel");
    let plan = DeploymentPlan::new(&id, 0.1).with_phase(PhaseSpec::with_nodes("db", ["db-1"]));

    coordinator.run(&plan).await.unwrap();

    // One slot: only the first event fits, the rest are dropped without blocking the run.
    assert!(matches!(events.try_recv(), Ok(LifecycleEvent::PhaseStarted { .. })));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn cyclic_plan_is_rejected_before_any_checkpoint() {
    let log = Arc::new(InMemoryCheckpointLog::new());
    let executor = Arc::new(FleetExecutor::default());
    let coordinator = Coordinator::new(log.clone(), executor.clone(), &CoordinatorConfig::default());
    let id = deployment_id("cycle");
    let plan = DeploymentPlan::new(&id, 0.1)
        .with_phase(PhaseSpec::with_nodes("base", ["b1"]))
        .with_phase(PhaseSpec::with_nodes("a", ["a1"]).depends_on("base").depends_on("b"))
        .with_phase(PhaseSpec::with_nodes("b", ["b2"]).depends_on("a"));

    let err = coordinator.run(&plan).await.unwrap_err();

    match err {
        CoordinatorError::Plan(PlanError::Cycle { members }) => {
            assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
        }
        other => panic!("expected cycle error, got {other:?}"),
    }
    assert_eq!(log.head(&id).unwrap(), 0);
    assert!(executor.executed().is_empty());
    assert_eq!(coordinator.status().controller_state(), ControllerState::Failed);
}

#[tokio::test(start_paused = true)]
async fn deployment_timeout_cancels_running_phase() {
    let log = Arc::new(InMemoryCheckpointLog::new());
    let executor = Arc::new(FleetExecutor::hanging(["app-2"]));
    let coordinator = Coordinator::new(log.clone(), executor.clone(), &CoordinatorConfig::default());
    let id = deployment_id("timeout");
    let plan = DeploymentPlan::new(&id, 0.5)
        .with_timeout(Duration::from_secs(5))
        .with_phase(PhaseSpec::with_nodes("app", ["app-1", "app-2"]).concurrency(2))
        .with_phase(PhaseSpec::with_nodes("web", ["web-1"]).depends_on("app"));

    let report = coordinator.run(&plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.aborted_phase.as_deref(), Some("app"));
    assert_eq!(report.abort_reason.as_deref(), Some("deployment timeout"));
    assert_eq!(report.phases[1].status, PhaseStatus::Skipped);
    let app_2 = coordinator.status().node("app-2", "app").unwrap();
    assert_eq!(app_2.status, NodeStatus::Failed);
    assert_eq!(app_2.last_error.as_deref(), Some("cancelled"));
    assert_eq!(
        coordinator.status().node("app-1", "app").unwrap().status,
        NodeStatus::Succeeded
    );
}

#[tokio::test]
async fn node_failures_below_threshold_still_abort_the_phase() {
    let log = Arc::new(InMemoryCheckpointLog::new());
    let executor = Arc::new(FleetExecutor::failing(["web-3"]));
    let config = CoordinatorConfig {
        max_retries: 1,
        backoff_base_ms: 1,
        backoff_cap_ms: 1,
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::new(log.clone(), executor.clone(), &config);
    let id = deployment_id("partial");
    let plan = DeploymentPlan::new(&id, 0.5)
        .with_phase(PhaseSpec::with_nodes("web", ["web-1", "web-2", "web-3"]).concurrency(3));

    let report = coordinator.run(&plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.abort_reason.as_deref(), Some("node failures"));
    assert_eq!(report.node_failures.len(), 1);
    assert_eq!(report.node_failures[0].node_id, "web-3");
    assert_eq!(report.node_failures[0].attempts, 2);
    let retried = executor.executed().iter().filter(|n| *n == "web-3").count();
    assert_eq!(retried, 2);
}

#[tokio::test]
async fn recorded_phase_abort_is_finished_on_restart() {
    let log = Arc::new(InMemoryCheckpointLog::new());
    let id = deployment_id("half-aborted");
    log.append(NewCheckpoint::phase(
        id.as_str(),
        "db",
        CheckpointEvent::PhaseStarted {
            nodes: vec!["db-1".into()],
        },
    ))
    .unwrap();
    log.append(NewCheckpoint::phase(
        id.as_str(),
        "db",
        CheckpointEvent::PhaseAborted {
            reason: "phase timeout".into(),
            failure_rate: 0.0,
        },
    ))
    .unwrap();
    let executor = Arc::new(FleetExecutor::default());
    let coordinator = Coordinator::new(log.clone(), executor.clone(), &CoordinatorConfig::default());
    let plan = DeploymentPlan::new(&id, 0.1)
        .with_phase(PhaseSpec::with_nodes("db", ["db-1"]))
        .with_phase(PhaseSpec::with_nodes("app", ["app-1"]).depends_on("db"));

    let report = coordinator.run(&plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.abort_reason.as_deref(), Some("phase timeout"));
    assert!(executor.executed().is_empty());
    assert_eq!(
        kinds(log.as_ref(), &id),
        vec![
            entry("PhaseStarted", Some("db")),
            entry("PhaseAborted", Some("db")),
            entry("PhaseSkipped", Some("app")),
            entry("RunAborted", None),
        ]
    );
}

#[tokio::test]
async fn report_serializes_for_operators() {
    let log = Arc::new(InMemoryCheckpointLog::new());
    let coordinator = Coordinator::new(
        log,
        Arc::new(FleetExecutor::default()),
        &CoordinatorConfig::default(),
    );
    let id = deployment_id("json");
    let plan = DeploymentPlan::new(&id, 0.1).with_phase(PhaseSpec::with_nodes("db", ["db-1"]));

    let report = coordinator.run(&plan).await.unwrap();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["deployment_id"], id.as_str());
    assert_eq!(json["status"], "Completed");
    assert_eq!(json["phases"][0]["phase"], "db");
    let env: HashMap<String, String> = HashMap::new();
    assert!(CoordinatorConfig::from_env_map(&env).is_ok());
}
