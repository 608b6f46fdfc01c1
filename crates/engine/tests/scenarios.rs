//! End-to-end scenarios over the in-memory store, bus, and scripted
//! executors.  Tokio time is paused so interval-driven loops (retry
//! processor, timeout monitor) run without real waiting; the manual clock
//! drives every schedule and deadline decision.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use bus::{Bus, InMemoryBus};
use engine::{EngineConfig, EngineError, EngineService, InMemoryWorkflowRepository,
    ValidationErrorCode, WorkflowRepository};
use model::{
    Clock, Edge, ErrorDetails, ExecutionContext, ManualClock, NodeDefinition, NodeState,
    NodeStatus, Position, RetryPolicy, RunStatus, Trigger, TriggerEvent, WorkflowDefinition,
    WorkflowState,
};
use nodes::{MockExecutorService, ScriptedExecutor, ScriptedResponse};
use store::{MemoryStore, StateStore, StoreConfig};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    service: EngineService,
    executors: MockExecutorService,
    executor: Arc<ScriptedExecutor>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    repository: Arc<InMemoryWorkflowRepository>,
}

impl Harness {
    async fn start() -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(
            StoreConfig::default(),
            clock.clone() as Arc<dyn Clock>,
        ));
        let bus = Arc::new(InMemoryBus::new());
        let repository = Arc::new(InMemoryWorkflowRepository::new());
        let executor = Arc::new(ScriptedExecutor::new());

        let executors =
            MockExecutorService::start(bus.clone() as Arc<dyn Bus>, executor.clone()).await;
        let service = EngineService::start(
            EngineConfig::default(),
            store.clone() as Arc<dyn StateStore>,
            bus as Arc<dyn Bus>,
            repository.clone() as Arc<dyn WorkflowRepository>,
            clock.clone() as Arc<dyn Clock>,
        )
        .await
        .expect("engine service starts");

        Self {
            service,
            executors,
            executor,
            store,
            clock,
            repository,
        }
    }

    async fn stop(self) {
        self.service.stop().await;
        self.executors.stop().await;
    }

    /// Poll until the run state satisfies `pred`.  Tokio time is paused,
    /// so each sleep auto-advances the interval-driven loops.
    async fn await_run<F>(&self, run_id: Uuid, pred: F) -> WorkflowState
    where
        F: Fn(&WorkflowState) -> bool,
    {
        for _ in 0..8_000 {
            if let Ok(Some(state)) = self.service.run_state(run_id).await {
                if pred(&state) {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} never satisfied the predicate");
    }

    /// Poll until the node state satisfies `pred`.
    async fn await_node<F>(&self, run_id: Uuid, node_id: &str, pred: F) -> NodeState
    where
        F: Fn(&NodeState) -> bool,
    {
        for _ in 0..8_000 {
            if let Ok(Some(state)) = self.store.get_node_state(run_id, node_id).await {
                if pred(&state) {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node {node_id} of run {run_id} never satisfied the predicate");
    }
}

fn make_node(id: &str, node_type: &str) -> NodeDefinition {
    NodeDefinition {
        id: id.to_string(),
        node_type: node_type.to_string(),
        name: format!("{id} step"),
        params: json!({}),
        retry_policy: None,
        timeout_ms: 30_000,
        position: Position::default(),
    }
}

fn make_edge(id: &str, from: &str, to: &str) -> Edge {
    Edge {
        id: id.to_string(),
        from_node_id: from.to_string(),
        to_node_id: to.to_string(),
    }
}

fn definition(id: &str, nodes: Vec<NodeDefinition>, edges: Vec<Edge>) -> WorkflowDefinition {
    WorkflowDefinition::new(id, "org-1", format!("{id} workflow"), Trigger::Onboard, nodes, edges)
}

fn onboard_event() -> TriggerEvent {
    TriggerEvent {
        event_type: "employee.onboard.started".into(),
        organization_id: "org-1".into(),
        employee_id: "emp-1".into(),
        payload: json!({"department": "platform"}),
        timestamp: Utc::now(),
        correlation_id: Some("corr-1".into()),
    }
}

fn transient(code: &str) -> ScriptedResponse {
    ScriptedResponse::Failure(ErrorDetails::new(code, format!("{code} while calling out")))
}

// ---------------------------------------------------------------------------
// Scenario 1 — linear three-node happy path
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn linear_three_node_happy_path() {
    let harness = Harness::start().await;
    harness.repository.insert(definition(
        "wf-linear",
        vec![
            make_node("A", "email.send"),
            make_node("B", "email.send"),
            make_node("C", "email.send"),
        ],
        vec![make_edge("e1", "A", "B"), make_edge("e2", "B", "C")],
    ));
    for id in ["A", "B", "C"] {
        harness.executor.succeed_with(id, json!({"sent": true}));
    }

    let runs = harness.service.trigger_event(&onboard_event()).await.unwrap();
    assert_eq!(runs.len(), 1);
    let run_id = runs[0].run_id;

    let state = harness
        .await_run(run_id, |s| s.status == RunStatus::Completed)
        .await;

    assert_eq!(
        state.completed_nodes,
        ["A", "B", "C"]
            .iter()
            .map(|s| s.to_string())
            .collect::<std::collections::HashSet<String>>()
    );
    assert!(state.failed_nodes.is_empty());
    assert!(state.current_nodes.is_empty());
    assert_eq!(
        state.context.variables.get_path("nodes.A.output.sent"),
        Some(&json!(true))
    );

    // Order followed the DAG.
    let calls = harness.executor.calls();
    let order: Vec<&str> = calls.iter().map(|c| c.node_id.as_str()).collect();
    assert_eq!(order, vec!["A", "B", "C"]);

    harness.stop().await;
}

// ---------------------------------------------------------------------------
// Scenario 2 — retry then success with exact back-off
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retry_then_success_backs_off_exponentially() {
    let harness = Harness::start().await;
    let mut provision = make_node("P", "identity.provision");
    provision.retry_policy = Some(RetryPolicy {
        max_retries: 5,
        backoff_ms: 2_000,
        multiplier: 2.0,
        max_backoff_ms: 60_000,
        jitter: false,
    });
    harness
        .repository
        .insert(definition("wf-retry", vec![provision], vec![]));
    harness.executor.script(
        "P",
        vec![
            transient("ETIMEDOUT"),
            transient("ETIMEDOUT"),
            ScriptedResponse::Success(json!({"provisioned": true})),
        ],
    );

    let runs = harness.service.trigger_event(&onboard_event()).await.unwrap();
    let run_id = runs[0].run_id;

    // Attempt 1 fails; the first delay is exactly backoff_ms.
    let node = harness
        .await_node(run_id, "P", |n| {
            n.status == NodeStatus::Retrying && n.attempt == 1
        })
        .await;
    let first_delay = node.next_retry_at.unwrap() - harness.clock.now();
    assert_eq!(first_delay.num_milliseconds(), 2_000);

    // Exactly one schedule entry backs the RETRYING node.
    let scheduled = harness.store.all_scheduled_retries().await.unwrap();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].node_id, "P");

    // Attempt 2 fails; the delay doubles.
    harness.clock.advance_millis(2_001);
    let node = harness
        .await_node(run_id, "P", |n| {
            n.status == NodeStatus::Retrying && n.attempt == 2
        })
        .await;
    let second_delay = node.next_retry_at.unwrap() - harness.clock.now();
    assert_eq!(second_delay.num_milliseconds(), 4_000);

    // Attempt 3 succeeds.
    harness.clock.advance_millis(4_001);
    let state = harness
        .await_run(run_id, |s| s.status == RunStatus::Completed)
        .await;
    assert!(state.completed_nodes.contains("P"));

    let node = harness.store.get_node_state(run_id, "P").await.unwrap().unwrap();
    assert_eq!(node.attempt, 3);
    assert_eq!(node.status, NodeStatus::Completed);
    assert!(node.next_retry_at.is_none());
    assert_eq!(harness.executor.call_count("P"), 3);
    assert!(harness.store.all_scheduled_retries().await.unwrap().is_empty());

    harness.stop().await;
}

// ---------------------------------------------------------------------------
// Scenario 3 — non-retryable failure fails the workflow without compensation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn non_retryable_failure_fails_workflow() {
    let harness = Harness::start().await;
    harness
        .repository
        .insert(definition("wf-bad", vec![make_node("M", "email.send")], vec![]));
    harness.executor.script(
        "M",
        vec![ScriptedResponse::Failure(ErrorDetails::new(
            "VALIDATION_ERROR",
            "recipient address rejected",
        ))],
    );

    let runs = harness.service.trigger_event(&onboard_event()).await.unwrap();
    let run_id = runs[0].run_id;

    let state = harness
        .await_run(run_id, |s| s.status == RunStatus::Failed)
        .await;
    assert!(state.failed_nodes.contains("M"));
    assert_eq!(state.error_details.as_ref().unwrap().code, "VALIDATION_ERROR");

    // No retry was ever scheduled and only one attempt was made.
    assert!(harness.store.all_scheduled_retries().await.unwrap().is_empty());
    assert_eq!(harness.executor.call_count("M"), 1);

    // Non-compensatable: no compensation step states exist.
    let states = harness.store.get_all_node_states(run_id).await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].node_id, "M");

    harness.stop().await;
}

// ---------------------------------------------------------------------------
// Scenario 4 — compensation rolls back the completed provisioning
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn compensation_rolls_back_completed_provisioning() {
    let harness = Harness::start().await;
    harness.repository.insert(definition(
        "wf-comp",
        vec![
            make_node("A", "identity.provision"),
            make_node("B", "email.send"),
        ],
        vec![make_edge("e1", "A", "B")],
    ));
    harness
        .executor
        .succeed_with("A", json!({"account": "emp-1@corp"}));
    harness.executor.script(
        "B",
        vec![ScriptedResponse::Failure(ErrorDetails::new(
            "TEMPLATE_MISSING",
            "welcome template not found",
        ))],
    );

    let runs = harness.service.trigger_event(&onboard_event()).await.unwrap();
    let run_id = runs[0].run_id;

    let state = harness
        .await_run(run_id, |s| s.status == RunStatus::Failed)
        .await;
    assert!(state.completed_nodes.contains("A"));
    assert!(state.failed_nodes.contains("B"));

    // A synthesized identity.deprovision targeting A ran to completion.
    let comp = harness
        .await_node(run_id, "comp:A", |n| n.status == NodeStatus::Completed)
        .await;
    assert!(comp.input.is_some());

    let comp_call = harness
        .executor
        .calls()
        .into_iter()
        .find(|call| call.node_id == "comp:A")
        .expect("compensation dispatched");
    assert_eq!(comp_call.input["compensatesFor"], json!(["A"]));
    assert_eq!(comp_call.input["originalOutput"]["account"], json!("emp-1@corp"));

    harness.stop().await;
}

// ---------------------------------------------------------------------------
// Scenario 5 — parallel fan-out joins exactly once
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn parallel_fan_out_joins_exactly_once() {
    let harness = Harness::start().await;
    harness.repository.insert(definition(
        "wf-fan",
        vec![
            make_node("R", "email.send"),
            make_node("A", "slack.message"),
            make_node("B", "slack.message"),
            make_node("J", "email.send"),
        ],
        vec![
            make_edge("e1", "R", "A"),
            make_edge("e2", "R", "B"),
            make_edge("e3", "A", "J"),
            make_edge("e4", "B", "J"),
        ],
    ));

    let runs = harness.service.trigger_event(&onboard_event()).await.unwrap();
    let run_id = runs[0].run_id;

    let state = harness
        .await_run(run_id, |s| s.status == RunStatus::Completed)
        .await;
    assert_eq!(state.completed_nodes.len(), 4);

    // The join dispatched exactly once, after both branches.
    assert_eq!(harness.executor.call_count("J"), 1);
    let calls = harness.executor.calls();
    let j_pos = calls.iter().position(|c| c.node_id == "J").unwrap();
    let a_pos = calls.iter().position(|c| c.node_id == "A").unwrap();
    let b_pos = calls.iter().position(|c| c.node_id == "B").unwrap();
    assert!(j_pos > a_pos && j_pos > b_pos);

    harness.stop().await;
}

// ---------------------------------------------------------------------------
// Scenario 6 — cyclic definitions never start a run
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cycle_rejection_creates_no_run() {
    let harness = Harness::start().await;
    harness.repository.insert(definition(
        "wf-cycle",
        vec![
            make_node("X", "email.send"),
            make_node("Y", "email.send"),
            make_node("Z", "email.send"),
        ],
        vec![
            make_edge("e1", "X", "Y"),
            make_edge("e2", "Y", "Z"),
            make_edge("e3", "Z", "X"),
        ],
    ));

    let err = harness
        .service
        .execute_workflow("wf-cycle", ExecutionContext::default())
        .await
        .unwrap_err();
    let EngineError::Validation(errors) = err else {
        panic!("expected validation failure");
    };
    let cycle = errors
        .iter()
        .find(|e| e.code == ValidationErrorCode::CycleDetected)
        .expect("cycle reported");
    assert!(cycle.message.contains("X -> Y -> Z -> X"), "{}", cycle.message);

    // The lifecycle path refuses it too, and no state was written.
    let runs = harness.service.trigger_event(&onboard_event()).await.unwrap();
    assert!(runs.is_empty());
    assert!(harness.store.list_run_ids().await.unwrap().is_empty());

    harness.stop().await;
}

// ---------------------------------------------------------------------------
// Cancellation, pause/resume, timeout, condition pruning
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancellation_is_cooperative_and_notifies_executors() {
    let harness = Harness::start().await;
    harness.repository.insert(definition(
        "wf-hold",
        vec![make_node("hold", "webhook.call")],
        vec![],
    ));
    harness
        .executor
        .script("hold", vec![ScriptedResponse::Ignore]);

    let runs = harness.service.trigger_event(&onboard_event()).await.unwrap();
    let run_id = runs[0].run_id;
    harness
        .await_node(run_id, "hold", |n| n.status == NodeStatus::Running)
        .await;

    harness.service.cancel_workflow(run_id).await.unwrap();

    let state = harness
        .await_run(run_id, |s| s.status == RunStatus::Cancelled)
        .await;
    assert!(state.current_nodes.is_empty());
    let node = harness
        .store
        .get_node_state(run_id, "hold")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.status, NodeStatus::Cancelled);

    // The best-effort cancel notice reached the executor fleet.
    for _ in 0..1_000 {
        if harness
            .executors
            .cancelled()
            .contains(&(run_id, "hold".to_string()))
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(harness
        .executors
        .cancelled()
        .contains(&(run_id, "hold".to_string())));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn pause_blocks_dispatch_until_resume() {
    let harness = Harness::start().await;
    harness.repository.insert(definition(
        "wf-pause",
        vec![make_node("slow", "webhook.call")],
        vec![],
    ));
    harness
        .executor
        .script("slow", vec![ScriptedResponse::Ignore]);

    let runs = harness.service.trigger_event(&onboard_event()).await.unwrap();
    let run_id = runs[0].run_id;
    harness
        .await_node(run_id, "slow", |n| n.status == NodeStatus::Running)
        .await;

    harness.service.pause_workflow(run_id).await.unwrap();
    let state = harness
        .await_run(run_id, |s| s.status == RunStatus::Paused)
        .await;
    assert_eq!(state.status, RunStatus::Paused);

    // Pausing a paused run is an invalid transition.
    assert!(matches!(
        harness.service.pause_workflow(run_id).await,
        Err(EngineError::InvalidTransition { .. })
    ));

    harness.service.resume_workflow(run_id).await.unwrap();
    harness
        .await_run(run_id, |s| s.status == RunStatus::Running)
        .await;

    harness.service.cancel_workflow(run_id).await.unwrap();
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn node_deadline_times_out_and_fails_the_run() {
    let harness = Harness::start().await;
    let mut slow = make_node("slow", "webhook.call");
    slow.timeout_ms = 5_000;
    harness
        .repository
        .insert(definition("wf-timeout", vec![slow], vec![]));
    harness
        .executor
        .script("slow", vec![ScriptedResponse::Ignore]);

    let runs = harness.service.trigger_event(&onboard_event()).await.unwrap();
    let run_id = runs[0].run_id;
    harness
        .await_node(run_id, "slow", |n| n.status == NodeStatus::Running)
        .await;

    harness.clock.advance_millis(5_001);

    let state = harness
        .await_run(run_id, |s| s.status == RunStatus::Failed)
        .await;
    assert!(state.failed_nodes.contains("slow"));
    let node = harness
        .store
        .get_node_state(run_id, "slow")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.status, NodeStatus::Timeout);
    assert!(node.ended_at.is_some());

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn false_condition_prunes_only_its_branch() {
    let harness = Harness::start().await;
    harness.repository.insert(definition(
        "wf-cond",
        vec![
            make_node("entry", "email.send"),
            make_node("gate", "condition"),
            make_node("gated", "slack.message"),
            make_node("always", "slack.message"),
        ],
        vec![
            make_edge("e1", "entry", "gate"),
            make_edge("e2", "entry", "always"),
            make_edge("e3", "gate", "gated"),
        ],
    ));
    harness
        .executor
        .succeed_with("gate", json!({"result": false}));

    let runs = harness.service.trigger_event(&onboard_event()).await.unwrap();
    let run_id = runs[0].run_id;

    let state = harness
        .await_run(run_id, |s| s.status == RunStatus::Completed)
        .await;

    assert!(state.completed_nodes.contains("entry"));
    assert!(state.completed_nodes.contains("gate"));
    assert!(state.completed_nodes.contains("always"));
    assert_eq!(
        state.skipped_nodes,
        std::iter::once("gated".to_string()).collect::<std::collections::HashSet<String>>()
    );
    assert_eq!(harness.executor.call_count("gated"), 0);

    let node = harness
        .store
        .get_node_state(run_id, "gated")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.status, NodeStatus::Skipped);

    harness.stop().await;
}
