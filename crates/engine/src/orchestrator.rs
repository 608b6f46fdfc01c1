//! The orchestrator: event-driven DAG advancement for workflow runs.
//!
//! One orchestrator per engine instance.  It owns the lifecycle operations
//! (execute/pause/resume/cancel), consumes node results, advances the DAG,
//! and drives completion, failure, compensation, retry scheduling, and
//! timeout enforcement.  Every run it mutates is held under the
//! distributed run lock with background renewal.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use bus::Bus;
use model::{
    Clock, ErrorCategory, ErrorDetails, ErrorLevel, ErrorLogEntry, ExecutionContext,
    NodeExecutionResult, NodeState, NodeStatus, NodeType, ResultStatus, RetryScheduleEntry,
    RunStatus, WorkflowRun, WorkflowState,
};
use nodes::service_for;
use store::{acquire_lock_with_renewal, RunLock, StateStore};

use crate::circuit::CircuitBreaker;
use crate::compensation::{self, CompensationManager, CompensationProgress};
use crate::config::EngineConfig;
use crate::context;
use crate::dag::{self, ParsedWorkflow};
use crate::dispatch::{first_attempt, DispatchItem, NodeDispatcher};
use crate::error::EngineError;
use crate::error_log::ErrorLogger;
use crate::repository::WorkflowRepository;
use crate::retry::RetryManager;
use crate::state_machine::{apply_node_trigger, apply_run_trigger, NodeTrigger, RunTrigger};

/// How a node failure was settled.
enum FailureOutcome {
    /// Retry scheduled; the node sits in RETRYING until the processor
    /// re-dispatches it.
    Retried,
    /// Permanent: the node joined `failed_nodes`.
    Settled,
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    repository: Arc<dyn WorkflowRepository>,
    dispatcher: Arc<NodeDispatcher>,
    retry: RetryManager,
    breaker: CircuitBreaker,
    compensation: CompensationManager,
    errors: ErrorLogger,
    /// Run locks held by this instance.
    locks: DashMap<Uuid, RunLock>,
    /// Parsed plans for runs this instance is driving.
    plans: DashMap<Uuid, Arc<ParsedWorkflow>>,
    /// In-flight compensation plans, advanced as step results arrive.
    compensations: DashMap<Uuid, CompensationProgress>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn Bus>,
        clock: Arc<dyn Clock>,
        repository: Arc<dyn WorkflowRepository>,
        errors: ErrorLogger,
        config: EngineConfig,
    ) -> Self {
        let dispatcher = Arc::new(NodeDispatcher::new(
            Arc::clone(&bus),
            Arc::clone(&store),
            Arc::clone(&clock),
        ));
        let breaker_config = crate::circuit::CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_threshold,
            ..Default::default()
        };
        Self {
            breaker: CircuitBreaker::new(Arc::clone(&store), Arc::clone(&clock), breaker_config),
            compensation: CompensationManager::new(Arc::clone(&dispatcher)),
            dispatcher,
            retry: RetryManager::new(),
            store,
            clock,
            config,
            repository,
            errors,
            locks: DashMap::new(),
            plans: DashMap::new(),
            compensations: DashMap::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Start a run of `workflow_id` with the given context.
    ///
    /// # Errors
    /// `WorkflowNotFound`, `Validation`, `LockUnavailable`,
    /// `MaxConcurrentWorkflows`, or store/bus failures.
    #[instrument(skip(self, context))]
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        context: ExecutionContext,
    ) -> Result<WorkflowRun, EngineError> {
        if self.locks.len() >= self.config.max_concurrent_workflows {
            return Err(EngineError::MaxConcurrentWorkflows(
                self.config.max_concurrent_workflows,
            ));
        }

        let definition = self
            .repository
            .get(workflow_id)
            .await?
            .filter(|def| def.is_active)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        let parsed = Arc::new(dag::parse(&definition).map_err(EngineError::Validation)?);

        let run_id = Uuid::new_v4();
        let now = self.clock.now();
        let mut state = WorkflowState::new(run_id, workflow_id, context, now);

        let lock = acquire_lock_with_renewal(
            Arc::clone(&self.store),
            run_id,
            &self.config.instance_id,
            self.config.lock_ttl,
            self.config.lock_renew_interval(),
        )
        .await?
        .ok_or(EngineError::LockUnavailable(run_id))?;
        self.locks.insert(run_id, lock);
        self.plans.insert(run_id, Arc::clone(&parsed));

        self.store.put_workflow_state(&state).await?;
        apply_run_trigger(&mut state, RunTrigger::Start, self.clock.now())?;
        info!(%run_id, workflow_id, "workflow run started");

        self.advance(&parsed, &mut state).await?;
        Ok(WorkflowRun::from(&state))
    }

    /// Pause a RUNNING run.  In-flight executor work keeps going; its
    /// results are applied, but nothing new is dispatched until resume.
    pub async fn pause_workflow(&self, run_id: Uuid) -> Result<(), EngineError> {
        let mut state = self.load_state(run_id).await?;
        apply_run_trigger(&mut state, RunTrigger::Pause, self.clock.now())?;
        self.store.put_workflow_state(&state).await?;
        info!(%run_id, "workflow run paused");
        Ok(())
    }

    /// Resume a PAUSED run: recompute eligible nodes and dispatch them.
    pub async fn resume_workflow(&self, run_id: Uuid) -> Result<(), EngineError> {
        let mut state = self.load_state(run_id).await?;
        apply_run_trigger(&mut state, RunTrigger::Resume, self.clock.now())?;
        let parsed = self.parsed_for(&state).await?;
        info!(%run_id, "workflow run resumed");
        self.advance(&parsed, &mut state).await
    }

    /// Cancel a RUNNING or PAUSED run cooperatively.
    pub async fn cancel_workflow(&self, run_id: Uuid) -> Result<(), EngineError> {
        let mut state = self.load_state(run_id).await?;
        apply_run_trigger(&mut state, RunTrigger::Cancel, self.clock.now())?;

        let now = self.clock.now();
        let mut updated = Vec::new();
        for mut node_state in self.store.get_all_node_states(run_id).await? {
            match node_state.status {
                NodeStatus::Running => {
                    self.dispatcher
                        .publish_cancel(&state, &node_state.node_id, "workflow cancelled")
                        .await;
                    apply_node_trigger(&mut node_state, NodeTrigger::Cancel, now)?;
                    updated.push(node_state);
                }
                NodeStatus::Queued => {
                    apply_node_trigger(&mut node_state, NodeTrigger::Cancel, now)?;
                    updated.push(node_state);
                }
                NodeStatus::Retrying => {
                    self.store
                        .remove_from_retry_schedule(run_id, &node_state.node_id)
                        .await?;
                    apply_node_trigger(&mut node_state, NodeTrigger::Queue, now)?;
                    apply_node_trigger(&mut node_state, NodeTrigger::Cancel, now)?;
                    updated.push(node_state);
                }
                _ => {}
            }
        }
        self.store.batch_put_node_states(&updated).await?;

        state.current_nodes.clear();
        self.store.put_workflow_state(&state).await?;
        info!(%run_id, "workflow run cancelled");
        self.finish_run(run_id).await;
        Ok(())
    }

    /// Current run state, straight from the store.
    pub async fn run_state(&self, run_id: Uuid) -> Result<Option<WorkflowState>, EngineError> {
        Ok(self.store.get_workflow_state(run_id).await?)
    }

    // -----------------------------------------------------------------------
    // Result application
    // -----------------------------------------------------------------------

    /// Apply an executor result from the bus.
    pub async fn apply_result(&self, result: NodeExecutionResult) -> Result<(), EngineError> {
        match result.status {
            ResultStatus::Success => {
                self.handle_node_completion(
                    result.run_id,
                    &result.node_id,
                    result.output.unwrap_or_else(|| json!({})),
                )
                .await
            }
            ResultStatus::Failed => {
                let error = result
                    .error
                    .unwrap_or_else(|| ErrorDetails::new("EXECUTOR_ERROR", "executor failed"));
                self.handle_node_failure(result.run_id, &result.node_id, error, false)
                    .await
            }
            ResultStatus::Retry => {
                let error = result.error.unwrap_or_else(|| {
                    ErrorDetails::new("RETRY_REQUESTED", "executor requested retry")
                });
                self.handle_node_failure(result.run_id, &result.node_id, error, true)
                    .await
            }
        }
    }

    /// Move a node into `completed_nodes`, grow the context, and advance.
    #[instrument(skip(self, output))]
    pub async fn handle_node_completion(
        &self,
        run_id: Uuid,
        node_id: &str,
        output: Value,
    ) -> Result<(), EngineError> {
        let Some(mut state) = self.store.get_workflow_state(run_id).await? else {
            debug!("result for unknown run ignored");
            return Ok(());
        };
        let Some(mut node_state) = self.store.get_node_state(run_id, node_id).await? else {
            debug!("result for unknown node ignored");
            return Ok(());
        };
        let parsed = self.parsed_for(&state).await?;

        // Compensation step results never join DAG advancement; they move
        // the run's compensation plan forward instead.
        if state.status == RunStatus::Compensating || !parsed.is_forward_node(node_id) {
            if node_state.status != NodeStatus::Running {
                debug!(status = %node_state.status, "stale compensation result ignored");
                return Ok(());
            }
            apply_node_trigger(&mut node_state, NodeTrigger::Complete, self.clock.now())?;
            node_state.output = Some(output);
            self.store.put_node_state(&node_state).await?;
            return self
                .on_compensation_step_settled(&mut state, node_id, true)
                .await;
        }

        // Late result after cancellation/termination: accept, change nothing.
        if node_state.status != NodeStatus::Running || state.status.is_terminal() {
            debug!(status = %node_state.status, "stale result ignored");
            return Ok(());
        }

        apply_node_trigger(&mut node_state, NodeTrigger::Complete, self.clock.now())?;
        node_state.output = Some(output.clone());
        self.store.put_node_state(&node_state).await?;

        state.current_nodes.remove(node_id);
        state.completed_nodes.insert(node_id.to_string());

        let node_name = parsed
            .node(node_id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| node_id.to_string());
        context::merge_node_output(&mut state.context, node_id, &node_name, &output);

        let node_type = parsed.node_type(node_id);
        if self.config.enable_circuit_breaker {
            if let Some(service) = node_type.and_then(service_for) {
                self.breaker.record_success(service).await;
            }
        }

        // A false condition prunes the branch it gates.
        if node_type == Some(NodeType::Condition) && condition_rejected(&output) {
            self.skip_branch(&parsed, &mut state, node_id).await?;
        }

        debug!(completed = state.completed_nodes.len(), "node completed");
        self.advance(&parsed, &mut state).await
    }

    /// Route a node failure through retry classification, then either park
    /// it in RETRYING or settle it and evaluate continuation.
    #[instrument(skip(self, error))]
    pub async fn handle_node_failure(
        &self,
        run_id: Uuid,
        node_id: &str,
        error: ErrorDetails,
        retry_requested: bool,
    ) -> Result<(), EngineError> {
        let Some(mut state) = self.store.get_workflow_state(run_id).await? else {
            debug!("failure for unknown run ignored");
            return Ok(());
        };
        let Some(mut node_state) = self.store.get_node_state(run_id, node_id).await? else {
            debug!("failure for unknown node ignored");
            return Ok(());
        };
        let parsed = self.parsed_for(&state).await?;

        if state.status == RunStatus::Compensating || !parsed.is_forward_node(node_id) {
            if node_state.status != NodeStatus::Running {
                debug!(status = %node_state.status, "stale compensation failure ignored");
                return Ok(());
            }
            apply_node_trigger(&mut node_state, NodeTrigger::Fail, self.clock.now())?;
            node_state.error_details = Some(error);
            self.store.put_node_state(&node_state).await?;
            return self
                .on_compensation_step_settled(&mut state, node_id, false)
                .await;
        }

        if node_state.status != NodeStatus::Running || state.status.is_terminal() {
            debug!(status = %node_state.status, "stale failure ignored");
            return Ok(());
        }

        if self.config.enable_circuit_breaker {
            if let Some(service) = parsed.node_type(node_id).and_then(service_for) {
                self.breaker.record_failure(service).await;
            }
        }

        let outcome = self
            .settle_node_failure(&parsed, &mut state, node_state, error, retry_requested)
            .await?;

        match outcome {
            FailureOutcome::Retried => self.store.put_workflow_state(&state).await.map_err(Into::into),
            FailureOutcome::Settled => self.advance(&parsed, &mut state).await,
        }
    }

    // -----------------------------------------------------------------------
    // Failure settlement
    // -----------------------------------------------------------------------

    /// Decide retry vs permanent failure for a node whose state is RUNNING
    /// or already FAILED (dispatch refusals arrive pre-failed).
    async fn settle_node_failure(
        &self,
        parsed: &ParsedWorkflow,
        state: &mut WorkflowState,
        mut node_state: NodeState,
        error: ErrorDetails,
        retry_requested: bool,
    ) -> Result<FailureOutcome, EngineError> {
        let now = self.clock.now();
        if node_state.status == NodeStatus::Running {
            apply_node_trigger(&mut node_state, NodeTrigger::Fail, now)?;
        }
        node_state.error_details = Some(error.clone());

        let node_id = node_state.node_id.clone();
        let policy = parsed
            .node(&node_id)
            .zip(parsed.node_type(&node_id))
            .map(|(node, node_type)| self.retry.effective_policy(node, node_type))
            .unwrap_or_default();

        let attempt = node_state.attempt;
        let wants_retry = self.config.enable_retry
            && (retry_requested || self.retry.is_retryable(&error))
            && attempt < policy.max_retries;

        if wants_retry {
            apply_node_trigger(&mut node_state, NodeTrigger::Retry, now)?;
            let delay_ms = self.retry.delay_ms(&policy, attempt);
            let retry_at = now + chrono::Duration::milliseconds(delay_ms as i64);
            node_state.next_retry_at = Some(retry_at);

            self.store.put_node_state(&node_state).await?;
            self.store.schedule_retry(state.run_id, &node_id, retry_at).await?;
            state.current_nodes.remove(&node_id);

            warn!(
                run_id = %state.run_id,
                node_id = %node_id,
                attempt,
                delay_ms,
                code = %error.code,
                "node failed; retry scheduled"
            );
            self.errors.report(
                ErrorLogEntry::new(
                    ErrorLevel::Warn,
                    ErrorCategory::Node,
                    error.code.clone(),
                    format!("node '{node_id}' attempt {attempt} failed; retrying"),
                )
                .with_context(json!({"runId": state.run_id, "nodeId": node_id})),
            );
            return Ok(FailureOutcome::Retried);
        }

        self.store.put_node_state(&node_state).await?;
        state.current_nodes.remove(&node_id);
        state.failed_nodes.insert(node_id.clone());
        if state.error_details.is_none() {
            state.error_details = Some(error.clone());
        }

        warn!(
            run_id = %state.run_id,
            node_id = %node_id,
            attempt,
            code = %error.code,
            "node failed permanently"
        );
        self.errors.report(
            ErrorLogEntry::new(
                ErrorLevel::Error,
                ErrorCategory::Node,
                error.code,
                format!("node '{node_id}' failed permanently after {attempt} attempt(s)"),
            )
            .with_context(json!({"runId": state.run_id, "nodeId": node_id})),
        );
        Ok(FailureOutcome::Settled)
    }

    // -----------------------------------------------------------------------
    // DAG advancement
    // -----------------------------------------------------------------------

    /// Dispatch everything eligible, then evaluate the run outcome.
    /// Persists the workflow state on every path.
    async fn advance(
        &self,
        parsed: &ParsedWorkflow,
        state: &mut WorkflowState,
    ) -> Result<(), EngineError> {
        if state.status != RunStatus::Running {
            return self.store.put_workflow_state(state).await.map_err(Into::into);
        }

        loop {
            let mut eligible = parsed.eligible_nodes(state);
            self.retain_unheld(state.run_id, &mut eligible).await?;
            if eligible.is_empty() {
                break;
            }

            let settled_before = state.settled_count();
            self.dispatch_set(parsed, state, eligible).await?;

            if !state.current_nodes.is_empty() || state.settled_count() == settled_before {
                break;
            }
            // Everything dispatched settled synchronously (open circuits,
            // unresolvable inputs); re-evaluate eligibility.
        }

        if state.current_nodes.is_empty() && state.status == RunStatus::Running {
            let mut eligible = parsed.eligible_nodes(state);
            self.retain_unheld(state.run_id, &mut eligible).await?;

            if parsed.is_complete(state) && state.failed_nodes.is_empty() {
                return self.complete_run(state).await;
            }
            if eligible.is_empty() && !self.has_pending_retries(state.run_id).await {
                if !state.failed_nodes.is_empty() || !parsed.is_complete(state) {
                    return self.fail_run(parsed, state).await;
                }
            }
        }

        self.store.put_workflow_state(state).await.map_err(Into::into)
    }

    /// Drop candidates that already hold a live (non-terminal) node state:
    /// RETRYING nodes wait for the retry processor, QUEUED/RUNNING ones are
    /// already in flight.
    async fn retain_unheld(
        &self,
        run_id: Uuid,
        eligible: &mut Vec<String>,
    ) -> Result<(), EngineError> {
        if eligible.is_empty() {
            return Ok(());
        }
        let held: HashSet<String> = self
            .store
            .get_all_node_states(run_id)
            .await?
            .into_iter()
            .filter(|node| !node.status.is_terminal())
            .map(|node| node.node_id)
            .collect();
        eligible.retain(|id| !held.contains(id));
        Ok(())
    }

    async fn has_pending_retries(&self, run_id: Uuid) -> bool {
        self.store
            .all_scheduled_retries()
            .await
            .map(|entries| entries.iter().any(|entry| entry.run_id == run_id))
            .unwrap_or(false)
    }

    /// Prepare and dispatch a batch of eligible nodes.  Circuit rejections
    /// and unresolvable inputs settle through the failure pipeline without
    /// a publish.
    async fn dispatch_set(
        &self,
        parsed: &ParsedWorkflow,
        state: &mut WorkflowState,
        node_ids: Vec<String>,
    ) -> Result<(), EngineError> {
        let mut items: Vec<DispatchItem> = Vec::with_capacity(node_ids.len());

        for node_id in node_ids {
            let Some(node) = parsed.node(&node_id).cloned() else {
                continue;
            };
            let Some(node_type) = parsed.node_type(&node_id) else {
                continue;
            };

            if self.config.enable_circuit_breaker {
                if let Some(service) = service_for(node_type) {
                    if let Err(EngineError::CircuitOpen { service, next_retry_at }) =
                        self.breaker.preflight(service).await
                    {
                        let error = ErrorDetails::new(
                            "CIRCUIT_BREAKER_OPEN",
                            format!("circuit open for '{service}' until {next_retry_at}"),
                        );
                        self.settle_undispatched(parsed, state, &node, error).await?;
                        continue;
                    }
                }
            }

            let input = match context::resolve_input(&node, &state.context) {
                Ok(input) => input,
                Err(EngineError::MissingRequiredParameter { target, .. }) => {
                    let error = ErrorDetails::new(
                        "MISSING_REQUIRED_PARAMETER",
                        format!("required parameter '{target}' did not resolve"),
                    );
                    self.settle_undispatched(parsed, state, &node, error).await?;
                    continue;
                }
                Err(other) => return Err(other),
            };

            state.current_nodes.insert(node_id.clone());
            items.push(first_attempt(state.run_id, node, node_type, input));
        }

        for (item, outcome) in self.dispatcher.dispatch_nodes(state, items).await {
            if outcome.is_err() {
                // The dispatcher already parked the node in FAILED with
                // DISPATCH_FAILED; classify it like any other failure.
                let error = item
                    .node_state
                    .error_details
                    .clone()
                    .unwrap_or_else(|| ErrorDetails::new("DISPATCH_FAILED", "publish failed"));
                let node_id = item.node_state.node_id.clone();
                self.settle_node_failure(parsed, state, item.node_state, error, false)
                    .await?;
                debug!(node_id = %node_id, "dispatch failure settled");
            }
        }
        Ok(())
    }

    /// Fail a node that never reached the bus (circuit open, bad input).
    /// It passes through RUNNING so the transition table and timestamp
    /// invariants hold.
    async fn settle_undispatched(
        &self,
        parsed: &ParsedWorkflow,
        state: &mut WorkflowState,
        node: &model::NodeDefinition,
        error: ErrorDetails,
    ) -> Result<(), EngineError> {
        let mut node_state = NodeState::queued(state.run_id, &node.id);
        apply_node_trigger(&mut node_state, NodeTrigger::Start, self.clock.now())?;
        state.current_nodes.insert(node.id.clone());
        self.settle_node_failure(parsed, state, node_state, error, false)
            .await?;
        Ok(())
    }

    /// Create SKIPPED states for every node stranded behind a false
    /// condition.
    async fn skip_branch(
        &self,
        parsed: &ParsedWorkflow,
        state: &mut WorkflowState,
        condition_id: &str,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let mut skipped = Vec::new();
        for node_id in parsed.skip_set_for_condition(condition_id) {
            if state.completed_nodes.contains(&node_id)
                || state.failed_nodes.contains(&node_id)
                || state.current_nodes.contains(&node_id)
            {
                continue;
            }
            let mut node_state = NodeState::queued(state.run_id, &node_id);
            apply_node_trigger(&mut node_state, NodeTrigger::Skip, now)?;
            state.skipped_nodes.insert(node_id);
            skipped.push(node_state);
        }
        if !skipped.is_empty() {
            info!(
                run_id = %state.run_id,
                condition = condition_id,
                skipped = skipped.len(),
                "condition pruned branch"
            );
            self.store.batch_put_node_states(&skipped).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run outcomes
    // -----------------------------------------------------------------------

    async fn complete_run(&self, state: &mut WorkflowState) -> Result<(), EngineError> {
        apply_run_trigger(state, RunTrigger::Complete, self.clock.now())?;
        self.store.put_workflow_state(state).await?;
        info!(
            run_id = %state.run_id,
            completed = state.completed_nodes.len(),
            skipped = state.skipped_nodes.len(),
            "workflow run completed"
        );
        self.finish_run(state.run_id).await;
        Ok(())
    }

    /// Terminal failure: FAILED, then the compensation detour when the
    /// error class and plan warrant one, landing back on FAILED.
    async fn fail_run(
        &self,
        parsed: &ParsedWorkflow,
        state: &mut WorkflowState,
    ) -> Result<(), EngineError> {
        let error = state
            .error_details
            .clone()
            .unwrap_or_else(|| ErrorDetails::new("WORKFLOW_FAILED", "workflow made no progress"));

        apply_run_trigger(state, RunTrigger::Fail, self.clock.now())?;
        self.store.put_workflow_state(state).await?;

        self.errors.report(
            ErrorLogEntry::new(
                ErrorLevel::Error,
                ErrorCategory::Workflow,
                error.code.clone(),
                format!("workflow run {} failed: {}", state.run_id, error.message),
            )
            .with_context(json!({
                "runId": state.run_id,
                "workflowId": state.workflow_id,
                "failedNodes": state.failed_nodes,
            })),
        );

        if self.config.enable_compensation && compensation::is_compensatable(&error) {
            let plan = compensation::build_plan(parsed, state);
            if !plan.is_empty() {
                apply_run_trigger(state, RunTrigger::Start, self.clock.now())?;
                self.store.put_workflow_state(state).await?;
                info!(
                    run_id = %state.run_id,
                    steps = plan.steps.len(),
                    "compensation started"
                );
                self.compensations
                    .insert(state.run_id, CompensationProgress::new(plan));
                return self.drive_compensation(state).await;
            }
        }

        self.finish_run(state.run_id).await;
        Ok(())
    }

    /// Dispatch the current compensation step.  Dispatch refusals settle
    /// the step in place (tolerated types advance, others abort); a
    /// successful dispatch waits for the step's result on the bus.
    async fn drive_compensation(&self, state: &mut WorkflowState) -> Result<(), EngineError> {
        loop {
            let step = {
                let Some(progress) = self.compensations.get(&state.run_id) else {
                    return Ok(());
                };
                progress.current().cloned()
            };
            let Some(step) = step else {
                return self.finish_compensation(state, false).await;
            };

            match self.compensation.dispatch_step(state, &step).await {
                Ok(()) => return Ok(()),
                Err(_) => {
                    let tolerated = self
                        .compensations
                        .get(&state.run_id)
                        .map(|p| p.current_tolerates_failure())
                        .unwrap_or(false);
                    if tolerated {
                        if let Some(mut progress) = self.compensations.get_mut(&state.run_id) {
                            progress.index += 1;
                        }
                        continue;
                    }
                    return self.finish_compensation(state, true).await;
                }
            }
        }
    }

    /// Apply one compensation step's terminal outcome and move the plan
    /// forward.  Results for anything but the current step are stale and
    /// ignored.
    async fn on_compensation_step_settled(
        &self,
        state: &mut WorkflowState,
        step_id: &str,
        success: bool,
    ) -> Result<(), EngineError> {
        let verdict = {
            let Some(mut progress) = self.compensations.get_mut(&state.run_id) else {
                return Ok(());
            };
            match progress.current() {
                Some(step) if step.step_id == step_id => {
                    if success || progress.current_tolerates_failure() {
                        if !success {
                            warn!(
                                run_id = %state.run_id,
                                step = step_id,
                                "tolerated compensation failure; continuing plan"
                            );
                        }
                        progress.index += 1;
                        true
                    } else {
                        false
                    }
                }
                _ => return Ok(()),
            }
        };

        if verdict {
            self.drive_compensation(state).await
        } else {
            self.finish_compensation(state, true).await
        }
    }

    /// Land the run back on FAILED once the plan completes or aborts.
    async fn finish_compensation(
        &self,
        state: &mut WorkflowState,
        aborted: bool,
    ) -> Result<(), EngineError> {
        self.compensations.remove(&state.run_id);
        apply_run_trigger(state, RunTrigger::Complete, self.clock.now())?;
        self.store.put_workflow_state(state).await?;
        if aborted {
            warn!(run_id = %state.run_id, "compensation plan aborted");
        } else {
            info!(run_id = %state.run_id, "compensation plan completed");
        }
        self.finish_run(state.run_id).await;
        Ok(())
    }

    /// Timeout a run: fire the `timeout` trigger and clean up like a
    /// failure, without compensation.
    async fn timeout_run(
        &self,
        state: &mut WorkflowState,
    ) -> Result<(), EngineError> {
        apply_run_trigger(state, RunTrigger::Timeout, self.clock.now())?;

        for node_state in self.store.get_all_node_states(state.run_id).await? {
            if node_state.status == NodeStatus::Running {
                self.dispatcher
                    .publish_cancel(state, &node_state.node_id, "workflow timed out")
                    .await;
            }
        }

        state.error_details = Some(ErrorDetails::new(
            "WORKFLOW_TIMEOUT",
            "workflow exceeded its execution deadline",
        ));
        self.store.put_workflow_state(state).await?;
        self.errors.report(ErrorLogEntry::new(
            ErrorLevel::Error,
            ErrorCategory::Workflow,
            "WORKFLOW_TIMEOUT",
            format!("workflow run {} timed out", state.run_id),
        ));
        self.finish_run(state.run_id).await;
        Ok(())
    }

    /// Release this instance's hold on a finished run.
    async fn finish_run(&self, run_id: Uuid) {
        self.plans.remove(&run_id);
        self.compensations.remove(&run_id);
        if let Some((_, lock)) = self.locks.remove(&run_id) {
            if let Err(err) = lock.release(self.store.as_ref()).await {
                warn!(%run_id, error = %err, "run lock release failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// Poll the retry schedule and re-dispatch due nodes.
    pub async fn run_retry_processor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.retry_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.process_due_retries().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("retry processor stopped");
    }

    async fn process_due_retries(&self) {
        let due = match self
            .store
            .due_retries(self.clock.now(), self.config.retry_batch_limit)
            .await
        {
            Ok(due) => due,
            Err(err) => {
                self.report_system_error("RETRY_SCHEDULE_READ", &err.to_string());
                return;
            }
        };

        for entry in due {
            if let Err(err) = self.redispatch(&entry).await {
                self.report_system_error("RETRY_REDISPATCH", &err.to_string());
            }
        }
    }

    /// Re-dispatch one due retry entry with the next attempt number.
    async fn redispatch(&self, entry: &RetryScheduleEntry) -> Result<(), EngineError> {
        let run_id = entry.run_id;
        let node_id = entry.node_id.as_str();

        let Some(mut state) = self.store.get_workflow_state(run_id).await? else {
            self.store.remove_from_retry_schedule(run_id, node_id).await?;
            return Ok(());
        };
        if state.status == RunStatus::Paused {
            // Leave the entry; it re-pops after resume.
            return Ok(());
        }
        if state.status != RunStatus::Running {
            self.store.remove_from_retry_schedule(run_id, node_id).await?;
            return Ok(());
        }

        let Some(mut node_state) = self.store.get_node_state(run_id, node_id).await? else {
            self.store.remove_from_retry_schedule(run_id, node_id).await?;
            return Ok(());
        };
        if node_state.status != NodeStatus::Retrying {
            self.store.remove_from_retry_schedule(run_id, node_id).await?;
            return Ok(());
        }

        self.store.remove_from_retry_schedule(run_id, node_id).await?;

        let parsed = self.parsed_for(&state).await?;
        let (Some(node), Some(node_type)) = (parsed.node(node_id).cloned(), parsed.node_type(node_id))
        else {
            return Ok(());
        };

        apply_node_trigger(&mut node_state, NodeTrigger::Queue, self.clock.now())?;
        node_state.attempt += 1;

        let input = match context::resolve_input(&node, &state.context) {
            Ok(input) => input,
            Err(_) => node_state.input.clone().unwrap_or_else(|| json!({})),
        };

        debug!(%run_id, node_id, attempt = node_state.attempt, "re-dispatching retry");
        state.current_nodes.insert(node_id.to_string());
        let mut item = DispatchItem {
            node,
            node_type,
            node_state,
            input,
        };
        match self.dispatcher.dispatch(&state, &mut item).await {
            Ok(()) => self.store.put_workflow_state(&state).await.map_err(Into::into),
            Err(_) => {
                let error = item
                    .node_state
                    .error_details
                    .clone()
                    .unwrap_or_else(|| ErrorDetails::new("DISPATCH_FAILED", "publish failed"));
                match self
                    .settle_node_failure(&parsed, &mut state, item.node_state, error, false)
                    .await?
                {
                    FailureOutcome::Retried => {
                        self.store.put_workflow_state(&state).await.map_err(Into::into)
                    }
                    FailureOutcome::Settled => self.advance(&parsed, &mut state).await,
                }
            }
        }
    }

    /// Scan for workflow- and node-level deadline violations.
    pub async fn run_timeout_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.timeout_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan_timeouts().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("timeout monitor stopped");
    }

    async fn scan_timeouts(&self) {
        let run_ids = match self.store.list_run_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                self.report_system_error("TIMEOUT_SCAN", &err.to_string());
                return;
            }
        };

        for run_id in run_ids {
            // Mutating a run requires its lock; only handle runs this
            // instance already owns.
            if !self.locks.contains_key(&run_id) {
                continue;
            }
            if let Err(err) = self.check_run_deadlines(run_id).await {
                self.report_system_error("TIMEOUT_ENFORCEMENT", &err.to_string());
            }
        }
    }

    async fn check_run_deadlines(&self, run_id: Uuid) -> Result<(), EngineError> {
        let Some(mut state) = self.store.get_workflow_state(run_id).await? else {
            return Ok(());
        };
        let now = self.clock.now();

        if state.status == RunStatus::Compensating {
            return self.check_compensation_deadline(&mut state, now).await;
        }
        if state.status != RunStatus::Running {
            return Ok(());
        }

        let run_deadline = state.started_at
            + chrono::Duration::from_std(self.config.workflow_execution_timeout)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        if now >= run_deadline {
            warn!(%run_id, "workflow deadline exceeded");
            return self.timeout_run(&mut state).await;
        }

        let parsed = self.parsed_for(&state).await?;
        let mut timed_out = Vec::new();
        for mut node_state in self.store.get_all_node_states(run_id).await? {
            if node_state.status != NodeStatus::Running {
                continue;
            }
            let Some(started_at) = node_state.started_at else {
                continue;
            };
            let budget_ms = parsed
                .node(&node_state.node_id)
                .map(|n| n.timeout_ms)
                .unwrap_or(self.config.node_execution_timeout.as_millis() as u64);
            if now >= started_at + chrono::Duration::milliseconds(budget_ms as i64) {
                warn!(%run_id, node_id = %node_state.node_id, "node deadline exceeded");
                apply_node_trigger(&mut node_state, NodeTrigger::Timeout, now)?;
                node_state.error_details = Some(ErrorDetails::new(
                    "NODE_TIMEOUT",
                    "node exceeded its execution deadline",
                ));
                self.dispatcher
                    .publish_cancel(&state, &node_state.node_id, "node timed out")
                    .await;
                timed_out.push(node_state);
            }
        }

        if timed_out.is_empty() {
            return Ok(());
        }

        self.store.batch_put_node_states(&timed_out).await?;
        for node_state in &timed_out {
            state.current_nodes.remove(&node_state.node_id);
            state.failed_nodes.insert(node_state.node_id.clone());
            if state.error_details.is_none() {
                state.error_details = node_state.error_details.clone();
            }
        }
        self.advance(&parsed, &mut state).await
    }

    /// Enforce the per-step budget on the compensation step in flight.
    async fn check_compensation_deadline(
        &self,
        state: &mut WorkflowState,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), EngineError> {
        let step_id = {
            let Some(progress) = self.compensations.get(&state.run_id) else {
                return Ok(());
            };
            match progress.current() {
                Some(step) => step.step_id.clone(),
                None => return Ok(()),
            }
        };

        let Some(mut node_state) = self.store.get_node_state(state.run_id, &step_id).await? else {
            return Ok(());
        };
        if node_state.status != NodeStatus::Running {
            return Ok(());
        }
        let Some(started_at) = node_state.started_at else {
            return Ok(());
        };
        let budget = chrono::Duration::from_std(compensation::STEP_TIMEOUT)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        if now < started_at + budget {
            return Ok(());
        }

        warn!(run_id = %state.run_id, step = %step_id, "compensation step timed out");
        apply_node_trigger(&mut node_state, NodeTrigger::Timeout, now)?;
        node_state.error_details = Some(ErrorDetails::new(
            "NODE_TIMEOUT",
            "compensation step exceeded its budget",
        ));
        self.store.put_node_state(&node_state).await?;
        self.on_compensation_step_settled(state, &step_id, false).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn load_state(&self, run_id: Uuid) -> Result<WorkflowState, EngineError> {
        self.store
            .get_workflow_state(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// The parsed plan for a run, rebuilt from the definition on a cache
    /// miss (results may arrive on an instance that did not start the run).
    async fn parsed_for(&self, state: &WorkflowState) -> Result<Arc<ParsedWorkflow>, EngineError> {
        if let Some(parsed) = self.plans.get(&state.run_id) {
            return Ok(Arc::clone(&parsed));
        }
        let definition = self
            .repository
            .get(&state.workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(state.workflow_id.clone()))?;
        let parsed = Arc::new(dag::parse(&definition).map_err(EngineError::Validation)?);
        self.plans.insert(state.run_id, Arc::clone(&parsed));
        Ok(parsed)
    }

    fn report_system_error(&self, code: &str, message: &str) {
        self.errors.report(ErrorLogEntry::new(
            ErrorLevel::Fatal,
            ErrorCategory::System,
            code,
            message,
        ));
    }
}

/// A condition node rejects its branch by returning `result: false` (or
/// the legacy `conditionMet: false`).
fn condition_rejected(output: &Value) -> bool {
    output
        .get("result")
        .or_else(|| output.get("conditionMet"))
        .and_then(Value::as_bool)
        == Some(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_output_forms() {
        assert!(condition_rejected(&json!({"result": false})));
        assert!(condition_rejected(&json!({"conditionMet": false})));
        assert!(!condition_rejected(&json!({"result": true})));
        assert!(!condition_rejected(&json!({})));
    }
}
