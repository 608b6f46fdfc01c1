//! The engine service: binds store, bus, and orchestrator, and consumes
//! the platform topics.
//!
//! Inbound: `employee.{onboard,exit,transfer,update}.*` lifecycle events,
//! `workflow.run.{pause,resume,cancel}` control messages, and
//! `node.execute.result`.  The lifecycle operations are also exposed as
//! the public API of this type for in-process callers.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use bus::{run_consumer, run_dlq_processor, topics, Bus, ConsumerOptions, Delivery};
use model::{Clock, ExecutionContext, NodeExecutionResult, RunControlRequest, Trigger,
    TriggerEvent, WorkflowRun, WorkflowState};
use store::StateStore;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::initial_context;
use crate::error::EngineError;
use crate::error_log::{AlertManager, ErrorLogger};
use crate::orchestrator::Orchestrator;
use crate::repository::WorkflowRepository;

/// Consumer group shared by every engine instance.
const CONSUMER_GROUP: &str = "workflow-engine";

pub struct EngineService {
    orchestrator: Arc<Orchestrator>,
    clock: Arc<dyn Clock>,
    repository: Arc<dyn WorkflowRepository>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    logger_task: JoinHandle<()>,
    errors: ErrorLogger,
}

impl EngineService {
    /// Wire the components and start every consumer and background loop.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        bus: Arc<dyn Bus>,
        repository: Arc<dyn WorkflowRepository>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let alerts = config
            .enable_alerting
            .then(|| AlertManager::with_default_rules(Arc::clone(&clock), config.alert_cooldown));
        let (errors, logger_task) =
            ErrorLogger::start(Arc::clone(&store), Arc::clone(&bus), alerts);

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&clock),
            Arc::clone(&repository),
            errors.clone(),
            config.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer_options = ConsumerOptions {
            handler_attempts: config.max_retry_attempts,
        };
        let mut tasks = Vec::new();

        // Background loops.
        tasks.push(tokio::spawn(
            Arc::clone(&orchestrator).run_retry_processor(shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&orchestrator).run_timeout_monitor(shutdown_rx.clone()),
        ));

        // Lifecycle events start runs.
        for pattern in topics::EMPLOYEE_PATTERNS {
            let orchestrator = Arc::clone(&orchestrator);
            let repository = Arc::clone(&repository);
            let clock = Arc::clone(&clock);
            let bus = Arc::clone(&bus);
            let options = consumer_options.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let result = run_consumer(bus, pattern, CONSUMER_GROUP, options, shutdown, {
                    move |delivery| {
                        let orchestrator = Arc::clone(&orchestrator);
                        let repository = Arc::clone(&repository);
                        let clock = Arc::clone(&clock);
                        async move {
                            handle_lifecycle_event(&orchestrator, &repository, &clock, delivery)
                                .await
                        }
                    }
                })
                .await;
                if let Err(err) = result {
                    warn!(pattern, error = %err, "lifecycle consumer exited");
                }
            }));
        }

        // Run control.
        for topic in [topics::RUN_PAUSE, topics::RUN_RESUME, topics::RUN_CANCEL] {
            let orchestrator = Arc::clone(&orchestrator);
            let bus = Arc::clone(&bus);
            let options = consumer_options.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let result = run_consumer(bus, topic, CONSUMER_GROUP, options, shutdown, {
                    move |delivery| {
                        let orchestrator = Arc::clone(&orchestrator);
                        async move { handle_run_control(&orchestrator, delivery).await }
                    }
                })
                .await;
                if let Err(err) = result {
                    warn!(topic, error = %err, "control consumer exited");
                }
            }));
        }

        // Executor results.
        {
            let orchestrator = Arc::clone(&orchestrator);
            let bus = Arc::clone(&bus);
            let options = consumer_options.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let result =
                    run_consumer(bus, topics::NODE_RESULT, CONSUMER_GROUP, options, shutdown, {
                        move |delivery| {
                            let orchestrator = Arc::clone(&orchestrator);
                            async move { handle_node_result(&orchestrator, delivery).await }
                        }
                    })
                    .await;
                if let Err(err) = result {
                    warn!(error = %err, "result consumer exited");
                }
            }));
        }

        // Dead-letter re-submission.
        {
            let bus = Arc::clone(&bus);
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = run_dlq_processor(bus, CONSUMER_GROUP, shutdown).await {
                    warn!(error = %err, "dlq processor exited");
                }
            }));
        }

        info!(
            instance_id = %orchestrator.instance_id(),
            "engine service started"
        );
        Ok(Self {
            orchestrator,
            clock,
            repository,
            shutdown: shutdown_tx,
            tasks,
            logger_task,
            errors,
        })
    }

    // ------ Lifecycle RPCs ------

    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        context: ExecutionContext,
    ) -> Result<WorkflowRun, EngineError> {
        self.orchestrator.execute_workflow(workflow_id, context).await
    }

    /// Start runs for every active workflow matching a lifecycle event,
    /// exactly as the bus consumer does.
    pub async fn trigger_event(&self, event: &TriggerEvent) -> Result<Vec<WorkflowRun>, EngineError> {
        let Some(trigger) = Trigger::for_event_type(&event.event_type) else {
            return Ok(Vec::new());
        };
        let definitions = self
            .repository
            .find_active(&event.organization_id, trigger)
            .await?;

        let mut runs = Vec::new();
        for definition in definitions {
            let context = initial_context(event, self.clock.now());
            match self.orchestrator.execute_workflow(&definition.id, context).await {
                Ok(run) => runs.push(run),
                Err(err) => warn!(
                    workflow_id = %definition.id,
                    error = %err,
                    "lifecycle event did not start workflow"
                ),
            }
        }
        Ok(runs)
    }

    pub async fn pause_workflow(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.orchestrator.pause_workflow(run_id).await
    }

    pub async fn resume_workflow(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.orchestrator.resume_workflow(run_id).await
    }

    pub async fn cancel_workflow(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.orchestrator.cancel_workflow(run_id).await
    }

    pub async fn run_state(&self, run_id: Uuid) -> Result<Option<WorkflowState>, EngineError> {
        self.orchestrator.run_state(run_id).await
    }

    /// Signal every loop to stop and wait for them to drain.
    pub async fn stop(self) {
        let Self {
            orchestrator,
            shutdown,
            tasks,
            logger_task,
            errors,
            ..
        } = self;

        let _ = shutdown.send(true);
        for task in tasks {
            let _ = task.await;
        }
        // The logger task ends once every handle is gone; the orchestrator
        // holds one.
        drop(errors);
        drop(orchestrator);
        let _ = logger_task.await;
        info!("engine service stopped");
    }
}

// ---------------------------------------------------------------------------
// Message handlers
// ---------------------------------------------------------------------------

/// Start matching workflows for one lifecycle event.  Domain refusals
/// (validation, lock contention) are logged and acknowledged; only
/// infrastructure errors propagate into the consumer's retry/DLQ path.
async fn handle_lifecycle_event(
    orchestrator: &Orchestrator,
    repository: &Arc<dyn WorkflowRepository>,
    clock: &Arc<dyn Clock>,
    delivery: Delivery,
) -> Result<(), String> {
    let event: TriggerEvent = delivery
        .envelope
        .payload_as()
        .map_err(|err| format!("undecodable lifecycle event: {err}"))?;

    let Some(trigger) = Trigger::for_event_type(&event.event_type) else {
        warn!(event_type = %event.event_type, "unroutable lifecycle event");
        return Ok(());
    };

    let definitions = repository
        .find_active(&event.organization_id, trigger)
        .await
        .map_err(|err| err.to_string())?;
    info!(
        event_type = %event.event_type,
        org_id = %event.organization_id,
        matches = definitions.len(),
        "lifecycle event received"
    );

    for definition in definitions {
        let context = initial_context(&event, clock.now());
        match orchestrator.execute_workflow(&definition.id, context).await {
            Ok(run) => info!(
                workflow_id = %definition.id,
                run_id = %run.run_id,
                "workflow started from lifecycle event"
            ),
            Err(EngineError::Store(err)) => return Err(err.to_string()),
            Err(EngineError::Bus(err)) => return Err(err.to_string()),
            Err(err) => warn!(
                workflow_id = %definition.id,
                error = %err,
                "workflow not started"
            ),
        }
    }
    Ok(())
}

async fn handle_run_control(
    orchestrator: &Orchestrator,
    delivery: Delivery,
) -> Result<(), String> {
    let request: RunControlRequest = delivery
        .envelope
        .payload_as()
        .map_err(|err| format!("undecodable control message: {err}"))?;

    let outcome = match delivery.topic.as_str() {
        topics::RUN_PAUSE => orchestrator.pause_workflow(request.run_id).await,
        topics::RUN_RESUME => orchestrator.resume_workflow(request.run_id).await,
        topics::RUN_CANCEL => orchestrator.cancel_workflow(request.run_id).await,
        other => {
            warn!(topic = other, "unexpected control topic");
            return Ok(());
        }
    };

    match outcome {
        Ok(()) => Ok(()),
        // A control message racing a finished run is not a poison message.
        Err(EngineError::RunNotFound(_)) | Err(EngineError::InvalidTransition { .. }) => {
            warn!(run_id = %request.run_id, topic = %delivery.topic, "control message not applicable");
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    }
}

async fn handle_node_result(
    orchestrator: &Orchestrator,
    delivery: Delivery,
) -> Result<(), String> {
    let result: NodeExecutionResult = delivery
        .envelope
        .payload_as()
        .map_err(|err| format!("undecodable node result: {err}"))?;
    orchestrator
        .apply_result(result)
        .await
        .map_err(|err| err.to_string())
}
