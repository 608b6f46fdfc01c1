//! Scripted executor — a test double for the external executor services.
//!
//! Tests program per-node response sequences, attach the executor to a bus,
//! and the harness consumes execution requests and publishes results the
//! way the real executor fleet does.  Every call is recorded so tests can
//! assert on dispatch counts and idempotency keys.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use bus::{topics, Bus, Envelope, MessageMetadata};
use model::{
    ErrorDetails, NodeCancelRequest, NodeExecutionRequest, NodeExecutionResult, ResultMetadata,
    ResultStatus,
};

use crate::executor::{ExecutorError, NodeExecutor};

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// What the executor does for one attempt of one node.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Succeed with the given output.
    Success(Value),
    /// Fail; the engine classifies retryability from the error.
    Failure(ErrorDetails),
    /// Ask the engine for a retry outright.
    Retry(ErrorDetails),
    /// Swallow the request: no result is ever published.  Holds the node
    /// in RUNNING for cancellation and timeout tests.
    Ignore,
}

/// One observed execution request.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub node_id: String,
    pub attempt: u32,
    pub idempotency_key: String,
    pub input: Value,
}

/// Test double with per-node response sequences.
///
/// A sequence's last response repeats once the queue drains; nodes with no
/// script succeed with an empty object.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Program the response sequence for a node.
    pub fn script(&self, node_id: impl Into<String>, responses: Vec<ScriptedResponse>) {
        self.scripts
            .lock()
            .insert(node_id.into(), responses.into());
    }

    /// Program a node to always succeed with `output`.
    pub fn succeed_with(&self, node_id: impl Into<String>, output: Value) {
        self.script(node_id, vec![ScriptedResponse::Success(output)]);
    }

    fn next_response(&self, node_id: &str) -> ScriptedResponse {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(node_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| ScriptedResponse::Success(json!({}))),
            None => ScriptedResponse::Success(json!({})),
        }
    }

    /// The response the next attempt of `node_id` would receive.
    fn peek_response(&self, node_id: &str) -> Option<ScriptedResponse> {
        self.scripts
            .lock()
            .get(node_id)
            .and_then(|queue| queue.front().cloned())
    }

    /// Record a swallowed request and advance the node's script.
    fn record_ignored(&self, request: &NodeExecutionRequest) {
        self.calls.lock().push(RecordedCall {
            node_id: request.node_id.clone(),
            attempt: request.retry_attempt + 1,
            idempotency_key: request.idempotency_key.clone(),
            input: request.input.clone(),
        });
        let mut scripts = self.scripts.lock();
        if let Some(queue) = scripts.get_mut(&request.node_id) {
            if queue.len() > 1 {
                queue.pop_front();
            }
        }
    }

    /// All recorded calls, in arrival order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of execution attempts observed for one node.
    pub fn call_count(&self, node_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.node_id == node_id)
            .count()
    }
}

#[async_trait]
impl NodeExecutor for ScriptedExecutor {
    async fn execute(&self, request: &NodeExecutionRequest) -> Result<Value, ExecutorError> {
        self.calls.lock().push(RecordedCall {
            node_id: request.node_id.clone(),
            attempt: request.retry_attempt + 1,
            idempotency_key: request.idempotency_key.clone(),
            input: request.input.clone(),
        });

        match self.next_response(&request.node_id) {
            ScriptedResponse::Success(output) => Ok(output),
            ScriptedResponse::Failure(error) => Err(ExecutorError::Failed(error)),
            ScriptedResponse::Retry(error) => Err(ExecutorError::Retry(error)),
            ScriptedResponse::Ignore => Err(ExecutorError::Failed(ErrorDetails::new(
                "REQUEST_IGNORED",
                "scripted to ignore the request",
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Bus harness
// ---------------------------------------------------------------------------

/// Consumes execution requests off the bus, runs them through a
/// [`ScriptedExecutor`], and publishes results — an in-process stand-in
/// for the executor fleet.
pub struct MockExecutorService {
    executor: Arc<ScriptedExecutor>,
    cancelled: Arc<Mutex<Vec<(Uuid, String)>>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockExecutorService {
    /// Subscribe to every request topic and start serving.
    pub async fn start(bus: Arc<dyn Bus>, executor: Arc<ScriptedExecutor>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cancelled = Arc::new(Mutex::new(Vec::new()));
        let seen_keys = Arc::new(Mutex::new(HashSet::<String>::new()));
        let mut tasks = Vec::new();

        for topic in topics::REQUEST_TOPICS {
            let mut receiver = bus
                .subscribe(topic, "executors")
                .await
                .expect("in-memory subscribe cannot fail");
            let bus = Arc::clone(&bus);
            let executor = Arc::clone(&executor);
            let seen_keys = Arc::clone(&seen_keys);
            let mut shutdown = shutdown_rx.clone();

            tasks.push(tokio::spawn(async move {
                loop {
                    let delivery = tokio::select! {
                        delivery = receiver.recv() => match delivery {
                            Some(delivery) => delivery,
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    };

                    let request: NodeExecutionRequest = match delivery.envelope.payload_as() {
                        Ok(request) => request,
                        Err(err) => {
                            warn!(error = %err, "undecodable execution request");
                            continue;
                        }
                    };

                    // At-least-once delivery: replays of the same logical
                    // attempt are dropped on the idempotency key.
                    if !seen_keys.lock().insert(request.idempotency_key.clone()) {
                        debug!(key = %request.idempotency_key, "duplicate attempt ignored");
                        continue;
                    }

                    let attempt = request.retry_attempt + 1;
                    if matches!(
                        executor.peek_response(&request.node_id),
                        Some(ScriptedResponse::Ignore)
                    ) {
                        executor.record_ignored(&request);
                        continue;
                    }
                    let (status, output, error) = match executor.execute(&request).await {
                        Ok(output) => (ResultStatus::Success, Some(output), None),
                        Err(ExecutorError::Failed(error)) => {
                            (ResultStatus::Failed, None, Some(error))
                        }
                        Err(ExecutorError::Retry(error)) => (ResultStatus::Retry, None, Some(error)),
                    };

                    let result = NodeExecutionResult {
                        run_id: request.run_id,
                        node_id: request.node_id.clone(),
                        status,
                        output,
                        error,
                        metadata: ResultMetadata {
                            execution_time_ms: 1,
                            attempt,
                            timestamp: Utc::now(),
                        },
                    };

                    let metadata = MessageMetadata::new(
                        request.context.correlation_id.clone(),
                        request.org_id.clone(),
                        request.employee_id.clone(),
                    );
                    let envelope = match Envelope::new("node.execute.result", &result, metadata) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            warn!(error = %err, "failed to encode result");
                            continue;
                        }
                    };
                    if let Err(err) = bus
                        .publish(topics::NODE_RESULT, &request.org_id, envelope)
                        .await
                    {
                        warn!(error = %err, "failed to publish result");
                    }
                }
            }));
        }

        // Record best-effort cancellations so tests can assert on them.
        {
            let mut receiver = bus
                .subscribe(topics::NODE_CANCEL, "executors")
                .await
                .expect("in-memory subscribe cannot fail");
            let cancelled = Arc::clone(&cancelled);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let delivery = tokio::select! {
                        delivery = receiver.recv() => match delivery {
                            Some(delivery) => delivery,
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    };
                    if let Ok(cancel) = delivery.envelope.payload_as::<NodeCancelRequest>() {
                        cancelled.lock().push((cancel.run_id, cancel.node_id));
                    }
                }
            }));
        }

        Self {
            executor,
            cancelled,
            shutdown: shutdown_tx,
            tasks,
        }
    }

    /// Cancellations observed on `node.execute.cancel`.
    pub fn cancelled(&self) -> Vec<(Uuid, String)> {
        self.cancelled.lock().clone()
    }

    pub fn executor(&self) -> &ScriptedExecutor {
        &self.executor
    }

    /// Stop serving and wait for the consumer tasks to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use model::ExecutionContext;

    fn request(node_id: &str, attempt: u32) -> NodeExecutionRequest {
        let run_id = Uuid::new_v4();
        NodeExecutionRequest {
            run_id,
            node_id: node_id.to_string(),
            org_id: "org-1".into(),
            employee_id: "emp-1".into(),
            node_type: "email.send".into(),
            input: json!({}),
            context: ExecutionContext::default(),
            idempotency_key: NodeExecutionRequest::idempotency_key_for(run_id, node_id, attempt),
            retry_attempt: attempt - 1,
            timeout_ms: 30_000,
        }
    }

    #[tokio::test]
    async fn sequence_advances_and_last_response_repeats() {
        let executor = ScriptedExecutor::new();
        executor.script(
            "a",
            vec![
                ScriptedResponse::Failure(ErrorDetails::new("ETIMEDOUT", "timed out")),
                ScriptedResponse::Success(json!({"done": true})),
            ],
        );

        assert!(executor.execute(&request("a", 1)).await.is_err());
        assert!(executor.execute(&request("a", 2)).await.is_ok());
        // Exhausted sequences repeat their final response.
        assert!(executor.execute(&request("a", 3)).await.is_ok());
        assert_eq!(executor.call_count("a"), 3);
    }

    #[tokio::test]
    async fn unscripted_nodes_succeed_with_empty_output() {
        let executor = ScriptedExecutor::new();
        let output = executor.execute(&request("anything", 1)).await.unwrap();
        assert_eq!(output, json!({}));
    }
}
