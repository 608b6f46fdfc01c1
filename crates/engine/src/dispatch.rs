//! Node dispatch: typed execution requests out, best-effort cancels out.
//!
//! A dispatch transitions the node to RUNNING, persists it, and publishes
//! the request onto the node type's topic, partition-keyed by the
//! organization so one org's work stays ordered.  Publish failures mark
//! the node FAILED with `DISPATCH_FAILED`; the orchestrator routes that
//! through the normal failure pipeline.

use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use bus::{topics, Bus, Envelope, MessageMetadata};
use model::{
    Clock, ErrorDetails, NodeCancelRequest, NodeDefinition, NodeExecutionRequest, NodeState,
    NodeType, WorkflowState,
};
use nodes::topic_for;
use store::StateStore;

use crate::error::EngineError;
use crate::state_machine::{apply_node_trigger, NodeTrigger};

/// One prepared dispatch unit: a QUEUED node state with its resolved input.
pub struct DispatchItem {
    pub node: NodeDefinition,
    pub node_type: NodeType,
    pub node_state: NodeState,
    pub input: Value,
}

pub struct NodeDispatcher {
    bus: Arc<dyn Bus>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl NodeDispatcher {
    pub fn new(bus: Arc<dyn Bus>, store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { bus, store, clock }
    }

    /// Resolve the request topic for a raw node-type string.
    pub fn topic_for_raw(&self, raw: &str) -> Result<&'static str, EngineError> {
        NodeType::parse(raw)
            .map(topic_for)
            .ok_or_else(|| EngineError::NoTopicForNodeType(raw.to_string()))
    }

    /// Dispatch one node attempt.  The node state must be QUEUED with its
    /// attempt counter already set; on return it is RUNNING (published) or
    /// FAILED (publish refused).
    pub async fn dispatch(
        &self,
        run_state: &WorkflowState,
        item: &mut DispatchItem,
    ) -> Result<(), EngineError> {
        let topic = topic_for(item.node_type);
        let now = self.clock.now();
        let attempt = item.node_state.attempt;
        let idempotency_key = NodeExecutionRequest::idempotency_key_for(
            run_state.run_id,
            &item.node.id,
            attempt,
        );

        apply_node_trigger(&mut item.node_state, NodeTrigger::Start, now)?;
        item.node_state.input = Some(item.input.clone());
        self.store.put_node_state(&item.node_state).await?;

        let request = NodeExecutionRequest {
            run_id: run_state.run_id,
            node_id: item.node.id.clone(),
            org_id: run_state.org_id.clone(),
            employee_id: run_state.employee_id.clone(),
            node_type: item.node_type.as_str().to_string(),
            input: item.input.clone(),
            context: run_state.context.clone(),
            idempotency_key,
            retry_attempt: attempt - 1,
            timeout_ms: item.node.timeout_ms,
        };

        let metadata = MessageMetadata::new(
            run_state.context.correlation_id.clone(),
            run_state.org_id.clone(),
            run_state.employee_id.clone(),
        );
        let envelope = Envelope::new("node.execute.request", &request, metadata)?;

        match self.bus.publish(topic, &run_state.org_id, envelope).await {
            Ok(()) => {
                debug!(
                    run_id = %run_state.run_id,
                    node_id = %item.node.id,
                    topic,
                    attempt,
                    "node dispatched"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    run_id = %run_state.run_id,
                    node_id = %item.node.id,
                    error = %err,
                    "dispatch publish failed"
                );
                let _ = apply_node_trigger(&mut item.node_state, NodeTrigger::Fail, self.clock.now());
                item.node_state.error_details =
                    Some(ErrorDetails::new("DISPATCH_FAILED", err.to_string()));
                if let Err(store_err) = self.store.put_node_state(&item.node_state).await {
                    warn!(error = %store_err, "failed node state not persisted");
                }
                Err(EngineError::DispatchFailed {
                    node_id: item.node.id.clone(),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Dispatch a batch of eligible nodes concurrently.  Returns every
    /// item with its outcome so the caller can settle failures.
    pub async fn dispatch_nodes(
        &self,
        run_state: &WorkflowState,
        items: Vec<DispatchItem>,
    ) -> Vec<(DispatchItem, Result<(), EngineError>)> {
        join_all(items.into_iter().map(|mut item| async move {
            let outcome = self.dispatch(run_state, &mut item).await;
            (item, outcome)
        }))
        .await
    }

    /// Publish a best-effort cancellation notice.  Downstream
    /// cancellability is executor-defined; errors are logged, not raised.
    pub async fn publish_cancel(
        &self,
        run_state: &WorkflowState,
        node_id: &str,
        reason: &str,
    ) {
        let cancel = NodeCancelRequest {
            run_id: run_state.run_id,
            node_id: node_id.to_string(),
            reason: reason.to_string(),
        };
        let metadata = MessageMetadata::new(
            run_state.context.correlation_id.clone(),
            run_state.org_id.clone(),
            run_state.employee_id.clone(),
        );
        let envelope = match Envelope::new("node.execute.cancel", &cancel, metadata) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(node_id, error = %err, "cancel notice not encodable");
                return;
            }
        };
        if let Err(err) = self
            .bus
            .publish(topics::NODE_CANCEL, &run_state.org_id, envelope)
            .await
        {
            warn!(node_id, error = %err, "cancel notice not published");
        }
    }
}

/// Convenience for building a fresh first-attempt dispatch item.
pub fn first_attempt(
    run_id: Uuid,
    node: NodeDefinition,
    node_type: NodeType,
    input: Value,
) -> DispatchItem {
    DispatchItem {
        node_state: NodeState::queued(run_id, &node.id),
        node,
        node_type,
        input,
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use bus::InMemoryBus;
    use model::{ExecutionContext, NodeStatus, Position, SystemClock};
    use serde_json::json;
    use store::MemoryStore;

    fn node(id: &str, node_type: &str) -> NodeDefinition {
        NodeDefinition {
            id: id.into(),
            node_type: node_type.into(),
            name: format!("{id} step"),
            params: Value::Null,
            retry_policy: None,
            timeout_ms: 30_000,
            position: Position::default(),
        }
    }

    fn run_state() -> WorkflowState {
        let mut context = ExecutionContext::default();
        context.org_id = "org-1".into();
        context.employee_id = "emp-1".into();
        context.correlation_id = "corr-1".into();
        WorkflowState::new(Uuid::new_v4(), "wf-1", context, chrono::Utc::now())
    }

    #[tokio::test]
    async fn dispatch_publishes_request_and_marks_running() {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::new(Default::default(), clock.clone()));
        let bus = Arc::new(InMemoryBus::new());
        let mut rx = bus.subscribe(topics::EMAIL_EXECUTE, "executors").await.unwrap();

        let dispatcher = NodeDispatcher::new(bus, store.clone(), clock);
        let state = run_state();
        let mut item = first_attempt(
            state.run_id,
            node("a", "email.send"),
            NodeType::EmailSend,
            json!({"to": "x@y.z"}),
        );

        dispatcher.dispatch(&state, &mut item).await.unwrap();

        assert_eq!(item.node_state.status, NodeStatus::Running);
        let stored = store
            .get_node_state(state.run_id, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, NodeStatus::Running);

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.key, "org-1");
        let request: NodeExecutionRequest = delivery.envelope.payload_as().unwrap();
        assert_eq!(request.retry_attempt, 0);
        assert_eq!(
            request.idempotency_key,
            format!("{}:a:1", state.run_id)
        );
        assert_eq!(request.input["to"], json!("x@y.z"));
    }

    #[tokio::test]
    async fn batch_dispatch_covers_every_item() {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::new(Default::default(), clock.clone()));
        let bus = Arc::new(InMemoryBus::new());
        let mut rx = bus.subscribe(topics::SLACK_EXECUTE, "executors").await.unwrap();

        let dispatcher = NodeDispatcher::new(bus, store, clock);
        let state = run_state();
        let items = vec![
            first_attempt(state.run_id, node("a", "slack.message"), NodeType::SlackMessage, json!({})),
            first_attempt(state.run_id, node("b", "slack.message"), NodeType::SlackMessage, json!({})),
        ];

        let outcomes = dispatcher.dispatch_nodes(&state, items).await;
        assert!(outcomes.iter().all(|(_, result)| result.is_ok()));
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn unknown_raw_type_has_no_topic() {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::new(Default::default(), clock.clone()));
        let dispatcher = NodeDispatcher::new(Arc::new(InMemoryBus::new()), store, clock);

        assert!(matches!(
            dispatcher.topic_for_raw("fax.send"),
            Err(EngineError::NoTopicForNodeType(_))
        ));
        assert_eq!(
            dispatcher.topic_for_raw("email.send").unwrap(),
            topics::EMAIL_EXECUTE
        );
    }
}
