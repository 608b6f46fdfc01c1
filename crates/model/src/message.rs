//! Bus payload types.
//!
//! Everything that crosses the message bus between the engine and the
//! executor services is defined here, in the camelCase wire form the
//! platform's executors already speak.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::state::ErrorDetails;

// ---------------------------------------------------------------------------
// Node execution request
// ---------------------------------------------------------------------------

/// Typed request published to a node's execution topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionRequest {
    pub run_id: Uuid,
    pub node_id: String,
    pub org_id: String,
    pub employee_id: String,
    /// String form of the node type, e.g. `identity.provision`.
    pub node_type: String,
    /// Resolved node input after parameter mapping.
    pub input: Value,
    pub context: ExecutionContext,
    /// `<runId>:<nodeId>:<attempt>` — executors dedupe replays on it.
    pub idempotency_key: String,
    /// 0 on the first attempt, n on the n-th re-dispatch.
    pub retry_attempt: u32,
    pub timeout_ms: u64,
}

impl NodeExecutionRequest {
    /// Build the idempotency key for one logical attempt.
    pub fn idempotency_key_for(run_id: Uuid, node_id: &str, attempt: u32) -> String {
        format!("{run_id}:{node_id}:{attempt}")
    }
}

// ---------------------------------------------------------------------------
// Node execution result
// ---------------------------------------------------------------------------

/// Executor verdict for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failed,
    /// The executor asks for a retry without classifying the error itself.
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub execution_time_ms: u64,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Result consumed from `node.execute.result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionResult {
    pub run_id: Uuid,
    pub node_id: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    pub metadata: ResultMetadata,
}

// ---------------------------------------------------------------------------
// Cancellation / run control
// ---------------------------------------------------------------------------

/// Best-effort cancellation notice published to `node.execute.cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCancelRequest {
    pub run_id: Uuid,
    pub node_id: String,
    pub reason: String,
}

/// Run lifecycle action requested over `workflow.run.<action>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

impl ControlAction {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Pause  => "workflow.run.pause",
            Self::Resume => "workflow.run.resume",
            Self::Cancel => "workflow.run.cancel",
        }
    }
}

/// Payload of a run control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunControlRequest {
    pub run_id: Uuid,
}

// ---------------------------------------------------------------------------
// Error log entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorLevel {
    Error,
    Warn,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Workflow,
    Node,
    System,
    Integration,
}

/// Structured entry emitted by the error logger, persisted under
/// `error_log:<ts>:<id>` and published to `audit.events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: ErrorLevel,
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ErrorLogEntry {
    pub fn new(
        level: ErrorLevel,
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            category,
            code: code.into(),
            message: message.into(),
            context: Value::Null,
            stack_trace: None,
            tags: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_run_node_attempt() {
        let run_id = Uuid::new_v4();
        let key = NodeExecutionRequest::idempotency_key_for(run_id, "A", 2);
        assert_eq!(key, format!("{run_id}:A:2"));
    }

    #[test]
    fn result_status_uses_snake_case_wire_form() {
        assert_eq!(
            serde_json::to_string(&ResultStatus::Success).unwrap(),
            "\"success\""
        );
        let status: ResultStatus = serde_json::from_str("\"retry\"").unwrap();
        assert_eq!(status, ResultStatus::Retry);
    }

    #[test]
    fn control_actions_map_to_their_topics() {
        assert_eq!(ControlAction::Pause.topic(), "workflow.run.pause");
        assert_eq!(ControlAction::Cancel.topic(), "workflow.run.cancel");
    }
}
