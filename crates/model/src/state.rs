//! Run and node state records.
//!
//! These are the mutable records the engine persists per run.  They carry no
//! behaviour; status transitions are owned by the engine's state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use crate::context::ExecutionContext;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a whole workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Compensating,
}

impl RunStatus {
    /// Terminal states accept no further forward progress.  `FAILED` is
    /// terminal for the DAG but may still enter the compensation flow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending      => write!(f, "PENDING"),
            Self::Running      => write!(f, "RUNNING"),
            Self::Paused       => write!(f, "PAUSED"),
            Self::Completed    => write!(f, "COMPLETED"),
            Self::Failed       => write!(f, "FAILED"),
            Self::Cancelled    => write!(f, "CANCELLED"),
            Self::Timeout      => write!(f, "TIMEOUT"),
            Self::Compensating => write!(f, "COMPENSATING"),
        }
    }
}

/// Status of one node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Retrying,
    Skipped,
    Cancelled,
    Timeout,
}

impl NodeStatus {
    /// Terminal node states carry an `ended_at` timestamp.  `FAILED` may
    /// still leave through the `retry` trigger, which clears it again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled | Self::Timeout
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued    => write!(f, "QUEUED"),
            Self::Running   => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed    => write!(f, "FAILED"),
            Self::Retrying  => write!(f, "RETRYING"),
            Self::Skipped   => write!(f, "SKIPPED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Timeout   => write!(f, "TIMEOUT"),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorDetails
// ---------------------------------------------------------------------------

/// Structured error information attached to states and results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable code (e.g. `EXTERNAL_SERVICE_ERROR`).
    pub code: String,
    pub message: String,
    /// Optional HTTP-style status from the failing integration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorDetails {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
            details: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// The authoritative per-run record.
///
/// Invariants maintained by the orchestrator:
/// - the four node-ID sets are pairwise disjoint;
/// - every node in `current_nodes` has a live [`NodeState`];
/// - all four sets only contain IDs from the workflow's node set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub org_id: String,
    pub employee_id: String,
    pub status: RunStatus,
    pub current_nodes: HashSet<String>,
    pub completed_nodes: HashSet<String>,
    pub failed_nodes: HashSet<String>,
    pub skipped_nodes: HashSet<String>,
    pub context: ExecutionContext,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
}

impl WorkflowState {
    /// Fresh PENDING state for a new run.
    pub fn new(
        run_id: Uuid,
        workflow_id: impl Into<String>,
        context: ExecutionContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            workflow_id: workflow_id.into(),
            org_id: context.org_id.clone(),
            employee_id: context.employee_id.clone(),
            status: RunStatus::Pending,
            current_nodes: HashSet::new(),
            completed_nodes: HashSet::new(),
            failed_nodes: HashSet::new(),
            skipped_nodes: HashSet::new(),
            context,
            started_at: now,
            last_updated_at: now,
            error_details: None,
        }
    }

    /// Count of nodes in any settled set (completed, failed, or skipped).
    pub fn settled_count(&self) -> usize {
        self.completed_nodes.len() + self.failed_nodes.len() + self.skipped_nodes.len()
    }
}

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Per `(run, node)` execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub run_id: Uuid,
    pub node_id: String,
    pub status: NodeStatus,
    /// 1-based attempt counter; the first dispatch is attempt 1.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Set only while status is RETRYING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl NodeState {
    /// Fresh QUEUED state for a node about to be dispatched.
    pub fn queued(run_id: Uuid, node_id: impl Into<String>) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            status: NodeStatus::Queued,
            attempt: 1,
            input: None,
            output: None,
            error_details: None,
            started_at: None,
            ended_at: None,
            next_retry_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

/// Summary handed back to the caller of `execute_workflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub org_id: String,
    pub employee_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
}

impl From<&WorkflowState> for WorkflowRun {
    fn from(state: &WorkflowState) -> Self {
        Self {
            run_id: state.run_id,
            workflow_id: state.workflow_id.clone(),
            org_id: state.org_id.clone(),
            employee_id: state.employee_id.clone(),
            status: state.status,
            started_at: state.started_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker record
// ---------------------------------------------------------------------------

/// Circuit state for one external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed   => write!(f, "CLOSED"),
            Self::Open     => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

impl std::str::FromStr for CircuitState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CLOSED"    => Ok(Self::Closed),
            "OPEN"      => Ok(Self::Open),
            "HALF_OPEN" => Ok(Self::HalfOpen),
            other       => Err(format!("unknown circuit state: {other}")),
        }
    }
}

/// Shared failure accounting for one external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            last_failure_at: None,
            next_retry_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry schedule
// ---------------------------------------------------------------------------

/// One due-or-future entry in the time-indexed retry schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryScheduleEntry {
    pub run_id: Uuid,
    pub node_id: String,
    /// Epoch milliseconds at which the entry becomes due.
    pub score: i64,
}

impl RetryScheduleEntry {
    /// Member encoding used by sorted-set backends: `<runId>:<nodeId>`.
    pub fn member(&self) -> String {
        format!("{}:{}", self.run_id, self.node_id)
    }

    /// Parse the sorted-set member form back into `(run_id, node_id)`.
    pub fn parse_member(member: &str, score: i64) -> Option<Self> {
        let (run, node) = member.split_once(':')?;
        Some(Self {
            run_id: run.parse().ok()?,
            node_id: node.to_string(),
            score,
        })
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_terminality() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Timeout.is_terminal());
        assert!(!RunStatus::Compensating.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }

    #[test]
    fn node_status_terminality() {
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(!NodeStatus::Retrying.is_terminal());
        assert!(!NodeStatus::Queued.is_terminal());
    }

    #[test]
    fn node_sets_serialize_as_arrays() {
        let ctx = ExecutionContext::default();
        let mut state = WorkflowState::new(Uuid::new_v4(), "wf-1", ctx, Utc::now());
        state.completed_nodes.insert("a".into());

        let json = serde_json::to_value(&state).unwrap();
        assert!(json["completed_nodes"].is_array());

        let back: WorkflowState = serde_json::from_value(json).unwrap();
        assert!(back.completed_nodes.contains("a"));
    }

    #[test]
    fn retry_entry_member_round_trip() {
        let entry = RetryScheduleEntry {
            run_id: Uuid::new_v4(),
            node_id: "provision".into(),
            score: 1_700_000_000_000,
        };
        let parsed = RetryScheduleEntry::parse_member(&entry.member(), entry.score).unwrap();
        assert_eq!(parsed, entry);
    }
}
