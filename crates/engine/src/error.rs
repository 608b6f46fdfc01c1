//! Engine-level error types.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::dag::ValidationError;

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// The definition failed DAG validation; every violation is listed.
    #[error("workflow definition invalid: {}", format_validation(.0))]
    Validation(Vec<ValidationError>),

    // ------ Lifecycle errors ------

    /// No definition exists (or is active) under the requested ID.
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    /// No run state exists under the requested run ID.
    #[error("run '{0}' not found")]
    RunNotFound(Uuid),

    /// Another engine instance owns the run lock.
    #[error("run lock unavailable for '{0}'")]
    LockUnavailable(Uuid),

    /// This instance is at its concurrent-run ceiling.
    #[error("max concurrent workflows reached ({0})")]
    MaxConcurrentWorkflows(usize),

    /// The requested status change is not in the transition table.
    #[error("invalid transition: {from} --{trigger}-->")]
    InvalidTransition { from: String, trigger: String },

    // ------ Execution errors ------

    /// A required parameter mapping failed to resolve.
    #[error("node '{node_id}' missing required parameter '{target}'")]
    MissingRequiredParameter { node_id: String, target: String },

    /// The node type has no request topic mapping.
    #[error("no topic for node type '{0}'")]
    NoTopicForNodeType(String),

    /// Publishing the execution request failed.
    #[error("dispatch of node '{node_id}' failed: {message}")]
    DispatchFailed { node_id: String, message: String },

    /// The target service's circuit is open; fail fast.
    #[error("circuit open for '{service}' until {next_retry_at}")]
    CircuitOpen {
        service: String,
        next_retry_at: DateTime<Utc>,
    },

    // ------ Infrastructure errors ------

    #[error("state store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] bus::BusError),
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.code.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
