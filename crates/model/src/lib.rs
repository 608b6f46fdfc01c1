//! `model` crate — shared domain types for the OfficeFlow engine.
//!
//! Workflow definitions, run/node state records, execution context, and the
//! bus message payloads all live here so the `store`, `bus`, `nodes`, and
//! `engine` crates can share them without circular dependencies.

pub mod clock;
pub mod context;
pub mod definition;
pub mod message;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ExecutionContext, TriggerEvent, Variables};
pub use definition::{
    Dag, Edge, NodeDefinition, NodeType, Position, RetryPolicy, Trigger, WorkflowDefinition,
};
pub use message::{
    ControlAction, ErrorCategory, ErrorLevel, ErrorLogEntry, NodeCancelRequest,
    NodeExecutionRequest, NodeExecutionResult, ResultMetadata, ResultStatus, RunControlRequest,
};
pub use state::{
    CircuitRecord, CircuitState, ErrorDetails, NodeState, NodeStatus, RetryScheduleEntry,
    RunStatus, WorkflowRun, WorkflowState,
};
