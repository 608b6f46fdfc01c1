//! The executor contract.
//!
//! Concrete executors live in other services and consume requests off the
//! bus; this trait is the in-process shape of that contract, implemented
//! here only by the scripted test executor.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use model::{ErrorDetails, NodeExecutionRequest};

/// Errors returned by an executor's `execute` method.
///
/// The engine classifies `Failed` errors itself (transient codes and
/// messages retry); `Retry` is an explicit executor request to retry
/// without classification.
#[derive(Debug, Error, Clone)]
pub enum ExecutorError {
    /// Attempt failed; the engine decides whether it retries.
    #[error("node execution failed: {}", .0.message)]
    Failed(ErrorDetails),

    /// Executor asks for a retry outright.
    #[error("node execution requested retry: {}", .0.message)]
    Retry(ErrorDetails),
}

/// One node-execution attempt.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Execute the request and return the node's JSON output.
    async fn execute(&self, request: &NodeExecutionRequest) -> Result<Value, ExecutorError>;
}
