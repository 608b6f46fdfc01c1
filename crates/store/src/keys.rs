//! Key layout shared by every backend.
//!
//! All keys carry a configurable namespace prefix so multiple deployments
//! can share one store.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "officeflow:";

/// Namespaced key builder.
#[derive(Debug, Clone)]
pub struct Keyspace {
    namespace: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl Keyspace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn workflow(&self, run_id: Uuid) -> String {
        format!("{}workflow:{run_id}", self.namespace)
    }

    /// Prefix matching every workflow state key.
    pub fn workflow_pattern(&self) -> String {
        format!("{}workflow:*", self.namespace)
    }

    /// Extract the run ID back out of a workflow state key.
    pub fn run_id_of(&self, workflow_key: &str) -> Option<Uuid> {
        workflow_key
            .strip_prefix(&self.namespace)?
            .strip_prefix("workflow:")?
            .parse()
            .ok()
    }

    pub fn node(&self, run_id: Uuid, node_id: &str) -> String {
        format!("{}node:{run_id}:{node_id}", self.namespace)
    }

    /// Prefix matching every node key of one run.
    pub fn node_pattern(&self, run_id: Uuid) -> String {
        format!("{}node:{run_id}:*", self.namespace)
    }

    pub fn lock(&self, run_id: Uuid) -> String {
        format!("{}lock:workflow:{run_id}", self.namespace)
    }

    pub fn retry_schedule(&self) -> String {
        format!("{}retry:schedule", self.namespace)
    }

    pub fn circuit(&self, service: &str) -> String {
        format!("{}circuit_breaker:{service}", self.namespace)
    }

    pub fn error_log(&self, timestamp: DateTime<Utc>, id: Uuid) -> String {
        format!(
            "{}error_log:{}:{id}",
            self.namespace,
            timestamp.timestamp_millis()
        )
    }
}
