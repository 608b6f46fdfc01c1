//! The `StateStore` contract.
//!
//! The engine only depends on this trait.  Backends must provide three
//! portable primitives on top of plain keyed reads/writes: atomic
//! set-if-absent with TTL (locks), atomic compare-and-delete (lock
//! release), and an ordered set with range-by-score (the retry schedule).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use model::{CircuitRecord, ErrorLogEntry, NodeState, RetryScheduleEntry, WorkflowState};

use crate::error::StoreError;
use crate::keys::DEFAULT_NAMESPACE;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// TTL and namespace settings shared by all backends.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub namespace: String,
    /// TTL on workflow state keys.
    pub run_ttl: Duration,
    /// TTL on node state keys.
    pub node_ttl: Duration,
    /// TTL on the retry schedule key.
    pub schedule_ttl: Duration,
    /// TTL on circuit-breaker records.
    pub circuit_ttl: Duration,
    /// TTL on error log entries.
    pub error_log_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            run_ttl: Duration::from_secs(86_400),
            node_ttl: Duration::from_secs(86_400),
            schedule_ttl: Duration::from_secs(604_800),
            circuit_ttl: Duration::from_secs(3_600),
            error_log_ttl: Duration::from_secs(604_800),
        }
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Durable, shared state for workflow runs.
///
/// Fault policy: backends map transport failures to [`StoreError`].  Read
/// operations additionally degrade — they log and return `None`/empty so a
/// flaky backend read cannot take the engine down; write operations always
/// surface the error to the caller, which fails the affected operation
/// only.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ------ Workflow state ------

    async fn get_workflow_state(&self, run_id: Uuid) -> Result<Option<WorkflowState>, StoreError>;

    async fn put_workflow_state(&self, state: &WorkflowState) -> Result<(), StoreError>;

    /// Delete the run's workflow state, every node state, and its lock.
    async fn delete_workflow_state(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Run IDs with a live workflow state key.  Used by the timeout
    /// monitor; the listing is advisory, not transactional.
    async fn list_run_ids(&self) -> Result<Vec<Uuid>, StoreError>;

    // ------ Node state ------

    async fn get_node_state(
        &self,
        run_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeState>, StoreError>;

    async fn put_node_state(&self, state: &NodeState) -> Result<(), StoreError>;

    async fn get_all_node_states(&self, run_id: Uuid) -> Result<Vec<NodeState>, StoreError>;

    /// Pipelined write of several node states.
    async fn batch_put_node_states(&self, states: &[NodeState]) -> Result<(), StoreError>;

    // ------ Distributed lock ------

    /// Atomic set-if-absent with TTL.  Returns `true` when this caller now
    /// holds the lock.
    async fn acquire_lock(
        &self,
        run_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Extend the lease iff `holder` still owns it.
    async fn renew_lock(
        &self,
        run_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Compare-and-delete.  Returns `true` only when `holder` owned the
    /// lock and it was removed.
    async fn release_lock(&self, run_id: Uuid, holder: &str) -> Result<bool, StoreError>;

    /// Current holder, if any.  Advisory (the lease may expire between the
    /// read and any decision made on it).
    async fn lock_holder(&self, run_id: Uuid) -> Result<Option<String>, StoreError>;

    // ------ Retry schedule ------

    /// Upsert `(run, node)` into the schedule, scored by `at` in epoch
    /// milliseconds.
    async fn schedule_retry(
        &self,
        run_id: Uuid,
        node_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Entries with score ≤ `now`, oldest first, capped at `limit`.
    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryScheduleEntry>, StoreError>;

    async fn remove_from_retry_schedule(
        &self,
        run_id: Uuid,
        node_id: &str,
    ) -> Result<(), StoreError>;

    /// Every scheduled entry, due or not.  Test and introspection aid.
    async fn all_scheduled_retries(&self) -> Result<Vec<RetryScheduleEntry>, StoreError>;

    // ------ Circuit breaker records ------

    async fn get_circuit(&self, service: &str) -> Result<Option<CircuitRecord>, StoreError>;

    async fn put_circuit(&self, service: &str, record: &CircuitRecord) -> Result<(), StoreError>;

    // ------ Error log ------

    async fn append_error_log(&self, entry: &ErrorLogEntry) -> Result<(), StoreError>;
}
