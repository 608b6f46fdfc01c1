//! Engine configuration.

use std::time::Duration;
use uuid::Uuid;

/// Tuning knobs for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unique per process; used as the lock holder identity.
    pub instance_id: String,
    /// Ceiling on runs owned by this instance at once.
    pub max_concurrent_workflows: usize,
    /// Fallback per-attempt deadline when a node declares none.
    pub node_execution_timeout: Duration,
    /// Whole-run deadline.
    pub workflow_execution_timeout: Duration,
    /// Run lock lease; renewed at a third of this.
    pub lock_ttl: Duration,
    /// Retry processor cadence.
    pub retry_poll_interval: Duration,
    /// Due entries popped per retry tick.
    pub retry_batch_limit: usize,
    /// Timeout monitor cadence.
    pub timeout_poll_interval: Duration,
    pub enable_retry: bool,
    pub enable_circuit_breaker: bool,
    pub enable_compensation: bool,
    pub enable_alerting: bool,
    /// Handler attempts per bus message before dead-lettering.
    pub max_retry_attempts: u32,
    /// Circuit breaker failure threshold.
    pub circuit_breaker_threshold: u32,
    /// Default cooldown for alert rules.
    pub alert_cooldown: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("engine-{}", Uuid::new_v4()),
            max_concurrent_workflows: 100,
            node_execution_timeout: Duration::from_millis(300_000),
            workflow_execution_timeout: Duration::from_millis(3_600_000),
            lock_ttl: Duration::from_secs(300),
            retry_poll_interval: Duration::from_secs(5),
            retry_batch_limit: 50,
            timeout_poll_interval: Duration::from_secs(30),
            enable_retry: true,
            enable_circuit_breaker: true,
            enable_compensation: true,
            enable_alerting: true,
            max_retry_attempts: 3,
            circuit_breaker_threshold: 5,
            alert_cooldown: Duration::from_millis(300_000),
        }
    }
}

impl EngineConfig {
    /// Lock renewal cadence derived from the lease length.
    pub fn lock_renew_interval(&self) -> Duration {
        self.lock_ttl / 3
    }
}
