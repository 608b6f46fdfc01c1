//! Per-service circuit breaker.
//!
//! Failure accounting is shared across engine instances through the state
//! store, so every instance fails fast once a service degrades.  The
//! breaker is consulted before dispatching to a service and fed by result
//! consumption; `execute` additionally wraps in-process operations.

use chrono::Duration;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use model::{CircuitRecord, CircuitState, Clock};
use store::StateStore;

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Absolute failure count that opens the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects before probing.
    pub recovery_timeout_ms: u64,
    /// Below this request volume the failure rate is not judged.
    pub minimum_throughput: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            minimum_throughput: 10,
        }
    }
}

pub struct CircuitBreaker {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    async fn load(&self, service: &str) -> CircuitRecord {
        self.store
            .get_circuit(service)
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// Gate a call on the service's circuit.
    ///
    /// # Errors
    /// [`EngineError::CircuitOpen`] while the circuit rejects calls.  An
    /// open circuit past its recovery deadline flips to HALF_OPEN and lets
    /// one trial call through.
    pub async fn preflight(&self, service: &str) -> Result<(), EngineError> {
        let mut record = self.load(service).await;
        match record.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let now = self.clock.now();
                let next_retry_at = record
                    .next_retry_at
                    .unwrap_or_else(|| now + Duration::milliseconds(self.config.recovery_timeout_ms as i64));

                if now >= next_retry_at {
                    info!(service, "circuit half-open; allowing trial call");
                    record.state = CircuitState::HalfOpen;
                    if let Err(err) = self.store.put_circuit(service, &record).await {
                        warn!(service, error = %err, "failed to persist half-open circuit");
                    }
                    return Ok(());
                }

                Err(EngineError::CircuitOpen {
                    service: service.to_string(),
                    next_retry_at,
                })
            }
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self, service: &str) {
        let mut record = self.load(service).await;
        match record.state {
            CircuitState::HalfOpen => {
                info!(service, "trial call succeeded; circuit closed");
                record = CircuitRecord::default();
                record.success_count = 1;
                record.total_requests = 1;
            }
            _ => {
                record.success_count += 1;
                record.total_requests += 1;
            }
        }
        if let Err(err) = self.store.put_circuit(service, &record).await {
            warn!(service, error = %err, "failed to persist circuit success");
        }
    }

    /// Record a failed call; may open the circuit.
    pub async fn record_failure(&self, service: &str) {
        let now = self.clock.now();
        let mut record = self.load(service).await;

        match record.state {
            CircuitState::HalfOpen => {
                warn!(service, "trial call failed; circuit re-opened");
                record.state = CircuitState::Open;
                record.failure_count += 1;
                record.total_requests += 1;
                record.last_failure_at = Some(now);
                record.next_retry_at =
                    Some(now + Duration::milliseconds(self.config.recovery_timeout_ms as i64));
            }
            _ => {
                record.failure_count += 1;
                record.total_requests += 1;
                record.last_failure_at = Some(now);

                let failure_rate = record.failure_count as f64 / record.total_requests as f64;
                let should_open = record.total_requests >= self.config.minimum_throughput
                    && (record.failure_count >= self.config.failure_threshold
                        || failure_rate > 0.5);
                if should_open && record.state != CircuitState::Open {
                    warn!(
                        service,
                        failures = record.failure_count,
                        total = record.total_requests,
                        "circuit opened"
                    );
                    record.state = CircuitState::Open;
                    record.next_retry_at =
                        Some(now + Duration::milliseconds(self.config.recovery_timeout_ms as i64));
                }
            }
        }

        if let Err(err) = self.store.put_circuit(service, &record).await {
            warn!(service, error = %err, "failed to persist circuit failure");
        }
    }

    /// Wrap an in-process operation with the full breaker protocol.
    pub async fn execute<T, F, Fut>(&self, service: &str, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.preflight(service).await?;
        match op().await {
            Ok(value) => {
                self.record_success(service).await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure(service).await;
                Err(err)
            }
        }
    }

    /// Current record, for introspection and tests.
    pub async fn snapshot(&self, service: &str) -> CircuitRecord {
        self.load(service).await
    }
}
