//! Retry management: error classification, back-off computation, and the
//! effective-policy merge.
//!
//! Retry waits are never realised in process; the orchestrator schedules
//! `(run, node)` into the store's time-indexed queue and a background
//! processor re-dispatches due entries.

use rand::Rng;

use model::{ErrorDetails, NodeDefinition, NodeType, RetryPolicy};
use nodes::default_retry_policy;

/// Message fragments that mark a transport-level transient failure.
const TRANSIENT_FRAGMENTS: &[&str] = &[
    "econnreset",
    "etimedout",
    "enotfound",
    "econnrefused",
    "socket hang up",
    "network timeout",
    "service unavailable",
    "internal server error",
    "bad gateway",
    "gateway timeout",
];

/// HTTP-style statuses that retry.
const TRANSIENT_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Error codes that retry.
const TRANSIENT_CODES: &[&str] = &[
    "EXTERNAL_SERVICE_ERROR",
    "DATABASE_ERROR",
    "REDIS_ERROR",
    "KAFKA_ERROR",
    "RATE_LIMIT_EXCEEDED",
    "CIRCUIT_BREAKER_OPEN",
];

/// Node-class-aware retry decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryManager;

impl RetryManager {
    pub fn new() -> Self {
        Self
    }

    /// The policy in force for one node: per-node override, else the
    /// node-type default (which already folds in the global default).
    pub fn effective_policy(&self, node: &NodeDefinition, node_type: NodeType) -> RetryPolicy {
        node.retry_policy
            .clone()
            .unwrap_or_else(|| default_retry_policy(node_type))
    }

    /// Is this error worth retrying at all?
    pub fn is_retryable(&self, error: &ErrorDetails) -> bool {
        let message = error.message.to_lowercase();
        let code_lower = error.code.to_lowercase();
        if TRANSIENT_FRAGMENTS
            .iter()
            .any(|fragment| message.contains(fragment) || code_lower.contains(fragment))
        {
            return true;
        }
        if let Some(status) = error.status {
            if TRANSIENT_STATUSES.contains(&status) {
                return true;
            }
        }
        TRANSIENT_CODES.iter().any(|code| error.code == *code)
    }

    /// `attempt < maxRetries` and the error classifies as transient.
    /// `attempt` is the 1-based attempt that just failed.
    pub fn should_retry(&self, policy: &RetryPolicy, attempt: u32, error: &ErrorDetails) -> bool {
        attempt < policy.max_retries && self.is_retryable(error)
    }

    /// Back-off before retry number `attempt` (1-based):
    /// `min(backoffMs × multiplier^(attempt−1), maxBackoffMs)`, with ±10%
    /// uniform jitter when the policy asks for it.
    pub fn delay_ms(&self, policy: &RetryPolicy, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = policy.backoff_ms as f64 * policy.multiplier.powi(exponent);
        let capped = raw.min(policy.max_backoff_ms as f64);

        if !policy.jitter {
            return capped as u64;
        }

        let noise = rand::thread_rng().gen_range(-0.1..=0.1);
        (capped + capped * noise).max(0.0) as u64
    }
}
