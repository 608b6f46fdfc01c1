//! Per-node-type metadata: request topics, external services, default
//! retry policies, and synthesized compensation.
//!
//! These tables are fixed at startup; the dispatcher and the error
//! handling pipeline read them, never mutate them.

use model::{NodeType, RetryPolicy};
use serde::{Deserialize, Serialize};

use bus::topics;

// ---------------------------------------------------------------------------
// Request topics
// ---------------------------------------------------------------------------

/// The bus topic a node type's execution requests are published to.
pub fn topic_for(node_type: NodeType) -> &'static str {
    match node_type {
        NodeType::IdentityProvision | NodeType::IdentityDeprovision => topics::IDENTITY_EXECUTE,
        NodeType::EmailSend => topics::EMAIL_EXECUTE,
        NodeType::CalendarSchedule => topics::CALENDAR_EXECUTE,
        NodeType::SlackMessage | NodeType::SlackChannelInvite => topics::SLACK_EXECUTE,
        NodeType::DocumentDistribute => topics::DOCUMENT_EXECUTE,
        NodeType::AiGenerateContent => topics::AI_EXECUTE,
        NodeType::WebhookCall => topics::WEBHOOK_EXECUTE,
        NodeType::Delay | NodeType::Condition | NodeType::Parallel | NodeType::Compensation => {
            topics::WORKFLOW_CONTROL
        }
    }
}

// ---------------------------------------------------------------------------
// External services (circuit breaker scope)
// ---------------------------------------------------------------------------

/// The external service a node type calls, for circuit-breaker accounting.
/// Control nodes run inside the platform and have none.
pub fn service_for(node_type: NodeType) -> Option<&'static str> {
    match node_type {
        NodeType::IdentityProvision | NodeType::IdentityDeprovision => Some("identity-service"),
        NodeType::EmailSend => Some("email-service"),
        NodeType::CalendarSchedule => Some("calendar-service"),
        NodeType::SlackMessage | NodeType::SlackChannelInvite => Some("slack-service"),
        NodeType::DocumentDistribute => Some("document-service"),
        NodeType::AiGenerateContent => Some("ai-service"),
        NodeType::WebhookCall => Some("webhook-service"),
        NodeType::Delay | NodeType::Condition | NodeType::Parallel | NodeType::Compensation => None,
    }
}

// ---------------------------------------------------------------------------
// Default retry policies
// ---------------------------------------------------------------------------

/// The effective default policy for a node type: the global default with
/// the per-type overrides applied.  A per-node `retry_policy` in the
/// definition overrides both.
pub fn default_retry_policy(node_type: NodeType) -> RetryPolicy {
    let base = RetryPolicy::default();
    match node_type {
        NodeType::IdentityProvision => RetryPolicy {
            max_retries: 5,
            backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            ..base
        },
        NodeType::EmailSend => RetryPolicy {
            max_retries: 3,
            backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            ..base
        },
        NodeType::WebhookCall => RetryPolicy {
            max_retries: 3,
            backoff_ms: 500,
            max_backoff_ms: 15_000,
            ..base
        },
        NodeType::AiGenerateContent => RetryPolicy {
            max_retries: 2,
            backoff_ms: 5_000,
            max_backoff_ms: 120_000,
            ..base
        },
        NodeType::CalendarSchedule => RetryPolicy {
            max_retries: 4,
            backoff_ms: 1_500,
            max_backoff_ms: 45_000,
            ..base
        },
        _ => base,
    }
}

// ---------------------------------------------------------------------------
// Compensation synthesis
// ---------------------------------------------------------------------------

/// Classification of a compensation step.  `Cleanup` and `Notification`
/// steps never abort the rest of the plan when they fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationType {
    Rollback,
    Cleanup,
    Notification,
    Custom,
}

/// A reverse action synthesized for a completed forward node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthesizedCompensation {
    pub reverse_type: NodeType,
    pub compensation_type: CompensationType,
    /// Plan position; higher orders run first.
    pub order: i32,
}

/// The synthesized reverse action for a forward node type, when its side
/// effects warrant one.
pub fn compensation_for(node_type: NodeType) -> Option<SynthesizedCompensation> {
    match node_type {
        NodeType::IdentityProvision => Some(SynthesizedCompensation {
            reverse_type: NodeType::IdentityDeprovision,
            compensation_type: CompensationType::Rollback,
            order: 100,
        }),
        NodeType::EmailSend => Some(SynthesizedCompensation {
            reverse_type: NodeType::EmailSend,
            compensation_type: CompensationType::Notification,
            order: 10,
        }),
        NodeType::DocumentDistribute => Some(SynthesizedCompensation {
            reverse_type: NodeType::Compensation,
            compensation_type: CompensationType::Cleanup,
            order: 50,
        }),
        _ => None,
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_node_type_has_a_topic() {
        for t in NodeType::ALL {
            assert!(!topic_for(t).is_empty());
        }
    }

    #[test]
    fn control_nodes_have_no_external_service() {
        assert_eq!(service_for(NodeType::Condition), None);
        assert_eq!(service_for(NodeType::Delay), None);
        assert_eq!(service_for(NodeType::EmailSend), Some("email-service"));
    }

    #[test]
    fn per_type_policy_overrides_only_named_fields() {
        let policy = default_retry_policy(NodeType::IdentityProvision);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.backoff_ms, 2_000);
        assert_eq!(policy.max_backoff_ms, 60_000);
        // Inherited from the global default.
        assert_eq!(policy.multiplier, 2.0);
        assert!(policy.jitter);

        let fallback = default_retry_policy(NodeType::SlackMessage);
        assert_eq!(fallback, RetryPolicy::default());
    }

    #[test]
    fn provisioning_compensates_with_deprovisioning() {
        let comp = compensation_for(NodeType::IdentityProvision).unwrap();
        assert_eq!(comp.reverse_type, NodeType::IdentityDeprovision);
        assert_eq!(comp.compensation_type, CompensationType::Rollback);
        assert_eq!(comp.order, 100);

        assert!(compensation_for(NodeType::SlackMessage).is_none());
    }
}
