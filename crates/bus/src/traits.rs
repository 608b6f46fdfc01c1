//! The `Bus` contract.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::error::BusError;

/// One message handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    /// Partition key the message was published with (the organization ID
    /// for everything this engine publishes).
    pub key: String,
    pub envelope: Envelope,
}

/// Publish/subscribe over topics with consumer groups.
///
/// Semantics the engine relies on, whatever the broker:
/// - messages with the same partition key on the same topic are delivered
///   in publish order;
/// - within one consumer group each message is delivered to exactly one
///   subscriber; distinct groups each receive a copy;
/// - delivery is at-least-once — consumers dedupe on idempotency keys.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, envelope: Envelope) -> Result<(), BusError>;

    /// Subscribe to all topics matching `pattern` (exact name, or a single
    /// `*` wildcard at either end) as a member of `group`.
    async fn subscribe(
        &self,
        pattern: &str,
        group: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BusError>;
}

/// Does `topic` match a subscription `pattern`?
///
/// Supported forms: exact name, trailing wildcard (`employee.onboard.*`),
/// and leading wildcard (`*.dlq`).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        topic.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        topic.ends_with(suffix)
    } else {
        pattern == topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_forms() {
        assert!(topic_matches("employee.onboard.*", "employee.onboard.started"));
        assert!(!topic_matches("employee.onboard.*", "employee.exit.started"));
        assert!(topic_matches("*.dlq", "email.execute.dlq"));
        assert!(!topic_matches("*.dlq", "email.execute"));
        assert!(topic_matches("node.execute.result", "node.execute.result"));
        assert!(!topic_matches("node.execute.result", "node.execute.cancel"));
    }
}
