//! Message envelope.
//!
//! Every message on the bus is an [`Envelope`]: a type tag, a JSON payload,
//! and routing metadata.  Payloads are kept as raw JSON so consumers decode
//! only the types they handle.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BusError;

/// Source tag stamped on everything this engine publishes.
pub const SOURCE: &str = "workflow-engine";
/// Wire contract version.
pub const VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub correlation_id: String,
    pub organization_id: String,
    pub employee_id: String,
    pub source: String,
    pub version: String,
    /// Number of times this message has been dead-lettered.
    #[serde(default)]
    pub attempt_count: u32,
    /// Set on dead-lettered messages: the topic the message came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_topic: Option<String>,
}

impl MessageMetadata {
    pub fn new(
        correlation_id: impl Into<String>,
        organization_id: impl Into<String>,
        employee_id: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            organization_id: organization_id.into(),
            employee_id: employee_id.into(),
            source: SOURCE.to_string(),
            version: VERSION.to_string(),
            attempt_count: 0,
            original_topic: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag, e.g. `node.execute.request`.
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: Value,
    pub metadata: MessageMetadata,
}

impl Envelope {
    pub fn new<P: Serialize>(
        message_type: impl Into<String>,
        payload: &P,
        metadata: MessageMetadata,
    ) -> Result<Self, BusError> {
        Ok(Self {
            message_type: message_type.into(),
            payload: serde_json::to_value(payload)?,
            metadata,
        })
    }

    /// Decode the payload into a concrete message type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

/// Payload published to `<topic>.dlq` when a handler exhausts its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub original_topic: String,
    /// Total times the wrapped message has been dead-lettered, this
    /// forwarding included.
    pub attempt_count: u32,
    pub error: String,
    /// The failed message, unchanged.
    pub envelope: Envelope,
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trips_typed_payloads() {
        let metadata = MessageMetadata::new("corr-1", "org-1", "emp-1");
        let envelope =
            Envelope::new("node.execute.cancel", &json!({"reason": "test"}), metadata).unwrap();

        let payload: Value = envelope.payload_as().unwrap();
        assert_eq!(payload["reason"], "test");
        assert_eq!(envelope.metadata.source, SOURCE);
    }

    #[test]
    fn type_tag_serializes_as_type() {
        let metadata = MessageMetadata::new("corr-1", "org-1", "emp-1");
        let envelope = Envelope::new("audit.event", &json!({}), metadata).unwrap();
        let raw = serde_json::to_value(&envelope).unwrap();
        assert_eq!(raw["type"], "audit.event");
    }
}
