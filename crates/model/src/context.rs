//! Execution context and the variable tree.
//!
//! The context travels with a run: seeded from the trigger event, grown by
//! node outputs, and shipped to executors inside every dispatch.  Secrets
//! are never persisted in the clear — serialization redacts them and
//! deserialization yields an empty secret map to be reloaded from the
//! secret source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// TriggerEvent
// ---------------------------------------------------------------------------

/// A lifecycle event that can start workflow runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    /// Full event type, e.g. `employee.onboard.started`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub organization_id: String,
    pub employee_id: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// Nested JSON variable tree addressed by dotted paths.
///
/// `set_path("nodes.A.output", v)` creates intermediate objects as needed;
/// `get_path` walks them.  Paths never index into arrays — the platform's
/// parameter mappings only address object members.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(pub Map<String, Value>);

impl Variables {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Walk a dotted path; `None` when any segment is missing or a
    /// non-object is traversed.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.0.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Set a value at a dotted path, creating intermediate objects.  An
    /// intermediate non-object value is replaced by an object.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };

        let mut current = &mut self.0;
        for segment in parents {
            let slot = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            current = slot.as_object_mut().unwrap();
        }
        current.insert(last.to_string(), value);
    }

    /// Merge every member of a JSON object under the given path prefix.
    /// Non-object values are stored whole at the prefix instead.
    pub fn merge_object_at(&mut self, prefix: &str, value: &Value) {
        match value.as_object() {
            Some(members) => {
                for (key, member) in members {
                    self.set_path(&format!("{prefix}.{key}"), member.clone());
                }
            }
            None => self.set_path(prefix, value.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// The full execution context for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub org_id: String,
    pub employee_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<TriggerEvent>,
    #[serde(default)]
    pub variables: Variables,
    /// Credentials scoped to this run.  Redacted on serialize; reloaded
    /// from the secret source after deserialize.
    #[serde(
        default,
        serialize_with = "redact_secrets",
        deserialize_with = "discard_secrets"
    )]
    pub secrets: HashMap<String, String>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_context: Option<Box<ExecutionContext>>,
}

/// Literal stored in place of every secret value.
pub const REDACTED: &str = "[REDACTED]";

fn redact_secrets<S>(secrets: &HashMap<String, String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let redacted: HashMap<&str, &str> = secrets.keys().map(|k| (k.as_str(), REDACTED)).collect();
    redacted.serialize(serializer)
}

fn discard_secrets<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    // The stored values are redaction markers; drop them entirely.
    let _ = HashMap::<String, String>::deserialize(deserializer)?;
    Ok(HashMap::new())
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_and_get_nested_paths() {
        let mut vars = Variables::new();
        vars.set_path("system.organization_id", json!("org-1"));
        vars.set_path("nodes.A.output", json!({"sent": true}));

        assert_eq!(vars.get_path("system.organization_id"), Some(&json!("org-1")));
        assert_eq!(vars.get_path("nodes.A.output.sent"), Some(&json!(true)));
        assert_eq!(vars.get_path("nodes.B.output"), None);
    }

    #[test]
    fn merge_object_spreads_members_under_prefix() {
        let mut vars = Variables::new();
        vars.merge_object_at("nodes.A", &json!({"sent": true, "to": "x@y.z"}));

        assert_eq!(vars.get_path("nodes.A.sent"), Some(&json!(true)));
        assert_eq!(vars.get_path("nodes.A.to"), Some(&json!("x@y.z")));
    }

    #[test]
    fn merge_non_object_stores_whole_value() {
        let mut vars = Variables::new();
        vars.merge_object_at("nodes.A.result", &json!(42));
        assert_eq!(vars.get_path("nodes.A.result"), Some(&json!(42)));
    }

    #[test]
    fn secrets_are_redacted_and_dropped_on_round_trip() {
        let mut ctx = ExecutionContext {
            org_id: "org-1".into(),
            employee_id: "emp-1".into(),
            correlation_id: "corr-1".into(),
            ..Default::default()
        };
        ctx.secrets.insert("api_key".into(), "super-secret".into());

        let serialized = serde_json::to_string(&ctx).unwrap();
        assert!(!serialized.contains("super-secret"));
        assert!(serialized.contains(REDACTED));

        let back: ExecutionContext = serde_json::from_str(&serialized).unwrap();
        assert!(back.secrets.is_empty());
    }
}
