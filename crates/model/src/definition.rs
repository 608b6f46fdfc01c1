//! Workflow definition types.
//!
//! These are the wire format of a workflow: what an admin authors and what
//! the engine validates and parses.  Definitions are immutable once stored;
//! the engine never mutates them, it derives a parsed plan from them.
//!
//! Field names serialize in camelCase because definitions are shared with
//! the rest of the platform over JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// The lifecycle event class that starts a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// `employee.onboard.*` events.
    Onboard,
    /// `employee.exit.*` events.
    Exit,
    /// `employee.transfer.*` events.
    Transfer,
    /// `employee.update.*` events.
    Update,
}

impl Trigger {
    /// The bus topic pattern this trigger subscribes to.
    pub fn topic_pattern(&self) -> &'static str {
        match self {
            Self::Onboard => "employee.onboard.*",
            Self::Exit => "employee.exit.*",
            Self::Transfer => "employee.transfer.*",
            Self::Update => "employee.update.*",
        }
    }

    /// Match an inbound event type (e.g. `employee.onboard.started`) to a
    /// trigger class.
    pub fn for_event_type(event_type: &str) -> Option<Self> {
        let class = event_type.strip_prefix("employee.")?;
        let class = class.split('.').next()?;
        match class {
            "onboard" => Some(Self::Onboard),
            "exit" => Some(Self::Exit),
            "transfer" => Some(Self::Transfer),
            "update" => Some(Self::Update),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeType
// ---------------------------------------------------------------------------

/// The closed set of node types the engine can dispatch.
///
/// A definition carries the raw string form; validation resolves it through
/// [`NodeType::parse`] so an unknown type is a validation error, not a
/// deserialization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "identity.provision")]
    IdentityProvision,
    #[serde(rename = "identity.deprovision")]
    IdentityDeprovision,
    #[serde(rename = "email.send")]
    EmailSend,
    #[serde(rename = "calendar.schedule")]
    CalendarSchedule,
    #[serde(rename = "slack.message")]
    SlackMessage,
    #[serde(rename = "slack.channel_invite")]
    SlackChannelInvite,
    #[serde(rename = "document.distribute")]
    DocumentDistribute,
    #[serde(rename = "ai.generate_content")]
    AiGenerateContent,
    #[serde(rename = "webhook.call")]
    WebhookCall,
    #[serde(rename = "delay")]
    Delay,
    #[serde(rename = "condition")]
    Condition,
    #[serde(rename = "parallel")]
    Parallel,
    #[serde(rename = "compensation")]
    Compensation,
}

impl NodeType {
    /// All supported node types, in declaration order.
    pub const ALL: [NodeType; 13] = [
        Self::IdentityProvision,
        Self::IdentityDeprovision,
        Self::EmailSend,
        Self::CalendarSchedule,
        Self::SlackMessage,
        Self::SlackChannelInvite,
        Self::DocumentDistribute,
        Self::AiGenerateContent,
        Self::WebhookCall,
        Self::Delay,
        Self::Condition,
        Self::Parallel,
        Self::Compensation,
    ];

    /// The canonical string form used in definitions and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdentityProvision => "identity.provision",
            Self::IdentityDeprovision => "identity.deprovision",
            Self::EmailSend => "email.send",
            Self::CalendarSchedule => "calendar.schedule",
            Self::SlackMessage => "slack.message",
            Self::SlackChannelInvite => "slack.channel_invite",
            Self::DocumentDistribute => "document.distribute",
            Self::AiGenerateContent => "ai.generate_content",
            Self::WebhookCall => "webhook.call",
            Self::Delay => "delay",
            Self::Condition => "condition",
            Self::Parallel => "parallel",
            Self::Compensation => "compensation",
        }
    }

    /// Resolve a raw definition string to a node type.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == raw)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unsupported node type: {s}"))
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Retry tuning for a node.
///
/// The effective policy for a node is the global default, overlaid by the
/// per-node-type default, overlaid by this per-node policy when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay for the exponential back-off.
    pub backoff_ms: u64,
    /// Back-off multiplier applied per attempt.
    pub multiplier: f64,
    /// Upper bound on a single delay.
    pub max_backoff_ms: u64,
    /// Add ±10% uniform noise to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 300_000,
            jitter: true,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeDefinition / Edge / Dag
// ---------------------------------------------------------------------------

/// Canvas position, carried through for the authoring surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single step in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Raw node type string; resolved against [`NodeType`] at validation.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Human-readable name; node outputs are also published under it.
    pub name: String,
    /// Arbitrary configuration passed to the executor, including parameter
    /// mappings and compensation metadata.
    #[serde(default)]
    pub params: Value,
    /// Per-node retry override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Executor-side deadline for one attempt.
    pub timeout_ms: u64,
    #[serde(default)]
    pub position: Position,
}

impl NodeDefinition {
    /// Resolved node type, when the raw string is in the closed set.
    pub fn parsed_type(&self) -> Option<NodeType> {
        NodeType::parse(&self.node_type)
    }
}

/// Directed edge from one node to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub from_node_id: String,
    pub to_node_id: String,
}

/// The graph body of a workflow definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dag {
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A complete, versioned workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub trigger: Trigger,
    pub version: u32,
    pub is_active: bool,
    pub dag: Dag,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Convenience constructor used by tests and the simulator.
    pub fn new(
        id: impl Into<String>,
        org_id: impl Into<String>,
        name: impl Into<String>,
        trigger: Trigger,
        nodes: Vec<NodeDefinition>,
        edges: Vec<Edge>,
    ) -> Self {
        Self {
            id: id.into(),
            org_id: org_id.into(),
            name: name.into(),
            trigger,
            version: 1,
            is_active: true,
            dag: Dag {
                nodes,
                edges,
                metadata: HashMap::new(),
            },
            created_at: Utc::now(),
        }
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_round_trips_through_string_form() {
        for t in NodeType::ALL {
            assert_eq!(NodeType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        assert_eq!(NodeType::parse("carrier.pigeon"), None);
    }

    #[test]
    fn trigger_matches_event_type_prefixes() {
        assert_eq!(
            Trigger::for_event_type("employee.onboard.started"),
            Some(Trigger::Onboard)
        );
        assert_eq!(
            Trigger::for_event_type("employee.exit.requested"),
            Some(Trigger::Exit)
        );
        assert_eq!(Trigger::for_event_type("invoice.created"), None);
    }

    #[test]
    fn definition_deserializes_camel_case_wire_form() {
        let raw = serde_json::json!({
            "id": "wf-1",
            "orgId": "org-1",
            "name": "Onboarding",
            "trigger": "onboard",
            "version": 1,
            "isActive": true,
            "dag": {
                "nodes": [{
                    "id": "A",
                    "type": "email.send",
                    "name": "Welcome email",
                    "params": {},
                    "timeoutMs": 30000
                }],
                "edges": []
            }
        });

        let def: WorkflowDefinition = serde_json::from_value(raw).expect("valid definition");
        assert_eq!(def.dag.nodes[0].parsed_type(), Some(NodeType::EmailSend));
        assert_eq!(def.trigger, Trigger::Onboard);
    }
}
