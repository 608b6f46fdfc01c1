//! Context management and parameter resolution.
//!
//! The context is seeded from the trigger event (`system.*`, `event.*`),
//! grows a `nodes.<id>.*` / `nodes.<name>.*` subtree per completed node,
//! and feeds parameter mappings that assemble each node's input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use model::{ExecutionContext, NodeDefinition, TriggerEvent, Variables};

use crate::error::EngineError;

/// Params member holding a node's mapping list.
const MAPPINGS_KEY: &str = "parameterMappings";

// ---------------------------------------------------------------------------
// Seeding and growth
// ---------------------------------------------------------------------------

/// Build the initial context for a run started by `event`.
pub fn initial_context(event: &TriggerEvent, now: DateTime<Utc>) -> ExecutionContext {
    let correlation_id = event
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut variables = Variables::new();
    variables.set_path("system.timestamp", json!(now.to_rfc3339()));
    variables.set_path("system.organization_id", json!(event.organization_id));
    variables.set_path("system.employee_id", json!(event.employee_id));
    variables.set_path("system.trigger_event", json!(event.event_type));
    variables.set_path("event.type", json!(event.event_type));
    variables.set_path("event.payload", event.payload.clone());
    variables.set_path("event.timestamp", json!(event.timestamp.to_rfc3339()));

    ExecutionContext {
        org_id: event.organization_id.clone(),
        employee_id: event.employee_id.clone(),
        trigger_event: Some(event.clone()),
        variables,
        secrets: Default::default(),
        correlation_id,
        parent_context: None,
    }
}

/// Merge a completed node's output into the context, addressable by both
/// the node's ID and its display name, with the whole output additionally
/// stored under `nodes.<id>.output`.
pub fn merge_node_output(
    context: &mut ExecutionContext,
    node_id: &str,
    node_name: &str,
    output: &Value,
) {
    for key in [node_id, node_name] {
        let prefix = format!("nodes.{key}");
        context.variables.merge_object_at(&prefix, output);
        context
            .variables
            .set_path(&format!("{prefix}.output"), output.clone());
    }
}

// ---------------------------------------------------------------------------
// Parameter mappings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Static,
    Context,
    NodeOutput,
    Expression,
}

/// One input-assembly rule from a node's params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterMapping {
    pub source_type: SourceType,
    pub source_path: String,
    pub target_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

/// Assemble a node's input: the static params (minus the mapping list)
/// overlaid with every resolved mapping.
///
/// # Errors
/// [`EngineError::MissingRequiredParameter`] when a `required` mapping
/// resolves to nothing and has no default.
pub fn resolve_input(
    node: &NodeDefinition,
    context: &ExecutionContext,
) -> Result<Value, EngineError> {
    let mut input = match node.params.as_object() {
        Some(params) => {
            let mut base = params.clone();
            base.remove(MAPPINGS_KEY);
            base
        }
        None => Map::new(),
    };

    let mappings: Vec<ParameterMapping> = node
        .params
        .get(MAPPINGS_KEY)
        .map(|raw| serde_json::from_value(raw.clone()))
        .transpose()
        .unwrap_or_default()
        .unwrap_or_default();

    let mut assembled = Variables(input.clone());
    for mapping in &mappings {
        match resolve_mapping(mapping, context) {
            Some(value) => assembled.set_path(&mapping.target_path, value),
            None => match &mapping.default_value {
                Some(default) => assembled.set_path(&mapping.target_path, default.clone()),
                None if mapping.required => {
                    return Err(EngineError::MissingRequiredParameter {
                        node_id: node.id.clone(),
                        target: mapping.target_path.clone(),
                    });
                }
                None => {}
            },
        }
    }

    input = assembled.0;
    Ok(Value::Object(input))
}

fn resolve_mapping(mapping: &ParameterMapping, context: &ExecutionContext) -> Option<Value> {
    match mapping.source_type {
        SourceType::Static => Some(
            serde_json::from_str(&mapping.source_path)
                .unwrap_or_else(|_| Value::String(mapping.source_path.clone())),
        ),
        SourceType::Context => context.variables.get_path(&mapping.source_path).cloned(),
        SourceType::NodeOutput => resolve_node_output(&mapping.source_path, context),
        SourceType::Expression => {
            let rendered = substitute_expression(&mapping.source_path, context);
            Some(
                serde_json::from_str(&rendered)
                    .unwrap_or_else(|_| Value::String(rendered.clone())),
            )
        }
    }
}

/// `<nodeRef>.<path>` walks the referenced node's stored output.
fn resolve_node_output(source_path: &str, context: &ExecutionContext) -> Option<Value> {
    let (node_ref, rest) = match source_path.split_once('.') {
        Some((node_ref, rest)) => (node_ref, Some(rest)),
        None => (source_path, None),
    };
    let base = format!("nodes.{node_ref}.output");
    match rest {
        Some(rest) => context.variables.get_path(&format!("{base}.{rest}")).cloned(),
        None => context.variables.get_path(&base).cloned(),
    }
}

/// Substitute `${var.path}` and `$nodes.<ref>.<path>` tokens by the
/// JSON-serialized values they resolve to.  Unresolvable tokens are left
/// in place.
fn substitute_expression(template: &str, context: &ExecutionContext) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(dollar) = rest.find('$') {
        output.push_str(&rest[..dollar]);
        let token_start = &rest[dollar..];

        if let Some(body) = token_start.strip_prefix("${") {
            if let Some(close) = body.find('}') {
                let path = &body[..close];
                match context.variables.get_path(path) {
                    Some(value) => output.push_str(&render(value)),
                    None => output.push_str(&token_start[..close + 3]),
                }
                rest = &body[close + 1..];
                continue;
            }
        } else if let Some(body) = token_start.strip_prefix("$nodes.") {
            let len = body
                .find(|c: char| !(c.is_alphanumeric() || matches!(c, '.' | '_' | '-')))
                .unwrap_or(body.len());
            // Trailing dots belong to the matched token, not the path; the
            // whole match is consumed either way so a stripped dot never
            // leaks back into the rendered stream.
            let path = body[..len].trim_end_matches('.');
            if !path.is_empty() {
                match resolve_node_output(path, context) {
                    Some(value) => output.push_str(&render(&value)),
                    None => output.push_str(&token_start[..7 + len]),
                }
                rest = &body[len..];
                continue;
            }
        }

        // Bare '$' with no recognizable token.
        output.push('$');
        rest = &rest[dollar + 1..];
    }

    output.push_str(rest);
    output
}

fn render(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
