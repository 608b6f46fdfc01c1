//! Saga-style compensation: build and run rollback plans for failed runs.
//!
//! A plan combines compensation nodes declared in the DAG with reverse
//! actions synthesized for completed side-effecting nodes.  Steps run
//! serially in descending order, advanced by the orchestrator as each
//! step's result arrives; only `cleanup` and `notification` steps are
//! allowed to fail without aborting the rest of the plan.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use model::{ErrorDetails, NodeDefinition, NodeState, NodeType, WorkflowState};
use nodes::{compensation_for, CompensationType};

use crate::dag::ParsedWorkflow;
use crate::dispatch::{DispatchItem, NodeDispatcher};
use crate::error::EngineError;

/// Error codes that invalidate the whole request; rolling back would be
/// meaningless, so compensation is skipped entirely.
const NON_COMPENSATABLE_CODES: &[&str] = &[
    "VALIDATION_ERROR",
    "INVALID_INPUT",
    "UNAUTHORIZED",
    "FORBIDDEN",
];

pub fn is_compensatable(error: &ErrorDetails) -> bool {
    !NON_COMPENSATABLE_CODES.contains(&error.code.as_str())
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One reverse action in a plan.
#[derive(Debug, Clone)]
pub struct CompensationStep {
    /// Node-state ID the step executes under (`comp:<target>` when
    /// synthesized, the declared node's ID otherwise).
    pub step_id: String,
    pub node_type: NodeType,
    pub compensation_type: CompensationType,
    pub order: i32,
    /// The completed forward nodes this step compensates.
    pub compensates_for: Vec<String>,
    pub input: Value,
}

#[derive(Debug, Clone, Default)]
pub struct CompensationPlan {
    pub steps: Vec<CompensationStep>,
}

impl CompensationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Build the plan for a failed run: declared compensation nodes covering
/// completed targets first, then synthesized reverses for the rest.
/// Steps are ordered by descending `order`, ties broken by reverse
/// completion (topological) position.
pub fn build_plan(parsed: &ParsedWorkflow, state: &WorkflowState) -> CompensationPlan {
    let mut steps = Vec::new();
    let mut covered: HashSet<String> = HashSet::new();

    for declared in parsed.compensation_nodes() {
        let targets: Vec<String> = declared
            .params
            .get("compensatesFor")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .filter(|id| state.completed_nodes.contains(*id))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if targets.is_empty() {
            continue;
        }

        let compensation_type = declared
            .params
            .get("compensationType")
            .cloned()
            .map(serde_json::from_value)
            .and_then(Result::ok)
            .unwrap_or(CompensationType::Custom);
        let order = declared
            .params
            .get("compensationOrder")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32;

        covered.extend(targets.iter().cloned());
        steps.push(CompensationStep {
            step_id: declared.id.clone(),
            node_type: NodeType::Compensation,
            compensation_type,
            order,
            input: json!({
                "compensatesFor": targets,
                "compensationType": compensation_type,
                "params": declared.params,
            }),
            compensates_for: targets,
        });
    }

    for target in parsed
        .topological_order
        .iter()
        .filter(|id| state.completed_nodes.contains(*id))
        .filter(|id| !covered.contains(*id))
    {
        let Some(node_type) = parsed.node_type(target) else {
            continue;
        };
        let Some(synthesized) = compensation_for(node_type) else {
            continue;
        };

        let original_output = state
            .context
            .variables
            .get_path(&format!("nodes.{target}.output"))
            .cloned()
            .unwrap_or(Value::Null);

        steps.push(CompensationStep {
            step_id: format!("comp:{target}"),
            node_type: synthesized.reverse_type,
            compensation_type: synthesized.compensation_type,
            order: synthesized.order,
            compensates_for: vec![target.clone()],
            input: json!({
                "compensatesFor": [target],
                "compensationType": synthesized.compensation_type,
                "originalOutput": original_output,
            }),
        });
    }

    steps.sort_by(|a, b| {
        b.order.cmp(&a.order).then_with(|| {
            let a_pos = a
                .compensates_for
                .first()
                .map(|id| parsed.topo_index(id))
                .unwrap_or(0);
            let b_pos = b
                .compensates_for
                .first()
                .map(|id| parsed.topo_index(id))
                .unwrap_or(0);
            b_pos.cmp(&a_pos)
        })
    });

    CompensationPlan { steps }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Per-step terminal-status budget, enforced by the timeout monitor.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// In-flight progress through a plan.  Steps advance as their results
/// arrive off the bus; nothing here blocks the result consumer.
#[derive(Debug, Clone)]
pub struct CompensationProgress {
    pub plan: CompensationPlan,
    /// Index of the step currently dispatched.
    pub index: usize,
}

impl CompensationProgress {
    pub fn new(plan: CompensationPlan) -> Self {
        Self { plan, index: 0 }
    }

    pub fn current(&self) -> Option<&CompensationStep> {
        self.plan.steps.get(self.index)
    }

    /// May this step fail without aborting the rest of the plan?
    pub fn current_tolerates_failure(&self) -> bool {
        self.current().map_or(false, |step| {
            matches!(
                step.compensation_type,
                CompensationType::Cleanup | CompensationType::Notification
            )
        })
    }
}

pub struct CompensationManager {
    dispatcher: Arc<NodeDispatcher>,
}

impl CompensationManager {
    pub fn new(dispatcher: Arc<NodeDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Dispatch one step as a synthetic node.  The caller observes its
    /// terminal status through the normal result path.
    pub async fn dispatch_step(
        &self,
        state: &WorkflowState,
        step: &CompensationStep,
    ) -> Result<(), EngineError> {
        info!(
            run_id = %state.run_id,
            step = %step.step_id,
            order = step.order,
            "dispatching compensation step"
        );

        let node = NodeDefinition {
            id: step.step_id.clone(),
            node_type: step.node_type.as_str().to_string(),
            name: format!("compensate {}", step.compensates_for.join(",")),
            params: step.input.clone(),
            retry_policy: None,
            timeout_ms: STEP_TIMEOUT.as_millis() as u64,
            position: Default::default(),
        };
        let mut item = DispatchItem {
            node_state: NodeState::queued(state.run_id, &step.step_id),
            node,
            node_type: step.node_type,
            input: step.input.clone(),
        };

        match self.dispatcher.dispatch(state, &mut item).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(step = %step.step_id, error = %err, "compensation dispatch failed");
                Err(err)
            }
        }
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag;
    use chrono::Utc;
    use model::{Edge, ExecutionContext, Trigger, WorkflowDefinition};
    use uuid::Uuid;

    fn make_node(id: &str, node_type: &str) -> NodeDefinition {
        NodeDefinition {
            id: id.into(),
            node_type: node_type.into(),
            name: format!("{id} step"),
            params: Value::Null,
            retry_policy: None,
            timeout_ms: 30_000,
            position: Default::default(),
        }
    }

    fn state_with_completed(completed: &[&str]) -> WorkflowState {
        let mut state = WorkflowState::new(
            Uuid::new_v4(),
            "wf-1",
            ExecutionContext::default(),
            Utc::now(),
        );
        for id in completed {
            state.completed_nodes.insert(id.to_string());
        }
        state
    }

    #[test]
    fn non_compensatable_codes_are_final() {
        assert!(!is_compensatable(&ErrorDetails::new("VALIDATION_ERROR", "bad")));
        assert!(!is_compensatable(&ErrorDetails::new("FORBIDDEN", "no")));
        assert!(is_compensatable(&ErrorDetails::new("ETIMEDOUT", "slow")));
    }

    #[test]
    fn synthesized_steps_reverse_completed_side_effects() {
        let wf = WorkflowDefinition::new(
            "wf-1",
            "org-1",
            "test",
            Trigger::Onboard,
            vec![
                make_node("prov", "identity.provision"),
                make_node("mail", "email.send"),
                make_node("ping", "slack.message"),
            ],
            vec![
                Edge {
                    id: "e1".into(),
                    from_node_id: "prov".into(),
                    to_node_id: "mail".into(),
                },
                Edge {
                    id: "e2".into(),
                    from_node_id: "mail".into(),
                    to_node_id: "ping".into(),
                },
            ],
        );
        let parsed = dag::parse(&wf).unwrap();
        let state = state_with_completed(&["prov", "mail"]);

        let plan = build_plan(&parsed, &state);
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.step_id.as_str()).collect();
        // identity rollback (order 100) precedes the email notification (10).
        assert_eq!(ids, vec!["comp:prov", "comp:mail"]);
        assert_eq!(plan.steps[0].node_type, NodeType::IdentityDeprovision);
        assert_eq!(plan.steps[1].compensation_type, CompensationType::Notification);
        // slack.message has no synthesized reverse.
        assert_eq!(plan.steps.len(), 2);
    }

    #[test]
    fn declared_compensation_covers_its_targets() {
        let mut declared = make_node("undo", "compensation");
        declared.params = json!({
            "compensatesFor": ["prov"],
            "compensationType": "rollback",
            "compensationOrder": 200
        });
        let wf = WorkflowDefinition::new(
            "wf-1",
            "org-1",
            "test",
            Trigger::Onboard,
            vec![make_node("prov", "identity.provision"), declared],
            vec![],
        );
        let parsed = dag::parse(&wf).unwrap();
        let state = state_with_completed(&["prov"]);

        let plan = build_plan(&parsed, &state);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].step_id, "undo");
        assert_eq!(plan.steps[0].order, 200);
        // No synthesized duplicate for the covered target.
        assert!(plan.steps.iter().all(|s| s.step_id != "comp:prov"));
    }

    #[test]
    fn untouched_targets_build_no_steps() {
        let wf = WorkflowDefinition::new(
            "wf-1",
            "org-1",
            "test",
            Trigger::Onboard,
            vec![make_node("prov", "identity.provision")],
            vec![],
        );
        let parsed = dag::parse(&wf).unwrap();
        let state = state_with_completed(&[]);

        assert!(build_plan(&parsed, &state).is_empty());
    }
}
