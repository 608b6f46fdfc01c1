//! Declarative state machines for runs and nodes.
//!
//! Transitions live in tables of `(from, trigger, to)` rows, optionally
//! guarded by a predicate over the current state.  Applying a trigger
//! stamps timestamps: runs refresh `last_updated_at`; nodes set
//! `started_at` on their first RUNNING and maintain `ended_at` so it is
//! present exactly on terminal statuses.

use chrono::{DateTime, Utc};

use model::{NodeState, NodeStatus, RunStatus, WorkflowState};

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
    Timeout,
}

impl std::fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start    => "start",
            Self::Pause    => "pause",
            Self::Resume   => "resume",
            Self::Complete => "complete",
            Self::Fail     => "fail",
            Self::Cancel   => "cancel",
            Self::Timeout  => "timeout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTrigger {
    Start,
    Complete,
    Fail,
    Retry,
    Queue,
    Skip,
    Cancel,
    Timeout,
}

impl std::fmt::Display for NodeTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start    => "start",
            Self::Complete => "complete",
            Self::Fail     => "fail",
            Self::Retry    => "retry",
            Self::Queue    => "queue",
            Self::Skip     => "skip",
            Self::Cancel   => "cancel",
            Self::Timeout  => "timeout",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Transition tables
// ---------------------------------------------------------------------------

type RunGuard = fn(&WorkflowState) -> bool;

struct RunTransition {
    from: RunStatus,
    trigger: RunTrigger,
    to: RunStatus,
    guard: Option<RunGuard>,
}

fn no_nodes_in_flight(state: &WorkflowState) -> bool {
    state.current_nodes.is_empty()
}

const fn run_row(from: RunStatus, trigger: RunTrigger, to: RunStatus) -> RunTransition {
    RunTransition {
        from,
        trigger,
        to,
        guard: None,
    }
}

static RUN_TRANSITIONS: &[RunTransition] = &[
    run_row(RunStatus::Pending, RunTrigger::Start, RunStatus::Running),
    run_row(RunStatus::Running, RunTrigger::Pause, RunStatus::Paused),
    run_row(RunStatus::Paused, RunTrigger::Resume, RunStatus::Running),
    RunTransition {
        from: RunStatus::Running,
        trigger: RunTrigger::Complete,
        to: RunStatus::Completed,
        guard: Some(no_nodes_in_flight),
    },
    run_row(RunStatus::Running, RunTrigger::Fail, RunStatus::Failed),
    run_row(RunStatus::Running, RunTrigger::Cancel, RunStatus::Cancelled),
    run_row(RunStatus::Paused, RunTrigger::Cancel, RunStatus::Cancelled),
    run_row(RunStatus::Running, RunTrigger::Timeout, RunStatus::Timeout),
    run_row(RunStatus::Failed, RunTrigger::Start, RunStatus::Compensating),
    run_row(RunStatus::Compensating, RunTrigger::Complete, RunStatus::Failed),
];

static NODE_TRANSITIONS: &[(NodeStatus, NodeTrigger, NodeStatus)] = &[
    (NodeStatus::Queued, NodeTrigger::Start, NodeStatus::Running),
    (NodeStatus::Running, NodeTrigger::Complete, NodeStatus::Completed),
    (NodeStatus::Running, NodeTrigger::Fail, NodeStatus::Failed),
    (NodeStatus::Failed, NodeTrigger::Retry, NodeStatus::Retrying),
    (NodeStatus::Retrying, NodeTrigger::Queue, NodeStatus::Queued),
    (NodeStatus::Queued, NodeTrigger::Skip, NodeStatus::Skipped),
    (NodeStatus::Running, NodeTrigger::Cancel, NodeStatus::Cancelled),
    (NodeStatus::Queued, NodeTrigger::Cancel, NodeStatus::Cancelled),
    (NodeStatus::Running, NodeTrigger::Timeout, NodeStatus::Timeout),
];

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Apply a run trigger in place.
///
/// # Errors
/// [`EngineError::InvalidTransition`] when no table row (or its guard)
/// accepts the trigger from the current status.
pub fn apply_run_trigger(
    state: &mut WorkflowState,
    trigger: RunTrigger,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let row = RUN_TRANSITIONS
        .iter()
        .find(|row| {
            row.from == state.status
                && row.trigger == trigger
                && row.guard.map_or(true, |guard| guard(state))
        })
        .ok_or_else(|| EngineError::InvalidTransition {
            from: state.status.to_string(),
            trigger: trigger.to_string(),
        })?;

    state.status = row.to;
    state.last_updated_at = now;
    Ok(())
}

/// Apply a node trigger in place, maintaining the timestamp invariants.
pub fn apply_node_trigger(
    state: &mut NodeState,
    trigger: NodeTrigger,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let (_, _, to) = NODE_TRANSITIONS
        .iter()
        .find(|(from, t, _)| *from == state.status && *t == trigger)
        .ok_or_else(|| EngineError::InvalidTransition {
            from: state.status.to_string(),
            trigger: trigger.to_string(),
        })?;

    state.status = *to;
    if *to == NodeStatus::Running && state.started_at.is_none() {
        state.started_at = Some(now);
    }
    state.ended_at = to.is_terminal().then_some(now);
    if *to != NodeStatus::Retrying {
        state.next_retry_at = None;
    }
    Ok(())
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use model::ExecutionContext;
    use uuid::Uuid;

    fn run_state(status: RunStatus) -> WorkflowState {
        let mut state = WorkflowState::new(
            Uuid::new_v4(),
            "wf-1",
            ExecutionContext::default(),
            Utc::now(),
        );
        state.status = status;
        state
    }

    #[test]
    fn run_happy_path() {
        let mut state = run_state(RunStatus::Pending);
        apply_run_trigger(&mut state, RunTrigger::Start, Utc::now()).unwrap();
        assert_eq!(state.status, RunStatus::Running);
        apply_run_trigger(&mut state, RunTrigger::Complete, Utc::now()).unwrap();
        assert_eq!(state.status, RunStatus::Completed);
    }

    #[test]
    fn completion_is_guarded_on_in_flight_nodes() {
        let mut state = run_state(RunStatus::Running);
        state.current_nodes.insert("a".into());

        let err = apply_run_trigger(&mut state, RunTrigger::Complete, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        state.current_nodes.clear();
        apply_run_trigger(&mut state, RunTrigger::Complete, Utc::now()).unwrap();
    }

    #[test]
    fn compensation_loops_back_to_failed() {
        let mut state = run_state(RunStatus::Running);
        apply_run_trigger(&mut state, RunTrigger::Fail, Utc::now()).unwrap();
        apply_run_trigger(&mut state, RunTrigger::Start, Utc::now()).unwrap();
        assert_eq!(state.status, RunStatus::Compensating);
        apply_run_trigger(&mut state, RunTrigger::Complete, Utc::now()).unwrap();
        assert_eq!(state.status, RunStatus::Failed);
    }

    #[test]
    fn pause_only_from_running() {
        let mut state = run_state(RunStatus::Pending);
        assert!(apply_run_trigger(&mut state, RunTrigger::Pause, Utc::now()).is_err());
        assert_eq!(state.status, RunStatus::Pending);
    }

    #[test]
    fn node_retry_cycle_maintains_timestamps() {
        let mut node = NodeState::queued(Uuid::new_v4(), "a");
        let t0 = Utc::now();

        apply_node_trigger(&mut node, NodeTrigger::Start, t0).unwrap();
        assert_eq!(node.started_at, Some(t0));
        assert!(node.ended_at.is_none());

        let t1 = t0 + chrono::Duration::seconds(1);
        apply_node_trigger(&mut node, NodeTrigger::Fail, t1).unwrap();
        assert_eq!(node.ended_at, Some(t1));

        // Leaving the terminal FAILED status through `retry` clears it.
        apply_node_trigger(&mut node, NodeTrigger::Retry, t1).unwrap();
        assert_eq!(node.status, NodeStatus::Retrying);
        assert!(node.ended_at.is_none());

        apply_node_trigger(&mut node, NodeTrigger::Queue, t1).unwrap();
        assert!(node.next_retry_at.is_none());

        let t2 = t1 + chrono::Duration::seconds(2);
        apply_node_trigger(&mut node, NodeTrigger::Start, t2).unwrap();
        // started_at is first-RUNNING only.
        assert_eq!(node.started_at, Some(t0));
    }

    #[test]
    fn queued_node_can_be_skipped_or_cancelled() {
        let mut node = NodeState::queued(Uuid::new_v4(), "a");
        apply_node_trigger(&mut node, NodeTrigger::Skip, Utc::now()).unwrap();
        assert_eq!(node.status, NodeStatus::Skipped);
        assert!(node.ended_at.is_some());

        let mut node = NodeState::queued(Uuid::new_v4(), "b");
        apply_node_trigger(&mut node, NodeTrigger::Cancel, Utc::now()).unwrap();
        assert_eq!(node.status, NodeStatus::Cancelled);
    }

    #[test]
    fn completed_node_accepts_no_further_triggers() {
        let mut node = NodeState::queued(Uuid::new_v4(), "a");
        apply_node_trigger(&mut node, NodeTrigger::Start, Utc::now()).unwrap();
        apply_node_trigger(&mut node, NodeTrigger::Complete, Utc::now()).unwrap();
        for trigger in [NodeTrigger::Start, NodeTrigger::Fail, NodeTrigger::Cancel] {
            assert!(apply_node_trigger(&mut node, trigger, Utc::now()).is_err());
        }
    }
}
