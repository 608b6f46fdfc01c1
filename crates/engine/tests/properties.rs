//! Universal properties of the execution core.
//!
//! The graph properties run under proptest over randomly shaped DAGs; the
//! lock property exercises real concurrent acquisition against the
//! in-memory store.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use uuid::Uuid;

use engine::dag;
use engine::{ValidationError, ValidationErrorCode};
use model::{
    Edge, ExecutionContext, NodeDefinition, Position, SystemClock, Trigger, WorkflowDefinition,
};
use store::{MemoryStore, StateStore, StoreConfig};

fn make_node(id: &str) -> NodeDefinition {
    NodeDefinition {
        id: id.to_string(),
        node_type: "email.send".into(),
        name: format!("{id} step"),
        params: serde_json::json!({}),
        retry_policy: None,
        timeout_ms: 30_000,
        position: Position::default(),
    }
}

fn make_definition(nodes: Vec<NodeDefinition>, edges: Vec<Edge>) -> WorkflowDefinition {
    WorkflowDefinition::new("wf-prop", "org-1", "property", Trigger::Onboard, nodes, edges)
}

/// A random DAG: `n` nodes, each forward pair `(i, j)` with `i < j`
/// independently kept or dropped.  Forward-only edges cannot form cycles.
fn arb_dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2usize..8).prop_flat_map(|n| {
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .collect();
        let len = pairs.len();
        proptest::collection::vec(any::<bool>(), len).prop_map(move |mask| {
            let edges = pairs
                .iter()
                .zip(&mask)
                .filter(|(_, keep)| **keep)
                .map(|(pair, _)| *pair)
                .collect();
            (n, edges)
        })
    })
}

proptest! {
    /// Sorting an acyclic graph yields a permutation of its nodes that
    /// respects every edge.
    #[test]
    fn topological_sort_permutes_acyclic_graphs((n, edge_pairs) in arb_dag()) {
        let nodes: Vec<NodeDefinition> = (0..n).map(|i| make_node(&format!("n{i}"))).collect();
        let edges: Vec<Edge> = edge_pairs
            .iter()
            .enumerate()
            .map(|(k, (i, j))| Edge {
                id: format!("e{k}"),
                from_node_id: format!("n{i}"),
                to_node_id: format!("n{j}"),
            })
            .collect();

        let parsed = dag::parse(&make_definition(nodes, edges)).expect("forward DAGs are valid");

        // Permutation: every node exactly once.
        let mut sorted_ids = parsed.topological_order.clone();
        sorted_ids.sort();
        let mut expected: Vec<String> = (0..n).map(|i| format!("n{i}")).collect();
        expected.sort();
        prop_assert_eq!(sorted_ids, expected);

        // Edge order respected.
        for (i, j) in &edge_pairs {
            let from = parsed.topo_index(&format!("n{i}"));
            let to = parsed.topo_index(&format!("n{j}"));
            prop_assert!(from < to, "edge n{i}->n{j} out of order");
        }
    }

    /// Closing any chain back onto its head is reported as a cycle.
    #[test]
    fn closed_chains_are_rejected(n in 2usize..8) {
        let nodes: Vec<NodeDefinition> = (0..n).map(|i| make_node(&format!("n{i}"))).collect();
        let mut edges: Vec<Edge> = (0..n - 1)
            .map(|i| Edge {
                id: format!("e{i}"),
                from_node_id: format!("n{i}"),
                to_node_id: format!("n{}", i + 1),
            })
            .collect();
        edges.push(Edge {
            id: "back".into(),
            from_node_id: format!("n{}", n - 1),
            to_node_id: "n0".into(),
        });

        let errors: Vec<ValidationError> =
            dag::parse(&make_definition(nodes, edges)).expect_err("cycle must be rejected");
        prop_assert!(errors.iter().any(|e| e.code == ValidationErrorCode::CycleDetected));
    }

    /// Serialization strips secrets whatever their content.
    #[test]
    fn context_round_trip_always_drops_secrets(
        entries in proptest::collection::hash_map("[a-z_]{1,12}", ".{0,32}", 0..6)
    ) {
        let mut context = ExecutionContext::default();
        context.secrets.extend(entries);

        let raw = serde_json::to_string(&context).unwrap();
        let back: ExecutionContext = serde_json::from_str(&raw).unwrap();
        prop_assert!(back.secrets.is_empty());
    }
}

/// Concurrent `acquire_lock` calls on one run admit exactly one winner.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lock_acquisition_has_one_winner() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(
        StoreConfig::default(),
        Arc::new(SystemClock),
    ));
    let run_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .acquire_lock(run_id, &format!("engine-{i}"), Duration::from_secs(300))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
