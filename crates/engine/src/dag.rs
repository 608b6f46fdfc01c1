//! DAG validation and parsing — run this before persisting or executing a
//! workflow.
//!
//! Validation accumulates every violation instead of failing fast, so an
//! author sees the whole picture at once.  A clean definition is compiled
//! into a [`ParsedWorkflow`]: topological order, entry/exit nodes, and the
//! dependency maps the orchestrator advances the run with.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use model::{NodeType, WorkflowDefinition, WorkflowState};

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Machine-readable validation error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationErrorCode {
    MissingDefinition,
    NoNodes,
    MissingNodeId,
    MissingNodeName,
    MissingNodeType,
    UnsupportedNodeType,
    InvalidRetryPolicy,
    InvalidBackoff,
    InvalidTimeout,
    InvalidFromNode,
    InvalidToNode,
    SelfReferencingEdge,
    DuplicateNodeIds,
    DuplicateEdgeIds,
    DuplicateEdges,
    NoEntryNodes,
    CycleDetected,
}

impl ValidationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingDefinition   => "MISSING_DEFINITION",
            Self::NoNodes             => "NO_NODES",
            Self::MissingNodeId       => "MISSING_NODE_ID",
            Self::MissingNodeName     => "MISSING_NODE_NAME",
            Self::MissingNodeType     => "MISSING_NODE_TYPE",
            Self::UnsupportedNodeType => "UNSUPPORTED_NODE_TYPE",
            Self::InvalidRetryPolicy  => "INVALID_RETRY_POLICY",
            Self::InvalidBackoff      => "INVALID_BACKOFF",
            Self::InvalidTimeout      => "INVALID_TIMEOUT",
            Self::InvalidFromNode     => "INVALID_FROM_NODE",
            Self::InvalidToNode       => "INVALID_TO_NODE",
            Self::SelfReferencingEdge => "SELF_REFERENCING_EDGE",
            Self::DuplicateNodeIds    => "DUPLICATE_NODE_IDS",
            Self::DuplicateEdgeIds    => "DUPLICATE_EDGE_IDS",
            Self::DuplicateEdges      => "DUPLICATE_EDGES",
            Self::NoEntryNodes        => "NO_ENTRY_NODES",
            Self::CycleDetected       => "CYCLE_DETECTED",
        }
    }
}

/// One validation violation, located when possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: ValidationErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
}

impl ValidationError {
    fn new(code: ValidationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_id: None,
            edge_id: None,
        }
    }

    fn at_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    fn at_edge(mut self, edge_id: impl Into<String>) -> Self {
        self.edge_id = Some(edge_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ParsedWorkflow
// ---------------------------------------------------------------------------

/// Executable plan derived from a valid definition.  Never persisted;
/// rebuilt from the definition whenever a run needs it.
#[derive(Debug, Clone)]
pub struct ParsedWorkflow {
    pub definition: WorkflowDefinition,
    /// Every node ID in execution order (Kahn's algorithm, ties broken by
    /// definition order).  Includes compensation-type nodes.
    pub topological_order: Vec<String>,
    /// In-degree-0 nodes, compensation declarations excluded.
    pub entry_nodes: Vec<String>,
    /// Out-degree-0 nodes, compensation declarations excluded.
    pub exit_nodes: Vec<String>,
    pub node_type_by_id: HashMap<String, NodeType>,
    pub outgoing_by_node: HashMap<String, Vec<String>>,
    pub dependencies_by_node: HashMap<String, Vec<String>>,
    /// Nodes that take part in forward execution (everything except
    /// declared compensation nodes).  The completion predicate counts
    /// against this set.
    forward_nodes: HashSet<String>,
}

impl ParsedWorkflow {
    pub fn node(&self, node_id: &str) -> Option<&model::NodeDefinition> {
        self.definition.dag.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn node_type(&self, node_id: &str) -> Option<NodeType> {
        self.node_type_by_id.get(node_id).copied()
    }

    pub fn is_forward_node(&self, node_id: &str) -> bool {
        self.forward_nodes.contains(node_id)
    }

    pub fn forward_node_count(&self) -> usize {
        self.forward_nodes.len()
    }

    /// Declared compensation nodes, if any.
    pub fn compensation_nodes(&self) -> impl Iterator<Item = &model::NodeDefinition> {
        self.definition
            .dag
            .nodes
            .iter()
            .filter(|n| self.node_type(&n.id) == Some(NodeType::Compensation))
    }

    /// Position of a node in the topological order.
    pub fn topo_index(&self, node_id: &str) -> usize {
        self.topological_order
            .iter()
            .position(|id| id == node_id)
            .unwrap_or(usize::MAX)
    }

    /// Nodes currently eligible for dispatch: forward nodes not yet
    /// started, every dependency settled in `completed` (or pruned into
    /// `skipped` by a condition branch).  Failed dependencies block their
    /// descendants; failure is resolved at the workflow level.
    pub fn eligible_nodes(&self, state: &WorkflowState) -> Vec<String> {
        self.topological_order
            .iter()
            .filter(|id| self.is_forward_node(id))
            .filter(|id| {
                !state.completed_nodes.contains(*id)
                    && !state.failed_nodes.contains(*id)
                    && !state.skipped_nodes.contains(*id)
                    && !state.current_nodes.contains(*id)
            })
            .filter(|id| {
                self.dependencies_by_node
                    .get(*id)
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                    .iter()
                    .all(|dep| {
                        state.completed_nodes.contains(dep) || state.skipped_nodes.contains(dep)
                    })
            })
            .cloned()
            .collect()
    }

    /// The run is complete when every forward node is settled.
    pub fn is_complete(&self, state: &WorkflowState) -> bool {
        state.settled_count() >= self.forward_node_count()
    }

    /// All forward nodes reachable from `node_id` (excluded).
    pub fn descendants_of(&self, node_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([node_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for next in self
                .outgoing_by_node
                .get(&current)
                .map(Vec::as_slice)
                .unwrap_or_default()
            {
                if seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        seen
    }

    /// Nodes to prune when `condition_id` evaluated false: its descendants
    /// minus anything still reachable from the entry frontier without
    /// passing through the condition node.
    pub fn skip_set_for_condition(&self, condition_id: &str) -> HashSet<String> {
        let descendants = self.descendants_of(condition_id);

        let mut alive: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = self
            .entry_nodes
            .iter()
            .filter(|id| *id != condition_id)
            .cloned()
            .collect();
        alive.extend(queue.iter().cloned());
        while let Some(current) = queue.pop_front() {
            for next in self
                .outgoing_by_node
                .get(&current)
                .map(Vec::as_slice)
                .unwrap_or_default()
            {
                if next == condition_id {
                    continue;
                }
                if alive.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }

        descendants
            .into_iter()
            .filter(|id| !alive.contains(id) && self.is_forward_node(id))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a raw JSON definition; `null` or undecodable input reports
/// `MISSING_DEFINITION`.
pub fn parse_json(raw: &serde_json::Value) -> Result<ParsedWorkflow, Vec<ValidationError>> {
    if raw.is_null() {
        return Err(vec![ValidationError::new(
            ValidationErrorCode::MissingDefinition,
            "workflow definition is missing",
        )]);
    }
    let definition: WorkflowDefinition = serde_json::from_value(raw.clone()).map_err(|err| {
        vec![ValidationError::new(
            ValidationErrorCode::MissingDefinition,
            format!("workflow definition undecodable: {err}"),
        )]
    })?;
    parse(&definition)
}

/// Validate the definition and compile the executable plan.
///
/// # Errors
/// Every violation found, coded per [`ValidationErrorCode`].
pub fn parse(definition: &WorkflowDefinition) -> Result<ParsedWorkflow, Vec<ValidationError>> {
    let mut errors = Vec::new();
    let dag = &definition.dag;

    if dag.nodes.is_empty() {
        return Err(vec![ValidationError::new(
            ValidationErrorCode::NoNodes,
            "workflow has no nodes",
        )]);
    }

    // -----------------------------------------------------------------------
    // 1. Per-node field and bounds checks
    // -----------------------------------------------------------------------
    for node in &dag.nodes {
        if node.id.is_empty() {
            errors.push(ValidationError::new(
                ValidationErrorCode::MissingNodeId,
                "node is missing an id",
            ));
        }
        if node.name.is_empty() {
            errors.push(
                ValidationError::new(ValidationErrorCode::MissingNodeName, "node has no name")
                    .at_node(&node.id),
            );
        }
        if node.node_type.is_empty() {
            errors.push(
                ValidationError::new(ValidationErrorCode::MissingNodeType, "node has no type")
                    .at_node(&node.id),
            );
        } else if node.parsed_type().is_none() {
            errors.push(
                ValidationError::new(
                    ValidationErrorCode::UnsupportedNodeType,
                    format!("unsupported node type '{}'", node.node_type),
                )
                .at_node(&node.id),
            );
        }
        if let Some(policy) = &node.retry_policy {
            if policy.max_retries > 10 {
                errors.push(
                    ValidationError::new(
                        ValidationErrorCode::InvalidRetryPolicy,
                        format!("maxRetries {} outside [0, 10]", policy.max_retries),
                    )
                    .at_node(&node.id),
                );
            }
            if !(100..=300_000).contains(&policy.backoff_ms) {
                errors.push(
                    ValidationError::new(
                        ValidationErrorCode::InvalidBackoff,
                        format!("backoffMs {} outside [100, 300000]", policy.backoff_ms),
                    )
                    .at_node(&node.id),
                );
            }
        }
        if !(1_000..=3_600_000).contains(&node.timeout_ms) {
            errors.push(
                ValidationError::new(
                    ValidationErrorCode::InvalidTimeout,
                    format!("timeoutMs {} outside [1000, 3600000]", node.timeout_ms),
                )
                .at_node(&node.id),
            );
        }
    }

    // -----------------------------------------------------------------------
    // 2. Duplicate node IDs
    // -----------------------------------------------------------------------
    let mut seen_nodes: HashSet<&str> = HashSet::new();
    let mut reported_dup_nodes: HashSet<&str> = HashSet::new();
    for node in &dag.nodes {
        if !seen_nodes.insert(&node.id) && reported_dup_nodes.insert(&node.id) {
            errors.push(
                ValidationError::new(
                    ValidationErrorCode::DuplicateNodeIds,
                    format!("duplicate node id '{}'", node.id),
                )
                .at_node(&node.id),
            );
        }
    }

    // -----------------------------------------------------------------------
    // 3. Edge endpoint, self-loop, and duplicate checks
    // -----------------------------------------------------------------------
    let node_ids: HashSet<&str> = dag.nodes.iter().map(|n| n.id.as_str()).collect();
    let mut seen_edge_ids: HashSet<&str> = HashSet::new();
    let mut seen_edge_pairs: HashSet<(&str, &str)> = HashSet::new();
    for edge in &dag.edges {
        if !node_ids.contains(edge.from_node_id.as_str()) {
            errors.push(
                ValidationError::new(
                    ValidationErrorCode::InvalidFromNode,
                    format!("edge references unknown from node '{}'", edge.from_node_id),
                )
                .at_edge(&edge.id),
            );
        }
        if !node_ids.contains(edge.to_node_id.as_str()) {
            errors.push(
                ValidationError::new(
                    ValidationErrorCode::InvalidToNode,
                    format!("edge references unknown to node '{}'", edge.to_node_id),
                )
                .at_edge(&edge.id),
            );
        }
        if edge.from_node_id == edge.to_node_id {
            errors.push(
                ValidationError::new(
                    ValidationErrorCode::SelfReferencingEdge,
                    format!("edge loops node '{}' onto itself", edge.from_node_id),
                )
                .at_edge(&edge.id),
            );
        }
        if !seen_edge_ids.insert(&edge.id) {
            errors.push(
                ValidationError::new(
                    ValidationErrorCode::DuplicateEdgeIds,
                    format!("duplicate edge id '{}'", edge.id),
                )
                .at_edge(&edge.id),
            );
        }
        if !seen_edge_pairs.insert((&edge.from_node_id, &edge.to_node_id)) {
            errors.push(
                ValidationError::new(
                    ValidationErrorCode::DuplicateEdges,
                    format!(
                        "duplicate edge '{}' -> '{}'",
                        edge.from_node_id, edge.to_node_id
                    ),
                )
                .at_edge(&edge.id),
            );
        }
    }

    // Structural checks below assume well-formed endpoints.
    if !errors.is_empty() {
        return Err(errors);
    }

    // -----------------------------------------------------------------------
    // 4. Entry nodes and cycles
    // -----------------------------------------------------------------------
    let mut in_degree: HashMap<&str, usize> = dag.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &dag.edges {
        adjacency
            .entry(edge.from_node_id.as_str())
            .or_default()
            .push(edge.to_node_id.as_str());
        *in_degree.entry(edge.to_node_id.as_str()).or_insert(0) += 1;
    }

    let entry_nodes: Vec<String> = dag
        .nodes
        .iter()
        .filter(|n| in_degree[n.id.as_str()] == 0)
        .filter(|n| n.parsed_type() != Some(NodeType::Compensation))
        .map(|n| n.id.clone())
        .collect();
    if entry_nodes.is_empty() {
        errors.push(ValidationError::new(
            ValidationErrorCode::NoEntryNodes,
            "workflow has no entry nodes",
        ));
    }

    if let Some(cycle) = find_cycle(&dag.nodes, &adjacency) {
        errors.push(ValidationError::new(
            ValidationErrorCode::CycleDetected,
            format!("cycle detected: {}", cycle.join(" -> ")),
        ));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    // -----------------------------------------------------------------------
    // 5. Topological order (Kahn's algorithm, definition-order tie-break)
    // -----------------------------------------------------------------------
    let index_of: HashMap<&str, usize> = dag
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut remaining_degree = in_degree.clone();
    let mut ready: BTreeSet<usize> = remaining_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| index_of[id])
        .collect();

    let mut topological_order: Vec<String> = Vec::with_capacity(dag.nodes.len());
    while let Some(&index) = ready.iter().next() {
        ready.remove(&index);
        let node_id = dag.nodes[index].id.as_str();
        topological_order.push(node_id.to_string());

        for &next in adjacency.get(node_id).map(Vec::as_slice).unwrap_or_default() {
            let degree = remaining_degree.get_mut(next).unwrap();
            *degree -= 1;
            if *degree == 0 {
                ready.insert(index_of[next]);
            }
        }
    }

    // Belt and braces with the DFS check above.
    if topological_order.len() != dag.nodes.len() {
        return Err(vec![ValidationError::new(
            ValidationErrorCode::CycleDetected,
            "topological sort did not cover every node",
        )]);
    }

    // -----------------------------------------------------------------------
    // 6. Assemble the plan
    // -----------------------------------------------------------------------
    let node_type_by_id: HashMap<String, NodeType> = dag
        .nodes
        .iter()
        .filter_map(|n| n.parsed_type().map(|t| (n.id.clone(), t)))
        .collect();

    let mut outgoing_by_node: HashMap<String, Vec<String>> = HashMap::new();
    let mut dependencies_by_node: HashMap<String, Vec<String>> = HashMap::new();
    for node in &dag.nodes {
        outgoing_by_node.entry(node.id.clone()).or_default();
        dependencies_by_node.entry(node.id.clone()).or_default();
    }
    for edge in &dag.edges {
        outgoing_by_node
            .get_mut(&edge.from_node_id)
            .unwrap()
            .push(edge.to_node_id.clone());
        dependencies_by_node
            .get_mut(&edge.to_node_id)
            .unwrap()
            .push(edge.from_node_id.clone());
    }

    let forward_nodes: HashSet<String> = dag
        .nodes
        .iter()
        .filter(|n| n.parsed_type() != Some(NodeType::Compensation))
        .map(|n| n.id.clone())
        .collect();

    let exit_nodes: Vec<String> = topological_order
        .iter()
        .filter(|id| outgoing_by_node[*id].is_empty())
        .filter(|id| forward_nodes.contains(*id))
        .cloned()
        .collect();

    Ok(ParsedWorkflow {
        definition: definition.clone(),
        topological_order,
        entry_nodes,
        exit_nodes,
        node_type_by_id,
        outgoing_by_node,
        dependencies_by_node,
        forward_nodes,
    })
}

/// DFS with an explicit recursion stack; returns the cycle path
/// (`X -> Y -> Z -> X`) on the first back-edge found.
fn find_cycle(
    nodes: &[model::NodeDefinition],
    adjacency: &HashMap<&str, Vec<&str>>,
) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = nodes
        .iter()
        .map(|n| (n.id.as_str(), Mark::Unvisited))
        .collect();

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::OnStack);
        stack.push(node);

        for &next in adjacency.get(node).map(Vec::as_slice).unwrap_or_default() {
            match marks.get(next).copied().unwrap_or(Mark::Unvisited) {
                Mark::OnStack => {
                    // Back-edge: the cycle is the stack from `next` on,
                    // closed back onto `next`.
                    let start = stack.iter().position(|&id| id == next).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|id| id.to_string()).collect();
                    path.push(next.to_string());
                    return Some(path);
                }
                Mark::Unvisited => {
                    if let Some(path) = visit(next, adjacency, marks, stack) {
                        return Some(path);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut stack = Vec::new();
    for node in nodes {
        if marks[node.id.as_str()] == Mark::Unvisited {
            if let Some(path) = visit(node.id.as_str(), adjacency, &mut marks, &mut stack) {
                return Some(path);
            }
        }
    }
    None
}
