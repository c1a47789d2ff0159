//! DAG validation and canonical hashing for pipeline definitions.
//!
//! `validate` runs the submit-time checks the engine requires before a
//! pipeline is accepted: cycle-freedom (Kahn's algorithm), edge resolution,
//! guard placement, and in-degree-0 structure. `canonical_hash` normalizes a
//! pipeline's (nodes, edges) shape so re-submitting an identical definition
//! is detected as byte-equal regardless of list ordering.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use orchestrator_types::{EdgeGuard, NodeId, NodeKind, Pipeline};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("pipeline has no nodes")]
    Empty,
    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),
    #[error("edge references unknown node {0}")]
    UnknownNode(NodeId),
    #[error("more than one unguarded edge between {from} and {to}")]
    DuplicateUnguardedEdge { from: NodeId, to: NodeId },
    #[error("guard on edge {from} -> {to} requires a condition source")]
    GuardOnNonCondition { from: NodeId, to: NodeId },
    #[error("trigger node {0} is not at in-degree 0")]
    TriggerNotAtRoot(NodeId),
    #[error("pipeline has no node with in-degree 0")]
    NoSource,
    #[error("pipeline contains a cycle involving {0}")]
    Cycle(NodeId),
}

/// The ordering the engine uses to walk a validated DAG: nodes grouped into
/// dependency levels (level 0 = in-degree-0 nodes), used by
/// `orchestrator-levels` for parallel dispatch and here to prove acyclicity.
pub struct TopoOrder {
    pub order: Vec<NodeId>,
}

/// Run all submit-time structural checks over a pipeline's (nodes, edges).
pub fn validate(pipeline: &Pipeline) -> Result<TopoOrder, PlanError> {
    if pipeline.nodes.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut seen = HashSet::new();
    for node in &pipeline.nodes {
        if !seen.insert(node.id.clone()) {
            return Err(PlanError::DuplicateNode(node.id.clone()));
        }
    }

    let node_ids: HashSet<&NodeId> = pipeline.nodes.iter().map(|n| &n.id).collect();
    let mut unguarded_pairs: HashSet<(NodeId, NodeId)> = HashSet::new();
    for edge in &pipeline.edges {
        if !node_ids.contains(&edge.from) {
            return Err(PlanError::UnknownNode(edge.from.clone()));
        }
        if !node_ids.contains(&edge.to) {
            return Err(PlanError::UnknownNode(edge.to.clone()));
        }
        if edge.guard == EdgeGuard::Unconditional
            && !unguarded_pairs.insert((edge.from.clone(), edge.to.clone()))
        {
            return Err(PlanError::DuplicateUnguardedEdge { from: edge.from.clone(), to: edge.to.clone() });
        }
        if edge.guard != EdgeGuard::Unconditional {
            let source_is_condition = pipeline
                .node(&edge.from)
                .is_some_and(|n| matches!(n.kind, NodeKind::Condition { .. }));
            if !source_is_condition {
                return Err(PlanError::GuardOnNonCondition { from: edge.from.clone(), to: edge.to.clone() });
            }
        }
    }

    let mut in_degree: HashMap<NodeId, u32> = pipeline.nodes.iter().map(|n| (n.id.clone(), 0)).collect();
    for edge in &pipeline.edges {
        *in_degree.get_mut(&edge.to).unwrap() += 1;
    }

    for node in &pipeline.nodes {
        if matches!(node.kind, NodeKind::Trigger) && in_degree[&node.id] != 0 {
            return Err(PlanError::TriggerNotAtRoot(node.id.clone()));
        }
    }

    if !in_degree.values().any(|&d| d == 0) {
        return Err(PlanError::NoSource);
    }

    // Kahn's algorithm: also produces the topological order used for the
    // deterministic side of `canonical_hash` and as a cheap traversal hint.
    let mut remaining = in_degree.clone();
    let mut queue: VecDeque<NodeId> = remaining
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| id.clone())
        .collect();
    // Stable order: sort the initial queue so hash/order are deterministic
    // regardless of the nodes Vec's original ordering.
    let mut initial: Vec<NodeId> = queue.into_iter().collect();
    initial.sort();
    let mut queue: VecDeque<NodeId> = initial.into();

    let mut order = Vec::with_capacity(pipeline.nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        let mut newly_ready: Vec<NodeId> = Vec::new();
        for edge in pipeline.edges_from(&id) {
            let entry = remaining.get_mut(&edge.to).unwrap();
            *entry -= 1;
            if *entry == 0 {
                newly_ready.push(edge.to.clone());
            }
        }
        newly_ready.sort();
        queue.extend(newly_ready);
    }

    if order.len() != pipeline.nodes.len() {
        let stuck = pipeline
            .nodes
            .iter()
            .find(|n| !order.contains(&n.id))
            .map(|n| n.id.clone())
            .unwrap();
        return Err(PlanError::Cycle(stuck));
    }

    Ok(TopoOrder { order })
}

/// Normalize a pipeline's (nodes, edges) into a canonical JSON form (sorted
/// node ids, sorted edges) and hash it. Two submissions of the same
/// effective definition — regardless of list ordering — hash identically.
pub fn canonical_hash(pipeline: &Pipeline) -> String {
    let mut nodes: BTreeMap<&NodeId, &orchestrator_types::Node> =
        pipeline.nodes.iter().map(|n| (&n.id, n)).collect();
    let node_json: Vec<_> = nodes
        .iter_mut()
        .map(|(_, n)| serde_json::to_value(n).unwrap())
        .collect();

    let mut edges: Vec<_> = pipeline.edges.iter().map(|e| serde_json::to_value(e).unwrap()).collect();
    edges.sort_by(|a, b| a.to_string().cmp(&b.to_string()));

    let canonical = serde_json::json!({
        "name": pipeline.name,
        "nodes": node_json,
        "edges": edges,
        "input_schema": pipeline.input_schema,
        "default_policy": pipeline.default_policy,
        "default_failure_mode": pipeline.default_failure_mode,
    });

    let bytes = serde_json::to_vec(&canonical).expect("canonical pipeline form is always serializable");
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_types::{Edge, Node, PipelineId, PipelineStatus};

    fn simple_pipeline() -> Pipeline {
        Pipeline {
            id: PipelineId::new(),
            name: "p".into(),
            version: 1,
            nodes: vec![
                Node::new("t", NodeKind::Trigger),
                Node::new("a", NodeKind::Action { action_kind: orchestrator_types::ActionKind::RunTask, payload: serde_json::json!({}) }),
            ],
            edges: vec![Edge::unconditional("t", "a")],
            input_schema: None,
            default_policy: Default::default(),
            default_failure_mode: Default::default(),
            status: PipelineStatus::Active,
        }
    }

    #[test]
    fn valid_pipeline_passes() {
        let pipeline = simple_pipeline();
        let order = validate(&pipeline).unwrap();
        assert_eq!(order.order, vec![NodeId::from("t"), NodeId::from("a")]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut pipeline = simple_pipeline();
        pipeline.edges.push(Edge::unconditional("a", "t"));
        assert!(matches!(validate(&pipeline), Err(PlanError::Cycle(_))));
    }

    #[test]
    fn unknown_edge_target_is_rejected() {
        let mut pipeline = simple_pipeline();
        pipeline.edges.push(Edge::unconditional("a", "ghost"));
        assert!(matches!(validate(&pipeline), Err(PlanError::UnknownNode(_))));
    }

    #[test]
    fn guard_on_non_condition_source_is_rejected() {
        let mut pipeline = simple_pipeline();
        pipeline.edges.push(Edge::guarded("a", "t", EdgeGuard::True));
        assert!(matches!(validate(&pipeline), Err(PlanError::GuardOnNonCondition { .. })));
    }

    #[test]
    fn canonical_hash_is_stable_under_reordering() {
        let mut a = simple_pipeline();
        let mut b = a.clone();
        b.nodes.reverse();
        a.edges.push(Edge::unconditional("t", "a"));
        // remove the accidental duplicate from the push above for `a` only
        a.edges.pop();
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn canonical_hash_changes_with_content() {
        let a = simple_pipeline();
        let mut b = a.clone();
        b.name = "different".into();
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }
}
