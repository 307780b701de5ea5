//! In-memory DAG over dotted-path phase ids.
//!
//! The plan store persists phases and their `requires` edges flat, one row
//! per phase/dependency. [`PhaseGraph`] assembles them into forward/reverse
//! adjacency so the plan engine can do DFS pre-order traversal and
//! descendant lookups (for rollback ordering) without round-tripping to the
//! database on every step.

use std::collections::{HashMap, HashSet};

use keel_db::models::Phase;

/// A phase node as seen by the graph: just enough to drive traversal.
#[derive(Debug, Clone)]
pub struct PhaseNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub requires: Vec<String>,
}

/// The DAG of a single plan's phases, built from the flat rows the plan
/// store returns.
#[derive(Debug, Default)]
pub struct PhaseGraph {
    nodes: HashMap<String, PhaseNode>,
    /// id -> ids that require it (reverse of `requires`).
    dependents: HashMap<String, Vec<String>>,
    /// parent_id -> child ids, in insertion order.
    children: HashMap<Option<String>, Vec<String>>,
    /// Root-to-leaf DFS pre-order, computed once at construction.
    pre_order: Vec<String>,
}

impl PhaseGraph {
    /// Build a graph from plan-store rows plus the phases' `requires` edges.
    ///
    /// `requires` is supplied separately (rather than read off `Phase`)
    /// because the plan store keeps dependency edges in their own table.
    pub fn build(phases: &[Phase], requires: &HashMap<String, Vec<String>>) -> Self {
        let mut nodes = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut children: HashMap<Option<String>, Vec<String>> = HashMap::new();

        for phase in phases {
            let reqs = requires.get(&phase.id).cloned().unwrap_or_default();
            for req in &reqs {
                dependents.entry(req.clone()).or_default().push(phase.id.clone());
            }
            children
                .entry(phase.parent_id.clone())
                .or_default()
                .push(phase.id.clone());

            nodes.insert(
                phase.id.clone(),
                PhaseNode {
                    id: phase.id.clone(),
                    parent_id: phase.parent_id.clone(),
                    requires: reqs,
                },
            );
        }

        for ids in children.values_mut() {
            ids.sort();
        }

        let mut graph = PhaseGraph {
            nodes,
            dependents,
            children,
            pre_order: Vec::new(),
        };
        graph.pre_order = graph.compute_pre_order();
        graph
    }

    fn compute_pre_order(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited = HashSet::new();
        let mut roots = self.children.get(&None).cloned().unwrap_or_default();
        roots.sort();
        for root in roots {
            self.visit_pre_order(&root, &mut order, &mut visited);
        }
        order
    }

    fn visit_pre_order(&self, id: &str, order: &mut Vec<String>, visited: &mut HashSet<String>) {
        if !visited.insert(id.to_string()) {
            return;
        }
        order.push(id.to_string());
        if let Some(kids) = self.children.get(&Some(id.to_string())) {
            for kid in kids {
                self.visit_pre_order(kid, order, visited);
            }
        }
    }

    /// DFS pre-order, lexicographically tie-broken at each level -- the
    /// ordering `ExecutePlan` selects the next frontier phase from.
    pub fn pre_order(&self) -> &[String] {
        &self.pre_order
    }

    /// Pick the earliest-ordered id (by this graph's pre-order) among a set
    /// of candidate frontier ids. Falls back to lexicographic order for any
    /// id the graph doesn't know about (should not happen in practice).
    pub fn earliest<'a>(&self, candidates: &'a [String]) -> Option<&'a str> {
        candidates
            .iter()
            .min_by_key(|id| {
                self.pre_order
                    .iter()
                    .position(|p| p == *id)
                    .unwrap_or(usize::MAX)
            })
            .map(|s| s.as_str())
    }

    /// Ids that directly require `id`.
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every id reachable by following `dependents_of` transitively,
    /// ordered so that the farthest descendants come first -- the order
    /// `RollbackPhase` tears phases down in (children/dependents before the
    /// phase they depend on).
    pub fn rollback_order(&self, id: &str) -> Vec<String> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        self.visit_rollback(id, &mut order, &mut visited);
        order
    }

    fn visit_rollback(&self, id: &str, order: &mut Vec<String>, visited: &mut HashSet<String>) {
        if !visited.insert(id.to_string()) {
            return;
        }
        for dependent in self.dependents_of(id).to_vec() {
            self.visit_rollback(&dependent, order, visited);
        }
        order.push(id.to_string());
    }

    pub fn get(&self, id: &str) -> Option<&PhaseNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_db::models::PhaseState;
    use uuid::Uuid;

    fn phase(id: &str, parent: Option<&str>) -> Phase {
        Phase {
            plan_id: Uuid::nil(),
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            executor: "noop".to_string(),
            data: serde_json::json!({}),
            state: PhaseState::Unstarted,
            revision: 0,
            error_kind: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    fn linear_graph() -> PhaseGraph {
        let phases = vec![
            phase("validate", None),
            phase("apply/master-1", Some("apply")),
            phase("apply/master-2", Some("apply")),
            phase("restart", None),
        ];
        let mut requires = HashMap::new();
        requires.insert("apply/master-1".to_string(), vec!["validate".to_string()]);
        requires.insert("apply/master-2".to_string(), vec!["validate".to_string()]);
        requires.insert(
            "restart".to_string(),
            vec!["apply/master-1".to_string(), "apply/master-2".to_string()],
        );
        PhaseGraph::build(&phases, &requires)
    }

    #[test]
    fn pre_order_visits_roots_before_children_lexicographically() {
        let graph = linear_graph();
        assert_eq!(graph.pre_order()[0], "apply/master-1");
        assert!(graph.pre_order().contains(&"restart".to_string()));
        assert!(graph.pre_order().contains(&"validate".to_string()));
    }

    #[test]
    fn earliest_picks_lowest_pre_order_position() {
        let graph = linear_graph();
        let candidates = vec!["restart".to_string(), "validate".to_string()];
        assert_eq!(graph.earliest(&candidates), Some("validate"));
    }

    #[test]
    fn dependents_of_validate_are_both_apply_phases() {
        let graph = linear_graph();
        let mut deps = graph.dependents_of("validate").to_vec();
        deps.sort();
        assert_eq!(deps, vec!["apply/master-1", "apply/master-2"]);
    }

    #[test]
    fn rollback_order_puts_dependents_before_dependency() {
        let graph = linear_graph();
        let order = graph.rollback_order("validate");
        let validate_pos = order.iter().position(|s| s == "validate").unwrap();
        let m1_pos = order.iter().position(|s| s == "apply/master-1").unwrap();
        let restart_pos = order.iter().position(|s| s == "restart").unwrap();
        assert!(m1_pos < validate_pos);
        assert!(restart_pos < m1_pos);
    }

    #[test]
    fn empty_graph_has_no_nodes() {
        let graph = PhaseGraph::build(&[], &HashMap::new());
        assert!(graph.is_empty());
        assert_eq!(graph.len(), 0);
    }
}
