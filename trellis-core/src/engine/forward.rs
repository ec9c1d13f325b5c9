//! Forward Evaluator
//!
//! Recomputes stale derived nodes in dependency order.
//!
//! # Algorithm
//!
//! 1. Extend the stale set to its downstream closure.
//! 2. Kahn's algorithm over the stale set. The ready queue is a min-heap on
//!    [`NodeId`], so among simultaneously ready nodes the oldest one runs
//!    first. This is the fixed evaluation order of the engine.
//! 3. Whatever Kahn could not order sits on or behind a cycle. Those nodes
//!    are pulled depth-first in ascending id order; reaching a node that is
//!    still `Computing` marks it as a cycle member.
//!
//! A stale node whose inputs equal the inputs of its last computation is
//! marked fresh without calling its definition.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::config::EngineConfig;
use crate::error::Diagnostic;
use crate::graph::{EdgeTarget, Graph, NodeId, ResolvedEdge, Validity};
use crate::registry::{Derivation, Deps};
use crate::value::{DepValue, Value};

/// Gather the named dependency values of a node.
///
/// `previous` overrides what a [`EdgeTarget::Previous`] edge reads; convergent
/// iteration uses it to feed the last iterate back in.
pub(crate) fn gather<'d>(
    graph: &Graph,
    node_id: NodeId,
    derivation: &'d Derivation,
    edges: &[ResolvedEdge],
    previous: Option<&Value>,
) -> Deps<'d> {
    let mut deps = Deps::new();
    for (index, (name, _)) in derivation.dependencies.iter().enumerate() {
        let edge = edges.get(index).cloned().unwrap_or_default();
        let value = match (&edge, previous) {
            (ResolvedEdge::One(EdgeTarget::Previous), Some(previous)) => {
                DepValue::One(previous.clone())
            }
            _ => graph.dep_value(node_id, &edge),
        };
        deps.push(name, value, graph.edge_modifiability(&edge));
    }
    deps
}

/// Input values that decide whether a recomputation is needed. Reads of
/// the node's own previous value are left out.
fn input_snapshot(deps: &Deps<'_>, edges: &[ResolvedEdge]) -> Vec<DepValue> {
    deps.entries()
        .iter()
        .enumerate()
        .filter(|(index, _)| edges.get(*index) != Some(&ResolvedEdge::One(EdgeTarget::Previous)))
        .map(|(_, entry)| entry.value.clone())
        .collect()
}

pub(crate) struct ForwardPass<'a> {
    graph: &'a mut Graph,
    config: &'a EngineConfig,
    diagnostics: &'a mut Vec<Diagnostic>,
    recomputed: usize,
}

impl<'a> ForwardPass<'a> {
    pub(crate) fn new(
        graph: &'a mut Graph,
        config: &'a EngineConfig,
        diagnostics: &'a mut Vec<Diagnostic>,
    ) -> Self {
        Self {
            graph,
            config,
            diagnostics,
            recomputed: 0,
        }
    }

    /// Bring every stale node up to date. Returns the number of definitions
    /// that were called.
    pub(crate) fn run(mut self) -> usize {
        self.graph.propagate_staleness();

        let stale: Vec<NodeId> = self
            .graph
            .node_ids()
            .into_iter()
            .filter(|id| self.needs_work(*id))
            .collect();
        if stale.is_empty() {
            return 0;
        }
        let stale_set: HashSet<NodeId> = stale.iter().copied().collect();

        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        for &node_id in &stale {
            let producers: HashSet<NodeId> = self
                .graph
                .node(node_id)
                .map(|n| n.producers().collect())
                .unwrap_or_default();
            let degree = producers
                .iter()
                .filter(|p| **p != node_id && stale_set.contains(p))
                .count();
            in_degree.insert(node_id, degree);
        }

        let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();
        let mut processed = HashSet::new();

        while let Some(Reverse(node_id)) = ready.pop() {
            processed.insert(node_id);
            self.compute(node_id);

            let dependents: Vec<NodeId> = self
                .graph
                .node(node_id)
                .map(|n| n.dependents().iter().copied().collect())
                .unwrap_or_default();
            for dependent in dependents {
                if dependent == node_id {
                    continue;
                }
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 && !processed.contains(&dependent) {
                        ready.push(Reverse(dependent));
                    }
                }
            }
        }

        // Nodes left over are on a cycle or downstream of one.
        for node_id in stale {
            if !processed.contains(&node_id) {
                self.pull(node_id);
            }
        }
        self.recomputed
    }

    /// Evaluate one node, pulling its stale producers first.
    pub(crate) fn evaluate(mut self, node_id: NodeId) -> Value {
        self.graph.propagate_staleness();
        self.pull(node_id);
        self.graph
            .node(node_id)
            .map(|n| n.value().clone())
            .unwrap_or_default()
    }

    fn needs_work(&self, node_id: NodeId) -> bool {
        self.graph.node(node_id).is_some_and(|n| {
            !n.is_essential() && matches!(n.validity(), Validity::Stale | Validity::Computing)
        })
    }

    fn pull(&mut self, node_id: NodeId) {
        let Some(node) = self.graph.node(node_id) else {
            return;
        };
        match node.validity() {
            Validity::Fresh | Validity::Error => return,
            Validity::Computing => {
                let key = node.key().clone();
                warn!(node = %key, "cycle detected during forward evaluation");
                self.graph.mark_error(node_id);
                self.diagnostics.push(Diagnostic::CycleDetected { node: key });
                return;
            }
            Validity::Stale => {}
        }

        let producers: Vec<NodeId> = {
            let mut seen = HashSet::new();
            node.producers()
                .filter(|p| *p != node_id && seen.insert(*p))
                .collect()
        };
        if let Some(node) = self.graph.node_mut(node_id) {
            node.mark_computing();
        }
        for producer in producers {
            self.pull(producer);
        }
        if self.graph.node(node_id).map(|n| n.validity()) == Some(Validity::Computing) {
            self.compute(node_id);
        }
    }

    /// Recompute a node unless its inputs are unchanged.
    fn compute(&mut self, node_id: NodeId) {
        let Some(node) = self.graph.node(node_id) else {
            return;
        };
        let Some(derivation) = node.derivation().map(Arc::clone) else {
            if let Some(node) = self.graph.node_mut(node_id) {
                node.mark_fresh();
            }
            return;
        };
        let key = node.key().clone();
        let edges = node.edges().to_vec();
        let deps = gather(self.graph, node_id, &derivation, &edges, None);
        let snapshot = input_snapshot(&deps, &edges);

        if !node.edges_changed()
            && node.validity() != Validity::Error
            && node.last_inputs() == Some(snapshot.as_slice())
        {
            trace!(node = %key, "inputs unchanged, skipping");
            if let Some(node) = self.graph.node_mut(node_id) {
                node.mark_fresh();
            }
            return;
        }

        let mut value = (derivation.forward)(&deps);
        drop(deps);
        self.recomputed += 1;
        if derivation.convergent {
            value = self.converge(node_id, &derivation, &edges, value);
        }

        trace!(node = %key, value = ?value, "recomputed");
        self.graph.set_value(node_id, value);
        if let Some(node) = self.graph.node_mut(node_id) {
            node.set_last_inputs(snapshot);
            node.mark_fresh();
        }
    }

    /// Iterate a self-referential definition until successive values agree.
    fn converge(
        &mut self,
        node_id: NodeId,
        derivation: &Derivation,
        edges: &[ResolvedEdge],
        first: Value,
    ) -> Value {
        let mut current = first;
        for _ in 1..self.config.max_converge_iterations {
            let deps = gather(self.graph, node_id, derivation, edges, Some(&current));
            let next = (derivation.forward)(&deps);
            self.recomputed += 1;
            if next.approx_eq(&current, self.config.tolerance) {
                return next;
            }
            current = next;
        }
        if let Some(node) = self.graph.node(node_id) {
            let key = node.key().clone();
            warn!(
                node = %key,
                iterations = self.config.max_converge_iterations,
                "convergent node did not settle"
            );
            self.diagnostics.push(Diagnostic::NotConverged {
                node: key,
                iterations: self.config.max_converge_iterations,
            });
        }
        current
    }
}
