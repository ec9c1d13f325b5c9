//! Inverse Solver
//!
//! Pushes a desired value from a node back to the essential nodes that
//! produce it.
//!
//! # Algorithm
//!
//! - An essential node is set directly. Fixed nodes refuse.
//! - A derived node calls its inverse definition, which either refuses or
//!   returns one instruction per dependency to move. Each instruction is an
//!   independent branch, tried in the order returned.
//! - A branch that fails is rolled back; the others keep their effect. A
//!   node fails only if none of its branches succeed.
//! - An essential node assigned twice in one inversion keeps the first
//!   value. A later branch asking for a different value is refused with
//!   [`Refusal::Conflict`].
//!
//! Every refusal is recorded once, at the node where it arose.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, trace};

use super::forward::gather;
use crate::error::Refusal;
use crate::graph::{EdgeTarget, Graph, NodeId, NodeKey, ResolvedEdge, Validity};
use crate::registry::{Derivation, Desired, InverseResult};
use crate::value::Value;

/// What one inversion did.
#[derive(Debug, Default)]
pub(crate) struct InversionOutcome {
    /// Essential nodes that were set, with the value they had before.
    pub touched: Vec<(NodeId, Value)>,
    pub refusals: Vec<(NodeKey, Refusal)>,
    /// The reason the target node itself failed, if it did.
    pub failure: Option<Refusal>,
}

impl InversionOutcome {
    pub fn accepted(&self) -> bool {
        self.failure.is_none()
    }
}

pub(crate) struct Inversion<'a> {
    graph: &'a mut Graph,
    assigned: IndexMap<NodeId, Value>,
    /// Assigned nodes in assignment order, with their prior value and
    /// prior essential-store entry.
    journal: Vec<(NodeId, Value, Option<Value>)>,
    refusals: Vec<(NodeKey, Refusal)>,
    visiting: HashSet<NodeId>,
}

impl<'a> Inversion<'a> {
    pub(crate) fn new(graph: &'a mut Graph) -> Self {
        Self {
            graph,
            assigned: IndexMap::new(),
            journal: Vec::new(),
            refusals: Vec::new(),
            visiting: HashSet::new(),
        }
    }

    /// Invert `desired` into `target`. On failure every assignment is
    /// rolled back.
    pub(crate) fn run(mut self, target: NodeId, desired: Value) -> InversionOutcome {
        let failure = self.invert(target, desired).err();
        if failure.is_some() {
            self.rollback(0);
        }
        debug!(
            assigned = self.journal.len(),
            refused = self.refusals.len(),
            "inversion finished"
        );
        InversionOutcome {
            touched: self
                .journal
                .into_iter()
                .map(|(node_id, prior, _)| (node_id, prior))
                .collect(),
            refusals: self.refusals,
            failure,
        }
    }

    fn refuse(&mut self, node: NodeId, reason: Refusal) -> Result<(), Refusal> {
        if let Some(node) = self.graph.node(node) {
            trace!(node = %node.key(), %reason, "inversion refused");
            self.refusals.push((node.key().clone(), reason));
        }
        Err(reason)
    }

    fn rollback(&mut self, mark: usize) {
        while self.journal.len() > mark {
            let Some((node_id, prior, stored)) = self.journal.pop() else {
                break;
            };
            self.assigned.shift_remove(&node_id);
            self.graph.revert_essential(node_id, prior, stored);
        }
    }

    fn invert(&mut self, node_id: NodeId, desired: Value) -> Result<(), Refusal> {
        let Some(node) = self.graph.node(node_id) else {
            return Err(Refusal::Absent);
        };
        if node.is_fixed() {
            return self.refuse(node_id, Refusal::Fixed);
        }
        if !desired.is_finite() && !node.allows_non_finite() {
            return self.refuse(node_id, Refusal::NonFinite);
        }
        if node.validity() == Validity::Error {
            return self.refuse(node_id, Refusal::NotInvertible);
        }

        if node.is_essential() {
            if let Some(previous) = self.assigned.get(&node_id) {
                return if previous == &desired {
                    Ok(())
                } else {
                    self.refuse(node_id, Refusal::Conflict)
                };
            }
            let prior = node.value().clone();
            let stored = self
                .graph
                .essential_key(node.key())
                .and_then(|key| self.graph.essential(&key).cloned());
            self.journal.push((node_id, prior, stored));
            self.assigned.insert(node_id, desired.clone());
            self.graph.assign_essential(node_id, desired);
            return Ok(());
        }

        let Some(derivation) = node.derivation().map(Arc::clone) else {
            return self.refuse(node_id, Refusal::NotInvertible);
        };
        let Some(inverse) = derivation.inverse.clone() else {
            return self.refuse(node_id, Refusal::NotInvertible);
        };
        if !self.visiting.insert(node_id) {
            return self.refuse(node_id, Refusal::NotInvertible);
        }

        let edges = node.edges().to_vec();
        let result = {
            let deps = gather(self.graph, node_id, &derivation, &edges, None);
            inverse(&desired, &deps)
        };
        let outcome = match result {
            InverseResult::Refused(reason) => self.refuse(node_id, reason),
            InverseResult::Desired(branches) if branches.is_empty() => {
                self.refuse(node_id, Refusal::NotInvertible)
            }
            InverseResult::Desired(branches) => {
                let mut first_failure = None;
                let mut succeeded = 0;
                for branch in branches {
                    let mark = self.journal.len();
                    match self.branch(node_id, &derivation, &edges, branch) {
                        Ok(()) => succeeded += 1,
                        Err(reason) => {
                            self.rollback(mark);
                            first_failure.get_or_insert(reason);
                        }
                    }
                }
                match (succeeded, first_failure) {
                    (0, Some(reason)) => Err(reason),
                    _ => Ok(()),
                }
            }
        };
        self.visiting.remove(&node_id);
        outcome
    }

    /// Apply one instruction of `reader`'s inverse definition.
    fn branch(
        &mut self,
        reader: NodeId,
        derivation: &Derivation,
        edges: &[ResolvedEdge],
        desired: Desired,
    ) -> Result<(), Refusal> {
        let Some(index) = derivation
            .dependencies
            .iter()
            .position(|(name, _)| *name == desired.dependency)
        else {
            return self.refuse(reader, Refusal::Absent);
        };
        match (edges.get(index), desired.member) {
            (None | Some(ResolvedEdge::Absent), _) => self.refuse(reader, Refusal::Absent),
            (Some(ResolvedEdge::One(target)), None | Some(0)) => {
                let target = target.clone();
                self.target(reader, &target, desired.value)
            }
            (Some(ResolvedEdge::One(_)), Some(_)) => self.refuse(reader, Refusal::OutOfRange),
            (Some(ResolvedEdge::Many(targets)), Some(member)) => match targets.get(member) {
                Some(target) => {
                    let target = target.clone();
                    self.target(reader, &target, desired.value)
                }
                None => self.refuse(reader, Refusal::OutOfRange),
            },
            (Some(ResolvedEdge::Many(targets)), None) => {
                let Some(values) = desired.value.as_list().filter(|v| v.len() == targets.len())
                else {
                    return self.refuse(reader, Refusal::Mismatch);
                };
                let pairs: Vec<(EdgeTarget, Value)> =
                    targets.iter().cloned().zip(values.iter().cloned()).collect();
                for (target, value) in pairs {
                    self.target(reader, &target, value)?;
                }
                Ok(())
            }
        }
    }

    fn target(&mut self, reader: NodeId, target: &EdgeTarget, value: Value) -> Result<(), Refusal> {
        match target {
            EdgeTarget::Node(producer) => self.invert(*producer, value),
            EdgeTarget::Entry(producer, index) => {
                let current = self
                    .graph
                    .node(*producer)
                    .and_then(|n| n.value().as_list().map(<[Value]>::to_vec));
                match current {
                    Some(mut items) if *index < items.len() => {
                        items[*index] = value;
                        self.invert(*producer, Value::List(items))
                    }
                    _ => self.refuse(reader, Refusal::OutOfRange),
                }
            }
            EdgeTarget::Constant(_) | EdgeTarget::Element(_) | EdgeTarget::External(_) => {
                self.refuse(reader, Refusal::Fixed)
            }
            EdgeTarget::Item { .. } | EdgeTarget::Previous => {
                self.refuse(reader, Refusal::NotInvertible)
            }
        }
    }
}
