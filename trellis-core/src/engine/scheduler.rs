//! Action Scheduling
//!
//! Turns actions into settled graphs.
//!
//! # Algorithm
//!
//! `apply_action` runs in four steps:
//!
//! 1. Invert the desired value into the essential nodes behind the target.
//! 2. Mark the essential nodes that moved and their downstream closure
//!    stale.
//! 3. Settle: resolve edges if the structure moved, run the forward pass,
//!    reconcile composites, and repeat while reconciliation changes the
//!    structure. Composites still changing after
//!    [`max_expansion_rounds`](crate::EngineConfig::max_expansion_rounds)
//!    rounds are cut off.
//! 4. Report every node whose value changed and every node removed.
//!
//! # Transient runs
//!
//! The first transient action on a target opens a run and records the value
//! each essential it touches had before. A later action on the same target
//! restores that baseline before inverting, so only the last action of a
//! run has any effect. The settled action closes the run and commits the
//! net change to the undo history. An action on another target commits the
//! open run first.

use indexmap::IndexMap;
use tracing::{debug, warn};

use super::expander::Expander;
use super::forward::ForwardPass;
use super::inverse::Inversion;
use super::{Action, ActionOutcome, Engine, Snapshot};
use crate::error::{Diagnostic, EngineError, Refusal};
use crate::graph::{EssentialKey, NodeId, NodeKey};
use crate::value::Value;

/// An open run of transient actions on one target.
#[derive(Debug)]
pub(super) struct TransientRun {
    target: NodeKey,
    /// Essential values as they were before the run started.
    baseline: IndexMap<EssentialKey, Value>,
}

/// One essential value changed by a committed action.
#[derive(Debug, Clone)]
pub(super) struct HistoryEntry {
    key: EssentialKey,
    before: Value,
}

impl Engine {
    /// Apply an action and settle the graph.
    ///
    /// A refused inversion is not an error: the outcome reports
    /// `accepted == false` and the values stay where they were. Only an
    /// unknown target is an error.
    ///
    /// An action continuing the open transient run may name a target that
    /// the run itself removed; restoring the baseline brings it back. If it
    /// does not come back, the run is dropped, the outcome reports the
    /// reverted values and is refused with [`Refusal::Absent`].
    #[tracing::instrument(
        level = "debug",
        skip(self, action),
        fields(target = %action.target, transient = action.transient)
    )]
    pub fn apply_action(&mut self, action: Action) -> Result<ActionOutcome, EngineError> {
        let continues_run = self
            .pending
            .as_ref()
            .is_some_and(|run| run.target == action.target);
        if !continues_run && self.graph.node_id(&action.target).is_none() {
            return Err(EngineError::UnknownNode(action.target));
        }
        let mark = self.diagnostics.len();

        if continues_run {
            self.restore_baseline();
        } else {
            self.commit_pending();
        }
        let Some(target) = self.graph.node_id(&action.target) else {
            // Every essential is back at its baseline, so there is nothing
            // to commit.
            self.pending = None;
            warn!(target = %action.target, "transient target did not survive its baseline");
            self.diagnostics.push(Diagnostic::InversionRefused {
                node: action.target,
                reason: Refusal::Absent,
            });
            return Ok(self.outcome_since(mark, false));
        };

        let outcome = Inversion::new(&mut self.graph).run(target, action.value.clone());
        for (node, reason) in &outcome.refusals {
            self.diagnostics.push(Diagnostic::InversionRefused {
                node: node.clone(),
                reason: *reason,
            });
        }
        if let Some(reason) = outcome.failure {
            warn!(target = %action.target, %reason, "action refused");
        }

        let run = self.pending.get_or_insert_with(|| TransientRun {
            target: action.target.clone(),
            baseline: IndexMap::new(),
        });
        for (node_id, prior) in &outcome.touched {
            let key = self
                .graph
                .node(*node_id)
                .and_then(|node| self.graph.essential_key(node.key()));
            if let Some(key) = key {
                run.baseline.entry(key).or_insert_with(|| prior.clone());
            }
        }

        self.graph
            .mark_changed(outcome.touched.iter().map(|(node_id, _)| *node_id));
        self.settle();
        let changes = self.graph.take_changes();
        if !action.transient {
            self.commit_pending();
        }

        debug!(
            changed = changes.changed.len(),
            removed = changes.removed.len(),
            accepted = outcome.accepted(),
            "action settled"
        );
        Ok(ActionOutcome {
            changed: changes.changed,
            removed: changes.removed,
            diagnostics: self.diagnostics[mark..].to_vec(),
            accepted: outcome.accepted(),
        })
    }

    /// Set an external value and settle everything that reads it.
    #[tracing::instrument(level = "debug", skip(self, value))]
    pub fn set_external(&mut self, name: &str, value: Value) -> ActionOutcome {
        self.commit_pending();
        let mark = self.diagnostics.len();
        let readers = self.graph.set_external(name, value);
        self.mark_stale(readers);
        self.settle();
        self.outcome_since(mark, true)
    }

    /// Revert the most recent committed action.
    ///
    /// An open transient run is committed first, so it is what gets undone.
    /// With nothing to undo the outcome is empty and not accepted.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn undo(&mut self) -> ActionOutcome {
        self.commit_pending();
        let mark = self.diagnostics.len();
        let Some(entries) = self.history.pop() else {
            return ActionOutcome::default();
        };
        let mut restored = Vec::new();
        for entry in entries.iter().rev() {
            restored.extend(self.graph.restore_essential(&entry.key, entry.before.clone()));
        }
        self.graph.mark_changed(restored);
        self.settle();
        self.outcome_since(mark, true)
    }

    /// Replace the essential store and externals with a snapshot taken by
    /// [`Engine::save_state`]. Clears the undo history.
    ///
    /// Essential nodes missing from the snapshot return to their initial
    /// value.
    #[tracing::instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()))]
    pub fn restore_state(&mut self, bytes: &[u8]) -> Result<ActionOutcome, EngineError> {
        let snapshot: Snapshot = rmp_serde::from_slice(bytes)?;
        let mark = self.diagnostics.len();
        self.pending = None;
        self.history.clear();

        let essentials: IndexMap<EssentialKey, Value> = snapshot.essentials.into_iter().collect();
        let mut moved = Vec::new();
        for node_id in self.graph.node_ids() {
            let Some(node) = self.graph.node(node_id).filter(|n| n.is_essential()) else {
                continue;
            };
            let value = self
                .graph
                .essential_key(node.key())
                .and_then(|key| essentials.get(&key))
                .unwrap_or_else(|| node.initial())
                .clone();
            if self.graph.set_value(node_id, value) {
                moved.push(node_id);
            }
        }
        self.graph.replace_essentials(essentials);
        for (name, value) in snapshot.externals {
            let readers = self.graph.set_external(&name, value);
            self.mark_stale(readers);
        }

        self.graph.mark_changed(moved);
        self.settle();
        Ok(self.outcome_since(mark, true))
    }

    /// Run resolution, forward evaluation and expansion to a fixed point.
    pub(super) fn settle(&mut self) {
        let since = self.diagnostics.len();
        let mut rounds = 0;
        loop {
            self.resolve(since);
            ForwardPass::new(&mut self.graph, &self.config, &mut self.diagnostics).run();
            let changed = Expander::new(
                &mut self.graph,
                &self.registry,
                &self.config,
                &mut self.diagnostics,
            )
            .expand_all();
            if changed.is_empty() && !self.graph.needs_resolution() {
                break;
            }

            rounds += 1;
            if rounds >= self.config.max_expansion_rounds {
                let mut expander = Expander::new(
                    &mut self.graph,
                    &self.registry,
                    &self.config,
                    &mut self.diagnostics,
                );
                for composite in changed {
                    expander.halt(composite, format!("no fixed point after {rounds} expansion rounds"));
                }
                self.resolve(since);
                ForwardPass::new(&mut self.graph, &self.config, &mut self.diagnostics).run();
                break;
            }
        }
        debug!(rounds, nodes = self.graph.node_count(), "graph settled");
    }

    /// Re-resolve edges until the structure stops moving. Composites found
    /// reading their own replacements are cut off.
    ///
    /// A resolution problem is reported once per settle: diagnostics already
    /// recorded since `since` are not repeated.
    fn resolve(&mut self, since: usize) {
        while self.graph.needs_resolution() {
            let report = self.graph.resolve_all();
            for diagnostic in report.diagnostics {
                if !self.diagnostics[since..].contains(&diagnostic) {
                    warn!(?diagnostic, "name resolution");
                    self.diagnostics.push(diagnostic);
                }
            }
            if report.self_referencing.is_empty() {
                continue;
            }
            let mut expander = Expander::new(
                &mut self.graph,
                &self.registry,
                &self.config,
                &mut self.diagnostics,
            );
            for composite in report.self_referencing {
                expander.halt(composite, "composite depends on its own replacements".into());
            }
        }
    }

    fn restore_baseline(&mut self) {
        let Some(run) = &self.pending else {
            return;
        };
        let baseline: Vec<(EssentialKey, Value)> = run
            .baseline
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let restored: Vec<NodeId> = baseline
            .into_iter()
            .filter_map(|(key, value)| self.graph.restore_essential(&key, value))
            .collect();
        self.graph.mark_changed(restored);
        self.settle();
    }

    /// Close the open transient run, recording its net effect for undo.
    fn commit_pending(&mut self) {
        let Some(run) = self.pending.take() else {
            return;
        };
        let entries: Vec<HistoryEntry> = run
            .baseline
            .into_iter()
            .filter_map(|(key, before)| {
                let after = self.graph.essential(&key)?;
                (after != &before).then_some(HistoryEntry { key, before })
            })
            .collect();
        if !entries.is_empty() {
            debug!(target = %run.target, essentials = entries.len(), "committed action");
            self.history.push(entries);
        }
    }

    fn mark_stale(&mut self, nodes: Vec<NodeId>) {
        for node_id in nodes {
            if let Some(node) = self.graph.node_mut(node_id) {
                node.mark_stale();
            }
        }
    }

    fn outcome_since(&mut self, mark: usize, accepted: bool) -> ActionOutcome {
        let changes = self.graph.take_changes();
        ActionOutcome {
            changed: changes.changed,
            removed: changes.removed,
            diagnostics: self.diagnostics[mark..].to_vec(),
            accepted,
        }
    }
}
