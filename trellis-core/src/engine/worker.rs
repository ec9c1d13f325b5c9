//! Engine worker
//!
//! Runs an [`Engine`] on a tokio task behind a command channel. Commands
//! are processed strictly in arrival order, one turn at a time: a turn takes
//! every command already queued, drops each transient action that the very
//! next command supersedes (an action on the same target), applies the rest
//! and publishes a single merged [`RenderUpdate`].

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Action, ActionOutcome, Engine};
use crate::error::{Diagnostic, EngineError};
use crate::graph::NodeKey;
use crate::value::Value;

/// A request sent to the worker.
#[derive(Debug)]
pub enum Command {
    Apply(Action),
    SetExternal { name: String, value: Value },
    Undo,
    /// Reply with the value of every node once all earlier commands ran.
    Snapshot(oneshot::Sender<IndexMap<NodeKey, Value>>),
    Shutdown,
}

/// The merged effect of one processing turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenderUpdate {
    pub changed: IndexMap<NodeKey, Value>,
    pub removed: Vec<NodeKey>,
    pub diagnostics: Vec<Diagnostic>,
}

impl RenderUpdate {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty() && self.diagnostics.is_empty()
    }

    fn merge(&mut self, outcome: ActionOutcome) {
        for key in outcome.removed {
            self.changed.shift_remove(&key);
            if !self.removed.contains(&key) {
                self.removed.push(key);
            }
        }
        for (key, value) in outcome.changed {
            self.removed.retain(|k| k != &key);
            self.changed.insert(key, value);
        }
        self.diagnostics.extend(outcome.diagnostics);
    }
}

/// Cloneable handle to a running worker.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<RwLock<IndexMap<NodeKey, Value>>>,
}

impl EngineHandle {
    pub fn apply(&self, action: Action) -> Result<(), EngineError> {
        self.send(Command::Apply(action))
    }

    pub fn set_external(&self, name: impl Into<String>, value: Value) -> Result<(), EngineError> {
        self.send(Command::SetExternal {
            name: name.into(),
            value,
        })
    }

    pub fn undo(&self) -> Result<(), EngineError> {
        self.send(Command::Undo)
    }

    /// Full state after every command sent before this call has run.
    pub async fn snapshot(&self) -> Result<IndexMap<NodeKey, Value>, EngineError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Snapshot(reply))?;
        response.await.map_err(|_| EngineError::WorkerClosed)
    }

    pub fn shutdown(&self) -> Result<(), EngineError> {
        self.send(Command::Shutdown)
    }

    /// The state as of the last published update.
    pub fn state(&self) -> IndexMap<NodeKey, Value> {
        self.state.read().clone()
    }

    /// The last published value of one node.
    pub fn value(&self, key: &NodeKey) -> Option<Value> {
        self.state.read().get(key).cloned()
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::WorkerClosed)
    }
}

/// Spawn a worker task owning `engine`.
///
/// Returns the command handle, the stream of render updates, and the task
/// handle, which yields the engine back after shutdown. Must be called
/// from within a tokio runtime.
pub fn spawn_worker(
    mut engine: Engine,
) -> (EngineHandle, mpsc::UnboundedReceiver<RenderUpdate>, JoinHandle<Engine>) {
    let (commands, inbox) = mpsc::unbounded_channel();
    let (updates, receiver) = mpsc::unbounded_channel();
    let state = Arc::new(RwLock::new(engine.evaluate_all()));
    let handle = EngineHandle {
        commands,
        state: Arc::clone(&state),
    };
    let task = tokio::spawn(run(engine, inbox, updates, state));
    (handle, receiver, task)
}

async fn run(
    mut engine: Engine,
    mut inbox: mpsc::UnboundedReceiver<Command>,
    updates: mpsc::UnboundedSender<RenderUpdate>,
    state: Arc<RwLock<IndexMap<NodeKey, Value>>>,
) -> Engine {
    while let Some(first) = inbox.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = inbox.try_recv() {
            batch.push(next);
        }
        let received = batch.len();
        let batch = coalesce(batch);
        debug!(received, kept = batch.len(), "worker turn");

        let mut update = RenderUpdate::default();
        let mut shutdown = false;
        for command in batch {
            match command {
                Command::Apply(action) => match engine.apply_action(action) {
                    Ok(outcome) => update.merge(outcome),
                    Err(err) => warn!(%err, "action rejected"),
                },
                Command::SetExternal { name, value } => {
                    update.merge(engine.set_external(&name, value));
                }
                Command::Undo => update.merge(engine.undo()),
                Command::Snapshot(reply) => {
                    publish(&state, &updates, std::mem::take(&mut update));
                    // The requester may have gone away.
                    let _ = reply.send(engine.evaluate_all());
                }
                Command::Shutdown => {
                    shutdown = true;
                    break;
                }
            }
            // Outcomes carry their own diagnostics.
            engine.take_diagnostics();
        }
        publish(&state, &updates, update);
        if shutdown {
            break;
        }
    }
    debug!("worker stopped");
    engine
}

fn publish(
    state: &RwLock<IndexMap<NodeKey, Value>>,
    updates: &mpsc::UnboundedSender<RenderUpdate>,
    update: RenderUpdate,
) {
    if update.is_empty() {
        return;
    }
    {
        let mut state = state.write();
        for key in &update.removed {
            state.shift_remove(key);
        }
        for (key, value) in &update.changed {
            state.insert(key.clone(), value.clone());
        }
    }
    if updates.send(update).is_err() {
        debug!("render receiver dropped");
    }
}

/// Drop transient actions immediately followed by another action on the
/// same target. Any other command in between, including an action on a
/// different target, keeps the transient: that command commits the run and
/// would observe its values.
fn coalesce(batch: Vec<Command>) -> Vec<Command> {
    let superseded: Vec<bool> = batch
        .iter()
        .zip(batch.iter().skip(1).map(Some).chain(std::iter::once(None)))
        .map(|(command, next)| match (command, next) {
            (Command::Apply(action), Some(Command::Apply(next))) => {
                action.transient && next.target == action.target
            }
            _ => false,
        })
        .collect();
    batch
        .into_iter()
        .zip(superseded)
        .filter_map(|(command, dropped)| (!dropped).then_some(command))
        .collect()
}
