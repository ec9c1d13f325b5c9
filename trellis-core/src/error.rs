//! Errors and Diagnostics
//!
//! Two kinds of failure exist in the engine:
//!
//! - [`EngineError`] is returned from API calls that cannot proceed at all
//!   (an unknown target node, a malformed document). These are hard errors.
//! - [`Diagnostic`]s are recorded while the graph keeps running. A cycle, a
//!   refused inversion or a runaway composite affects only the node or
//!   subtree involved; the rest of the document settles normally.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{ElementId, NodeKey};

/// Hard errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown node {0}")]
    UnknownNode(NodeKey),
    #[error("unknown element type '{0}'")]
    UnknownElementType(String),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("state encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("state decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("engine worker has shut down")]
    WorkerClosed,
}

/// Why an inverse definition declined to move a degree of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Refusal {
    /// Two or more modifiable dependencies alias into one observable.
    Ambiguous,
    /// Every contributor is fixed, or the target itself is fixed.
    Fixed,
    /// The node has no inverse definition, or it produced no instructions.
    NotInvertible,
    /// The desired value contains NaN or an infinity.
    NonFinite,
    /// An entry edge points past the end of its array.
    OutOfRange,
    /// An earlier branch of the same inversion already set this node to a
    /// different value.
    Conflict,
    /// The dependency to modify does not resolve to a node.
    Absent,
    /// The desired value has the wrong shape for the node.
    Mismatch,
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Refusal::Ambiguous => "more than one modifiable contributor",
            Refusal::Fixed => "fixed",
            Refusal::NotInvertible => "not invertible",
            Refusal::NonFinite => "non-finite desired value",
            Refusal::OutOfRange => "entry out of range",
            Refusal::Conflict => "conflicting assignment",
            Refusal::Absent => "dependency absent",
            Refusal::Mismatch => "value shape mismatch",
        };
        f.write_str(text)
    }
}

/// A localized, non-fatal problem observed while settling the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// Forward evaluation revisited a node that was still computing.
    CycleDetected { node: NodeKey },
    /// An inversion branch was declined.
    InversionRefused { node: NodeKey, reason: Refusal },
    /// A composite's expansion was cut off.
    ExpansionNonTermination { composite: ElementId, reason: String },
    /// A name resolved to more than one element in the same scope.
    AmbiguousName { name: String, from: ElementId },
    /// A convergent node hit its iteration limit.
    NotConverged { node: NodeKey, iterations: usize },
}
