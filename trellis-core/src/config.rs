//! Engine configuration.
//!
//! [`EngineConfig`] bounds the work a single action may trigger. All fields
//! have defaults, so a partial JSON object is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Limits and tolerances for one [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum nesting of composites inside replacement sets. Default: 32.
    pub max_expansion_depth: usize,
    /// Maximum expand/settle rounds per action. Default: 64.
    pub max_expansion_rounds: usize,
    /// Maximum logical items a single composite may enumerate. Default: 10 000.
    pub max_replacements: usize,
    /// Numeric tolerance for convergence and round-trip checks. Default: 1e-9.
    pub tolerance: f64,
    /// Iteration cap for self-referential convergent nodes. Default: 100.
    pub max_converge_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_expansion_depth: 32,
            max_expansion_rounds: 64,
            max_replacements: 10_000,
            tolerance: 1e-9,
            max_converge_iterations: 100,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_expansion_rounds == 0 {
            return Err(EngineError::InvalidConfig(
                "max_expansion_rounds must be at least 1".into(),
            ));
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(EngineError::InvalidConfig(format!(
                "tolerance must be a finite non-negative number, got {}",
                self.tolerance
            )));
        }
        if self.max_converge_iterations == 0 {
            return Err(EngineError::InvalidConfig(
                "max_converge_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
