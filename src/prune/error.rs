//! Error taxonomy for pruning and the strategies built on top of it.

use crate::analysis::shape_inference::ShapeInferenceError;
use crate::graph::{GraphError, OpId};
use crate::runtime::backend::RuntimeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PruneError {
    // --- Structural errors: the graph does not look like what propagation expects ---
    #[error("Structural error at operation {op} ({op_type}): {reason}")]
    Structural {
        op: OpId,
        op_type: String,
        reason: String,
    },

    #[error("Operation {op} ({op_type}) merges branches but has no predecessor in the visit path")]
    MissingPredecessor { op: OpId, op_type: String },

    #[error("Operation {op} ({op_type}) was reached before any pruned index set was computed")]
    MissingSeed { op: OpId, op_type: String },

    #[error("Parameter '{name}' cannot be structurally pruned: {reason}")]
    NotPrunable { name: String, reason: String },

    #[error("Axis {axis} is out of range for a tensor of rank {rank}")]
    InvalidAxis { axis: usize, rank: usize },

    #[error("Index {index} is out of range for axis {axis} (extent {extent})")]
    IndexOutOfBounds {
        axis: usize,
        index: usize,
        extent: usize,
    },

    // --- Selection errors ---
    #[error("No parameter has an acceptable pruning ratio; nothing to rescale to the target ratio")]
    NoZeroLossRatio,

    #[error("Invalid pruning ratio {0}; expected a value in [0, 1]")]
    InvalidRatio(f32),

    // --- Storage and execution ---
    #[error("Storage error: {0}")]
    Storage(#[from] RuntimeError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Shape refresh failed: {0}")]
    ShapeInference(#[from] ShapeInferenceError),

    #[error("Metric '{name}' produced an empty tensor")]
    EmptyMetric { name: String },

    // --- Configuration and persistence ---
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Context has no entry named '{0}'")]
    MissingContextEntry(String),

    #[error("Invalid parameter pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PruneError>;

impl PruneError {
    /// `true` for errors caused by the graph topology rather than by storage,
    /// configuration or selection.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            PruneError::Structural { .. }
                | PruneError::MissingPredecessor { .. }
                | PruneError::MissingSeed { .. }
                | PruneError::NotPrunable { .. }
                | PruneError::Graph(_)
        )
    }
}
