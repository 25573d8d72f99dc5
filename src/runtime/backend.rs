//! Abstract interface for executors that run a graph against a scope.

use super::scope::{Place, Scope};
use crate::graph::{Graph, GraphError};
use ndarray::ArrayD;
use thiserror::Error;

/// Errors raised while storing, loading or executing tensors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Variable '{0}' has no buffer in the scope. Initialize or feed it before running the graph.")]
    VariableNotFound(String),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Tensor shape error: {0}")]
    ShapeError(String),

    #[error("Operation '{0}' is not implemented by this executor")]
    UnimplementedOperation(String),

    #[error("This executor cannot run on {0:?}")]
    UnsupportedPlace(Place),

    #[error("Computation error: {0}")]
    ComputationError(String),
}

/// Runs graphs against a tensor scope.
///
/// Implementations evaluate operations in graph order, read parameters and
/// feeds from `scope`, commit writes to parameters back into `scope` and
/// return the values of the fetched variables in request order.
pub trait Executor {
    fn run(
        &self,
        graph: &Graph,
        scope: &mut Scope,
        place: Place,
        fetches: &[&str],
    ) -> Result<Vec<ArrayD<f32>>, RuntimeError>;
}
