//! Tensor storage keyed by variable name.

use super::backend::RuntimeError;
use crate::graph::{Graph, Variable};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Device or context a buffer is allocated on.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Place {
    #[default]
    Cpu,
    Device(usize),
}

#[derive(Debug, Clone, PartialEq)]
struct ScopeTensor {
    value: ArrayD<f32>,
    place: Place,
}

/// Mutable store of parameter and feed buffers.
///
/// Buffers outlive graph runs; executors read parameters and feeds from here
/// and commit writes to persistent variables back into it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    tensors: HashMap<String, ScopeTensor>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name` on `place`, replacing any previous buffer.
    pub fn set(&mut self, name: &str, value: ArrayD<f32>, place: Place) {
        self.tensors
            .insert(name.to_string(), ScopeTensor { value, place });
    }

    pub fn find(&self, name: &str) -> Result<&ArrayD<f32>, RuntimeError> {
        self.tensors
            .get(name)
            .map(|t| &t.value)
            .ok_or_else(|| RuntimeError::VariableNotFound(name.to_string()))
    }

    pub fn place_of(&self, name: &str) -> Result<Place, RuntimeError> {
        self.tensors
            .get(name)
            .map(|t| t.place)
            .ok_or_else(|| RuntimeError::VariableNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ArrayD<f32>> {
        self.tensors.remove(name).map(|t| t.value)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Allocates a buffer for every graph parameter using `init`.
    pub fn init_parameters<F>(&mut self, graph: &Graph, place: Place, mut init: F)
    where
        F: FnMut(&Variable) -> ArrayD<f32>,
    {
        for param in graph.parameters() {
            let value = init(param);
            self.set(&param.name, value, place);
        }
    }

    /// Checks that every parameter buffer matches its shape descriptor.
    pub fn check_parameter_shapes(&self, graph: &Graph) -> Result<(), RuntimeError> {
        for param in graph.parameters() {
            let actual = self.find(&param.name)?.shape();
            if actual != param.shape.as_slice() {
                return Err(RuntimeError::ShapeError(format!(
                    "Buffer of '{}' has shape {:?}, descriptor says {:?}",
                    param.name, actual, param.shape
                )));
            }
        }
        Ok(())
    }
}
