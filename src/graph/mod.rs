//! Graph IR: variables, typed operations and the slots that bind them.
//!
//! A [`Graph`] is an arena. Variables and operations are addressed by stable
//! integer IDs (`VarId`, `OpId`), and a name index maps variable names onto
//! those IDs. Operations keep their inputs and outputs in ordered, named
//! slots; a slot may bind one or several variables (e.g. the `X` slot of
//! `concat`).
//!
//! Operation order inside the arena is execution order: builders append
//! operations after their producers, the same way a program block is laid out.

pub mod builder;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Index of an operation in the graph arena.
pub type OpId = usize;
/// Index of a variable in the graph arena.
pub type VarId = usize;
/// Tensor shape descriptor.
pub type Shape = Vec<usize>;

pub type GraphResult<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Variable '{0}' not found in graph")]
    VariableNotFound(String),
    #[error("Variable with ID {0} not found in graph")]
    VarIdNotFound(VarId),
    #[error("Operation with index {0} not found in graph")]
    OpNotFound(OpId),
    #[error("Variable '{0}' is already declared in this graph")]
    DuplicateVariable(String),
    #[error("Operation {op} ({op_type}) has no {direction} slot named '{slot}'")]
    MissingSlot {
        op: OpId,
        op_type: String,
        slot: String,
        direction: &'static str,
    },
}

/// Whether a variable owns persistent storage.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarKind {
    /// Learnable tensor persisted in the scope across runs.
    Parameter,
    /// Feed or intermediate value; lives only for the duration of a run.
    Activation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: VarId,
    pub name: String,
    pub shape: Shape,
    pub kind: VarKind,
}

impl Variable {
    pub fn is_parameter(&self) -> bool {
        self.kind == VarKind::Parameter
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolType {
    Max,
    Avg,
}

/// Closed set of operation kinds.
///
/// Only `conv2d`, `elementwise_add`, `mul`, `concat` and `batch_norm` carry
/// channel structure for pruning; the remaining kinds exist so graphs can be
/// executed end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Slots: `Input`, `Filter` -> `Output`. Filter layout is `[F, C, kH, kW]`.
    Conv2d {
        strides: (usize, usize),
        paddings: (usize, usize),
    },
    /// Slots: `X`, `Y` -> `Out`. `Y` is broadcast onto `X` starting at `axis`
    /// (`-1` aligns trailing dimensions).
    ElementwiseAdd { axis: isize },
    /// Same slot layout and broadcasting as `ElementwiseAdd`.
    ElementwiseMul { axis: isize },
    /// Fully-connected product. Slots: `X`, `Y` -> `Out`. `X` is flattened to
    /// 2-D at `x_num_col_dims` before multiplying with `Y`.
    Mul { x_num_col_dims: usize },
    /// Slots: `X` (many) -> `Out`.
    Concat { axis: usize },
    /// Slots: `X`, `Scale`, `Bias`, `Mean`, `Variance` -> `Y`.
    BatchNorm { epsilon: f32 },
    /// Slots: `X` -> `Out`.
    Relu,
    /// Slots: `X` -> `Out`.
    Pool2d {
        pool_type: PoolType,
        ksize: (usize, usize),
        strides: (usize, usize),
    },
    /// Slots: `X` -> `Out`. Writing to a parameter commits it to the scope.
    Assign,
    /// Slots: `X` -> `Out`, a one-element tensor.
    Mean,
    /// Slots: `Out` (logits `[N, K]`), `Label` (`[N, 1]`) -> `Accuracy`.
    Accuracy,
    /// Any operation type this crate does not model.
    Other(String),
}

impl OpKind {
    /// Framework type name of the operation.
    pub fn type_name(&self) -> &str {
        match self {
            OpKind::Conv2d { .. } => "conv2d",
            OpKind::ElementwiseAdd { .. } => "elementwise_add",
            OpKind::ElementwiseMul { .. } => "elementwise_mul",
            OpKind::Mul { .. } => "mul",
            OpKind::Concat { .. } => "concat",
            OpKind::BatchNorm { .. } => "batch_norm",
            OpKind::Relu => "relu",
            OpKind::Pool2d { .. } => "pool2d",
            OpKind::Assign => "assign",
            OpKind::Mean => "mean",
            OpKind::Accuracy => "accuracy",
            OpKind::Other(name) => name.as_str(),
        }
    }
}

/// A named input or output slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub name: String,
    pub vars: Vec<VarId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Position in the graph arena; used for visited-set tracking.
    pub idx: OpId,
    pub kind: OpKind,
    pub inputs: Vec<Slot>,
    pub outputs: Vec<Slot>,
}

impl Operation {
    pub fn type_name(&self) -> &str {
        self.kind.type_name()
    }

    /// All input variables, flattened in slot order.
    pub fn input_vars(&self) -> Vec<VarId> {
        self.inputs.iter().flat_map(|s| s.vars.iter().copied()).collect()
    }

    /// All output variables, flattened in slot order.
    pub fn output_vars(&self) -> Vec<VarId> {
        self.outputs.iter().flat_map(|s| s.vars.iter().copied()).collect()
    }

    pub fn input(&self, slot: &str) -> GraphResult<&[VarId]> {
        self.inputs
            .iter()
            .find(|s| s.name == slot)
            .map(|s| s.vars.as_slice())
            .ok_or_else(|| self.missing_slot(slot, "input"))
    }

    pub fn output(&self, slot: &str) -> GraphResult<&[VarId]> {
        self.outputs
            .iter()
            .find(|s| s.name == slot)
            .map(|s| s.vars.as_slice())
            .ok_or_else(|| self.missing_slot(slot, "output"))
    }

    /// Single variable bound to `slot`.
    pub fn single_input(&self, slot: &str) -> GraphResult<VarId> {
        self.input(slot)?
            .first()
            .copied()
            .ok_or_else(|| self.missing_slot(slot, "input"))
    }

    pub fn single_output(&self, slot: &str) -> GraphResult<VarId> {
        self.output(slot)?
            .first()
            .copied()
            .ok_or_else(|| self.missing_slot(slot, "output"))
    }

    pub fn consumes(&self, var: VarId) -> bool {
        self.inputs.iter().any(|s| s.vars.contains(&var))
    }

    pub fn produces(&self, var: VarId) -> bool {
        self.outputs.iter().any(|s| s.vars.contains(&var))
    }

    fn missing_slot(&self, slot: &str, direction: &'static str) -> GraphError {
        GraphError::MissingSlot {
            op: self.idx,
            op_type: self.type_name().to_string(),
            slot: slot.to_string(),
            direction,
        }
    }
}

/// Computation graph: an arena of variables and operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    vars: Vec<Variable>,
    ops: Vec<Operation>,
    names: HashMap<String, VarId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a variable. Names are unique within a graph.
    pub fn add_var(&mut self, name: &str, shape: Shape, kind: VarKind) -> GraphResult<VarId> {
        if self.names.contains_key(name) {
            return Err(GraphError::DuplicateVariable(name.to_string()));
        }
        let id = self.vars.len();
        self.vars.push(Variable {
            id,
            name: name.to_string(),
            shape,
            kind,
        });
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn add_parameter(&mut self, name: &str, shape: Shape) -> GraphResult<VarId> {
        self.add_var(name, shape, VarKind::Parameter)
    }

    pub fn add_activation(&mut self, name: &str, shape: Shape) -> GraphResult<VarId> {
        self.add_var(name, shape, VarKind::Activation)
    }

    /// Appends an operation. Every bound variable must already exist.
    pub fn add_op(
        &mut self,
        kind: OpKind,
        inputs: Vec<(&str, Vec<VarId>)>,
        outputs: Vec<(&str, Vec<VarId>)>,
    ) -> GraphResult<OpId> {
        let to_slots = |bindings: Vec<(&str, Vec<VarId>)>| -> GraphResult<Vec<Slot>> {
            bindings
                .into_iter()
                .map(|(name, vars)| {
                    if let Some(&bad) = vars.iter().find(|&&v| v >= self.vars.len()) {
                        return Err(GraphError::VarIdNotFound(bad));
                    }
                    Ok(Slot {
                        name: name.to_string(),
                        vars,
                    })
                })
                .collect()
        };
        let inputs = to_slots(inputs)?;
        let outputs = to_slots(outputs)?;

        let idx = self.ops.len();
        self.ops.push(Operation {
            idx,
            kind,
            inputs,
            outputs,
        });
        Ok(idx)
    }

    pub fn var(&self, id: VarId) -> GraphResult<&Variable> {
        self.vars.get(id).ok_or(GraphError::VarIdNotFound(id))
    }

    pub fn var_id(&self, name: &str) -> GraphResult<VarId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::VariableNotFound(name.to_string()))
    }

    pub fn var_by_name(&self, name: &str) -> GraphResult<&Variable> {
        self.var(self.var_id(name)?)
    }

    /// Replaces the shape descriptor of a variable.
    pub fn set_shape(&mut self, id: VarId, shape: Shape) -> GraphResult<()> {
        let var = self.vars.get_mut(id).ok_or(GraphError::VarIdNotFound(id))?;
        var.shape = shape;
        Ok(())
    }

    pub fn op(&self, idx: OpId) -> GraphResult<&Operation> {
        self.ops.get(idx).ok_or(GraphError::OpNotFound(idx))
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn vars(&self) -> &[Variable] {
        &self.vars
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Parameters in declaration order.
    pub fn parameters(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter().filter(|v| v.is_parameter())
    }

    /// Operations reading `var`, in graph order.
    pub fn consumers(&self, var: VarId) -> Vec<OpId> {
        self.ops
            .iter()
            .filter(|op| op.consumes(var))
            .map(|op| op.idx)
            .collect()
    }

    /// Operations producing any input of `op`, in graph order.
    pub fn producers(&self, op: OpId) -> GraphResult<Vec<OpId>> {
        let inputs = self.op(op)?.input_vars();
        Ok(self
            .ops
            .iter()
            .filter(|candidate| inputs.iter().any(|&v| candidate.produces(v)))
            .map(|candidate| candidate.idx)
            .collect())
    }
}
