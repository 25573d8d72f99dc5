//! Layer-level graph construction.
//!
//! Each method appends the operations and parameters of one layer and returns
//! the variable holding the layer's output. Names follow the framework's
//! unique-name scheme (`conv2d_0.w_0`, `conv2d_0.b_0`, `conv2d_0.tmp_0`, ...),
//! which is what the default sensitivity pattern matches against. Output shapes
//! are filled in by shape inference as each operation is added.

use super::{Graph, OpKind, PoolType, Shape, VarId};
use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use std::collections::HashMap;

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Incrementally builds a [`Graph`].
///
/// # Example
///
/// ```
/// use graphslim::graph::builder::GraphBuilder;
///
/// let mut b = GraphBuilder::new();
/// let image = b.data("image", vec![1, 3, 8, 8]).unwrap();
/// let conv = b.conv2d(image, 4, 3, 1, 1, true).unwrap();
/// let graph = b.finish();
/// assert_eq!(graph.var(conv).unwrap().shape, vec![1, 4, 8, 8]);
/// ```
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
    counters: HashMap<&'static str, usize>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn finish(self) -> Graph {
        self.graph
    }

    fn unique_prefix(&mut self, key: &'static str) -> String {
        let counter = self.counters.entry(key).or_insert(0);
        let prefix = format!("{key}_{counter}");
        *counter += 1;
        prefix
    }

    fn channels(&self, input: VarId) -> Result<usize> {
        let shape = &self.graph.var(input)?.shape;
        shape.get(1).copied().ok_or(ShapeInferenceError::InvalidRank {
            op: self.graph.num_ops(),
            op_type: "layer input".to_string(),
            expected: 2,
            actual: shape.len(),
        })
    }

    /// Appends an operation with a single output slot and infers its shape.
    fn push(
        &mut self,
        kind: OpKind,
        inputs: Vec<(&str, Vec<VarId>)>,
        out_slot: &str,
        out_name: &str,
    ) -> Result<VarId> {
        let out = self.graph.add_activation(out_name, Shape::new())?;
        let op = self.graph.add_op(kind, inputs, vec![(out_slot, vec![out])])?;
        ShapeInference::infer_op(&mut self.graph, op)?;
        Ok(out)
    }

    /// Declares a feed variable such as an image batch or labels.
    pub fn data(&mut self, name: &str, shape: Shape) -> Result<VarId> {
        Ok(self.graph.add_activation(name, shape)?)
    }

    /// Square-kernel convolution, optionally followed by a bias add.
    pub fn conv2d(
        &mut self,
        input: VarId,
        num_filters: usize,
        filter_size: usize,
        stride: usize,
        padding: usize,
        bias: bool,
    ) -> Result<VarId> {
        let channels = self.channels(input)?;
        let prefix = self.unique_prefix("conv2d");
        let filter = self.graph.add_parameter(
            &format!("{prefix}.w_0"),
            vec![num_filters, channels, filter_size, filter_size],
        )?;
        let out = self.push(
            OpKind::Conv2d {
                strides: (stride, stride),
                paddings: (padding, padding),
            },
            vec![("Input", vec![input]), ("Filter", vec![filter])],
            "Output",
            &format!("{prefix}.tmp_0"),
        )?;
        if !bias {
            return Ok(out);
        }
        let b = self
            .graph
            .add_parameter(&format!("{prefix}.b_0"), vec![num_filters])?;
        self.push(
            OpKind::ElementwiseAdd { axis: 1 },
            vec![("X", vec![out]), ("Y", vec![b])],
            "Out",
            &format!("{prefix}.tmp_1"),
        )
    }

    /// Inference-mode batch normalization over axis 1.
    pub fn batch_norm(&mut self, input: VarId) -> Result<VarId> {
        let channels = self.channels(input)?;
        let prefix = self.unique_prefix("batch_norm");
        let scale = self
            .graph
            .add_parameter(&format!("{prefix}.w_0"), vec![channels])?;
        let bias = self
            .graph
            .add_parameter(&format!("{prefix}.b_0"), vec![channels])?;
        let mean = self
            .graph
            .add_parameter(&format!("{prefix}.w_1"), vec![channels])?;
        let variance = self
            .graph
            .add_parameter(&format!("{prefix}.w_2"), vec![channels])?;
        self.push(
            OpKind::BatchNorm { epsilon: 1e-5 },
            vec![
                ("X", vec![input]),
                ("Scale", vec![scale]),
                ("Bias", vec![bias]),
                ("Mean", vec![mean]),
                ("Variance", vec![variance]),
            ],
            "Y",
            &format!("{prefix}.tmp_0"),
        )
    }

    pub fn relu(&mut self, input: VarId) -> Result<VarId> {
        let prefix = self.unique_prefix("relu");
        self.push(
            OpKind::Relu,
            vec![("X", vec![input])],
            "Out",
            &format!("{prefix}.tmp_0"),
        )
    }

    pub fn pool2d(
        &mut self,
        input: VarId,
        pool_type: PoolType,
        size: usize,
        stride: usize,
    ) -> Result<VarId> {
        let prefix = self.unique_prefix("pool2d");
        self.push(
            OpKind::Pool2d {
                pool_type,
                ksize: (size, size),
                strides: (stride, stride),
            },
            vec![("X", vec![input])],
            "Out",
            &format!("{prefix}.tmp_0"),
        )
    }

    /// Fully-connected layer over the flattened `[C, H, W]` features.
    pub fn fc(&mut self, input: VarId, size: usize, bias: bool) -> Result<VarId> {
        let in_shape = self.graph.var(input)?.shape.clone();
        let features: usize = in_shape.iter().skip(1).product();
        let prefix = self.unique_prefix("fc");
        let weight = self
            .graph
            .add_parameter(&format!("{prefix}.w_0"), vec![features, size])?;
        let out = self.push(
            OpKind::Mul { x_num_col_dims: 1 },
            vec![("X", vec![input]), ("Y", vec![weight])],
            "Out",
            &format!("{prefix}.tmp_0"),
        )?;
        if !bias {
            return Ok(out);
        }
        let b = self
            .graph
            .add_parameter(&format!("{prefix}.b_0"), vec![size])?;
        self.push(
            OpKind::ElementwiseAdd { axis: 1 },
            vec![("X", vec![out]), ("Y", vec![b])],
            "Out",
            &format!("{prefix}.tmp_1"),
        )
    }

    /// Channel concatenation.
    pub fn concat(&mut self, inputs: &[VarId]) -> Result<VarId> {
        let prefix = self.unique_prefix("concat");
        self.push(
            OpKind::Concat { axis: 1 },
            vec![("X", inputs.to_vec())],
            "Out",
            &format!("{prefix}.tmp_0"),
        )
    }

    /// Same-shape addition, e.g. a residual shortcut.
    pub fn elementwise_add(&mut self, x: VarId, y: VarId) -> Result<VarId> {
        let prefix = self.unique_prefix("elementwise_add");
        self.push(
            OpKind::ElementwiseAdd { axis: -1 },
            vec![("X", vec![x]), ("Y", vec![y])],
            "Out",
            &format!("{prefix}.tmp_0"),
        )
    }

    pub fn mean(&mut self, input: VarId) -> Result<VarId> {
        let prefix = self.unique_prefix("mean");
        self.push(
            OpKind::Mean,
            vec![("X", vec![input])],
            "Out",
            &format!("{prefix}.tmp_0"),
        )
    }

    /// Top-1 accuracy of `logits` against integer `label`s.
    pub fn accuracy(&mut self, logits: VarId, label: VarId) -> Result<VarId> {
        let prefix = self.unique_prefix("accuracy");
        self.push(
            OpKind::Accuracy,
            vec![("Out", vec![logits]), ("Label", vec![label])],
            "Accuracy",
            &format!("{prefix}.tmp_0"),
        )
    }
}
