//! Module for shape inference over the pruning graph IR.
//!
//! Walks operations in graph order and derives the shape of every output
//! variable from the shapes of its inputs. Parameters are the source of
//! truth: after structural pruning has shrunk a filter, a bias or an FC
//! weight, re-running inference brings the activation descriptors back in
//! line and rejects any operation whose inputs no longer agree.

use crate::graph::{Graph, GraphError, OpId, OpKind, Operation, Shape, VarId};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Invalid tensor rank at operation {op} ({op_type}): expected {expected}D, got {actual}D")]
    InvalidRank {
        op: OpId,
        op_type: String,
        expected: usize,
        actual: usize,
    },

    #[error("Channel mismatch at operation {op} ({op_type}): expected {expected} channels, got {actual}. \
             A dependent tensor was not pruned congruently.")]
    ChannelMismatch {
        op: OpId,
        op_type: String,
        expected: usize,
        actual: usize,
    },

    #[error("Incompatible shapes for operation {op} ({op_type}): {shape1:?} and {shape2:?}")]
    IncompatibleShapes {
        op: OpId,
        op_type: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Invalid attribute for operation {op} ({op_type}): {reason}")]
    InvalidAttribute {
        op: OpId,
        op_type: String,
        reason: String,
    },
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// First dimension of `x` that a broadcast operand of rank `y_rank` aligns
/// with, or `None` when the operand cannot fit.
pub fn broadcast_offset(x_rank: usize, y_rank: usize, axis: isize) -> Option<usize> {
    if y_rank > x_rank {
        return None;
    }
    let start = if axis < 0 {
        x_rank - y_rank
    } else {
        axis as usize
    };
    (start + y_rank <= x_rank).then_some(start)
}

/// Performs shape inference for the whole graph or a single operation.
pub struct ShapeInference;

impl ShapeInference {
    /// Re-derives the output shapes of every operation, in graph order.
    pub fn run(graph: &mut Graph) -> Result<()> {
        for idx in 0..graph.num_ops() {
            Self::infer_op(graph, idx)?;
        }
        Ok(())
    }

    /// Infers and stores the output shape of one operation.
    ///
    /// Operations of unknown kind are left untouched.
    pub fn infer_op(graph: &mut Graph, idx: OpId) -> Result<()> {
        let op = graph.op(idx)?.clone();
        let Some(shape) = Self::output_shape(graph, &op)? else {
            trace!(op = idx, op_type = op.type_name(), "no shape rule, skipping");
            return Ok(());
        };

        for var in op.output_vars() {
            let current = graph.var(var)?;
            // Writing into a parameter must not resize it.
            if current.is_parameter() && current.shape != shape {
                return Err(Self::incompatible(&op, current.shape.clone(), shape));
            }
            graph.set_shape(var, shape.clone())?;
        }
        Ok(())
    }

    fn output_shape(graph: &Graph, op: &Operation) -> Result<Option<Shape>> {
        let shape = match &op.kind {
            OpKind::Conv2d { strides, paddings } => {
                let x = Self::shape_of(graph, op.single_input("Input")?)?;
                let w = Self::shape_of(graph, op.single_input("Filter")?)?;
                Self::expect_rank(op, &x, 4)?;
                Self::expect_rank(op, &w, 4)?;
                if x[1] != w[1] {
                    return Err(Self::channel_mismatch(op, w[1], x[1]));
                }
                let out_h = Self::window_out(op, x[2], w[2], paddings.0, strides.0)?;
                let out_w = Self::window_out(op, x[3], w[3], paddings.1, strides.1)?;
                vec![x[0], w[0], out_h, out_w]
            }

            OpKind::ElementwiseAdd { axis } | OpKind::ElementwiseMul { axis } => {
                let x = Self::shape_of(graph, op.single_input("X")?)?;
                let y = Self::shape_of(graph, op.single_input("Y")?)?;
                let fits = broadcast_offset(x.len(), y.len(), *axis)
                    .map(|start| x[start..start + y.len()] == y[..])
                    .unwrap_or(false);
                if !fits {
                    return Err(Self::incompatible(op, x, y));
                }
                x
            }

            OpKind::Mul { x_num_col_dims } => {
                let x = Self::shape_of(graph, op.single_input("X")?)?;
                let y = Self::shape_of(graph, op.single_input("Y")?)?;
                let k = *x_num_col_dims;
                if k == 0 || k >= x.len() {
                    return Err(ShapeInferenceError::InvalidAttribute {
                        op: op.idx,
                        op_type: op.type_name().to_string(),
                        reason: format!("x_num_col_dims {k} for input of rank {}", x.len()),
                    });
                }
                Self::expect_rank(op, &y, 2)?;
                let cols: usize = x[k..].iter().product();
                if cols != y[0] {
                    return Err(Self::incompatible(op, x, y));
                }
                let mut out = x[..k].to_vec();
                out.push(y[1]);
                out
            }

            OpKind::Concat { axis } => {
                let (&first, rest) =
                    op.input("X")?
                        .split_first()
                        .ok_or_else(|| ShapeInferenceError::InvalidAttribute {
                            op: op.idx,
                            op_type: op.type_name().to_string(),
                            reason: "concat without inputs".to_string(),
                        })?;
                let mut out = Self::shape_of(graph, first)?;
                if *axis >= out.len() {
                    return Err(Self::invalid_rank(op, axis + 1, out.len()));
                }
                for &var in rest {
                    let shape = Self::shape_of(graph, var)?;
                    let same_rest = out.len() == shape.len()
                        && out
                            .iter()
                            .zip(&shape)
                            .enumerate()
                            .all(|(d, (a, b))| d == *axis || a == b);
                    if !same_rest {
                        return Err(Self::incompatible(op, out, shape));
                    }
                    out[*axis] += shape[*axis];
                }
                out
            }

            OpKind::BatchNorm { .. } => {
                let x = Self::shape_of(graph, op.single_input("X")?)?;
                if x.len() < 2 {
                    return Err(Self::invalid_rank(op, 2, x.len()));
                }
                for slot in ["Scale", "Bias", "Mean", "Variance"] {
                    let stat = Self::shape_of(graph, op.single_input(slot)?)?;
                    if stat.len() != 1 {
                        return Err(Self::invalid_rank(op, 1, stat.len()));
                    }
                    if stat[0] != x[1] {
                        return Err(Self::channel_mismatch(op, x[1], stat[0]));
                    }
                }
                x
            }

            OpKind::Relu | OpKind::Assign => Self::shape_of(graph, op.single_input("X")?)?,

            OpKind::Pool2d { ksize, strides, .. } => {
                let x = Self::shape_of(graph, op.single_input("X")?)?;
                Self::expect_rank(op, &x, 4)?;
                let out_h = Self::window_out(op, x[2], ksize.0, 0, strides.0)?;
                let out_w = Self::window_out(op, x[3], ksize.1, 0, strides.1)?;
                vec![x[0], x[1], out_h, out_w]
            }

            OpKind::Mean => vec![1],

            OpKind::Accuracy => {
                let logits = Self::shape_of(graph, op.single_input("Out")?)?;
                let label = Self::shape_of(graph, op.single_input("Label")?)?;
                Self::expect_rank(op, &logits, 2)?;
                if label.first() != logits.first() {
                    return Err(Self::incompatible(op, logits, label));
                }
                vec![1]
            }

            OpKind::Other(_) => return Ok(None),
        };
        Ok(Some(shape))
    }

    fn shape_of(graph: &Graph, var: VarId) -> Result<Shape> {
        Ok(graph.var(var)?.shape.clone())
    }

    fn window_out(op: &Operation, size: usize, k: usize, pad: usize, stride: usize) -> Result<usize> {
        if stride == 0 || size + 2 * pad < k {
            return Err(ShapeInferenceError::InvalidAttribute {
                op: op.idx,
                op_type: op.type_name().to_string(),
                reason: format!("window {k} (pad {pad}, stride {stride}) over extent {size}"),
            });
        }
        Ok((size + 2 * pad - k) / stride + 1)
    }

    fn expect_rank(op: &Operation, shape: &Shape, rank: usize) -> Result<()> {
        if shape.len() != rank {
            return Err(Self::invalid_rank(op, rank, shape.len()));
        }
        Ok(())
    }

    fn invalid_rank(op: &Operation, expected: usize, actual: usize) -> ShapeInferenceError {
        ShapeInferenceError::InvalidRank {
            op: op.idx,
            op_type: op.type_name().to_string(),
            expected,
            actual,
        }
    }

    fn channel_mismatch(op: &Operation, expected: usize, actual: usize) -> ShapeInferenceError {
        ShapeInferenceError::ChannelMismatch {
            op: op.idx,
            op_type: op.type_name().to_string(),
            expected,
            actual,
        }
    }

    fn incompatible(op: &Operation, shape1: Shape, shape2: Shape) -> ShapeInferenceError {
        ShapeInferenceError::IncompatibleShapes {
            op: op.idx,
            op_type: op.type_name().to_string(),
            shape1,
            shape2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::GraphBuilder;

    #[test]
    fn broadcast_offset_rules() {
        assert_eq!(broadcast_offset(4, 1, 1), Some(1));
        assert_eq!(broadcast_offset(4, 2, -1), Some(2));
        assert_eq!(broadcast_offset(2, 3, -1), None);
        assert_eq!(broadcast_offset(4, 2, 3), None);
    }

    #[test]
    fn refresh_follows_pruned_filter() {
        let mut b = GraphBuilder::new();
        let x = b.data("image", vec![2, 3, 6, 6]).unwrap();
        let c0 = b.conv2d(x, 8, 3, 1, 1, true).unwrap();
        let r0 = b.relu(c0).unwrap();
        b.conv2d(r0, 4, 3, 1, 1, false).unwrap();
        let mut g = b.finish();

        let w0 = g.var_id("conv2d_0.w_0").unwrap();
        let b0 = g.var_id("conv2d_0.b_0").unwrap();
        let w1 = g.var_id("conv2d_1.w_0").unwrap();
        g.set_shape(w0, vec![5, 3, 3, 3]).unwrap();
        g.set_shape(b0, vec![5]).unwrap();
        g.set_shape(w1, vec![4, 5, 3, 3]).unwrap();

        ShapeInference::run(&mut g).unwrap();
        assert_eq!(g.var_by_name("relu_0.tmp_0").unwrap().shape, vec![2, 5, 6, 6]);
        assert_eq!(g.var_by_name("conv2d_1.tmp_0").unwrap().shape, vec![2, 4, 6, 6]);
    }

    #[test]
    fn half_pruned_chain_is_rejected() {
        let mut b = GraphBuilder::new();
        let x = b.data("image", vec![1, 3, 6, 6]).unwrap();
        let c0 = b.conv2d(x, 8, 3, 1, 1, false).unwrap();
        b.conv2d(c0, 4, 3, 1, 1, false).unwrap();
        let mut g = b.finish();

        let w0 = g.var_id("conv2d_0.w_0").unwrap();
        g.set_shape(w0, vec![6, 3, 3, 3]).unwrap();
        let err = ShapeInference::run(&mut g).unwrap_err();
        assert!(matches!(
            err,
            ShapeInferenceError::ChannelMismatch { expected: 8, actual: 6, .. }
        ));
    }

    #[test]
    fn unknown_ops_are_skipped() {
        let mut g = Graph::new();
        let x = g.add_activation("x", vec![1, 2]).unwrap();
        let y = g.add_activation("y", vec![9]).unwrap();
        g.add_op(
            OpKind::Other("softmax".to_string()),
            vec![("X", vec![x])],
            vec![("Out", vec![y])],
        )
        .unwrap();
        ShapeInference::run(&mut g).unwrap();
        assert_eq!(g.var(y).unwrap().shape, vec![9]);
    }
}
