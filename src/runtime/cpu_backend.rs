//! Reference executor running graphs on the CPU with `ndarray`.
//!
//! Operations are evaluated once each, in graph order. Intermediate values
//! live in a per-run frame; parameters and feeds are read from the scope, and
//! any write to a parameter (e.g. by `assign`) is committed back to it.

use super::backend::{Executor, RuntimeError};
use super::scope::{Place, Scope};
use crate::analysis::shape_inference::broadcast_offset;
use crate::graph::{Graph, OpKind, Operation, PoolType, VarId};
use ndarray::{concatenate, s, Array2, Array4, ArrayD, ArrayView, Axis, Ix2, Ix4, IxDyn};
use std::collections::HashMap;

type Result<T> = std::result::Result<T, RuntimeError>;

/// Values produced during one run.
struct ExecutionFrame<'a> {
    graph: &'a Graph,
    scope: &'a mut Scope,
    place: Place,
    values: HashMap<VarId, ArrayD<f32>>,
}

impl<'a> ExecutionFrame<'a> {
    fn read(&self, var: VarId) -> Result<ArrayD<f32>> {
        if let Some(value) = self.values.get(&var) {
            return Ok(value.clone());
        }
        let name = &self.graph.var(var)?.name;
        let place = self.scope.place_of(name)?;
        if place != self.place {
            return Err(RuntimeError::UnsupportedPlace(place));
        }
        Ok(self.scope.find(name)?.clone())
    }

    fn read_slot(&self, op: &Operation, slot: &str) -> Result<ArrayD<f32>> {
        self.read(op.single_input(slot)?)
    }

    fn write(&mut self, var: VarId, value: ArrayD<f32>) -> Result<()> {
        let variable = self.graph.var(var)?;
        if variable.is_parameter() {
            self.scope.set(&variable.name, value.clone(), self.place);
        }
        self.values.insert(var, value);
        Ok(())
    }

    fn execute(&mut self, op: &Operation) -> Result<ArrayD<f32>> {
        match &op.kind {
            OpKind::Conv2d { strides, paddings } => {
                let input = self.read_slot(op, "Input")?;
                let filter = self.read_slot(op, "Filter")?;
                op_conv2d(input, filter, *strides, *paddings)
            }
            OpKind::ElementwiseAdd { axis } => {
                let x = self.read_slot(op, "X")?;
                let y = broadcast_onto(x.shape(), self.read_slot(op, "Y")?, *axis)?;
                Ok(&x + &y)
            }
            OpKind::ElementwiseMul { axis } => {
                let x = self.read_slot(op, "X")?;
                let y = broadcast_onto(x.shape(), self.read_slot(op, "Y")?, *axis)?;
                Ok(&x * &y)
            }
            OpKind::Mul { x_num_col_dims } => {
                let x = self.read_slot(op, "X")?;
                let y = self.read_slot(op, "Y")?;
                op_mul(x, y, *x_num_col_dims)
            }
            OpKind::Concat { axis } => {
                let inputs = op
                    .input("X")?
                    .iter()
                    .map(|&v| self.read(v))
                    .collect::<Result<Vec<_>>>()?;
                let views: Vec<ArrayView<f32, IxDyn>> = inputs.iter().map(|a| a.view()).collect();
                concatenate(Axis(*axis), &views)
                    .map_err(|e| RuntimeError::ShapeError(format!("concat: {e}")))
            }
            OpKind::BatchNorm { epsilon } => {
                let x = self.read_slot(op, "X")?;
                let stats = BatchNormStats {
                    scale: self.read_slot(op, "Scale")?,
                    bias: self.read_slot(op, "Bias")?,
                    mean: self.read_slot(op, "Mean")?,
                    variance: self.read_slot(op, "Variance")?,
                };
                op_batch_norm(x, &stats, *epsilon)
            }
            OpKind::Relu => Ok(self.read_slot(op, "X")?.mapv(|v| v.max(0.0))),
            OpKind::Pool2d {
                pool_type,
                ksize,
                strides,
            } => {
                let x = self.read_slot(op, "X")?;
                op_pool2d(x, *pool_type, *ksize, *strides)
            }
            OpKind::Assign => self.read_slot(op, "X"),
            OpKind::Mean => {
                let x = self.read_slot(op, "X")?;
                let mean = x.mean().ok_or_else(|| {
                    RuntimeError::ComputationError("mean of an empty tensor".to_string())
                })?;
                Ok(ArrayD::from_elem(IxDyn(&[1]), mean))
            }
            OpKind::Accuracy => {
                let logits = self.read_slot(op, "Out")?;
                let label = self.read_slot(op, "Label")?;
                op_accuracy(logits, label)
            }
            OpKind::Other(name) => Err(RuntimeError::UnimplementedOperation(name.clone())),
        }
    }
}

/// CPU executor. Only runs on [`Place::Cpu`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuExecutor;

impl CpuExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for CpuExecutor {
    fn run(
        &self,
        graph: &Graph,
        scope: &mut Scope,
        place: Place,
        fetches: &[&str],
    ) -> Result<Vec<ArrayD<f32>>> {
        if place != Place::Cpu {
            return Err(RuntimeError::UnsupportedPlace(place));
        }
        let mut frame = ExecutionFrame {
            graph,
            scope,
            place,
            values: HashMap::new(),
        };
        for op in graph.ops() {
            let out = frame.execute(op)?;
            for var in op.output_vars() {
                frame.write(var, out.clone())?;
            }
        }
        fetches
            .iter()
            .map(|name| frame.read(graph.var_id(name)?))
            .collect()
    }
}

// --- Operation kernels ---

/// Reshapes `y` so it broadcasts onto `x_shape` starting at `axis`.
fn broadcast_onto(x_shape: &[usize], y: ArrayD<f32>, axis: isize) -> Result<ArrayD<f32>> {
    if y.shape() == x_shape {
        return Ok(y);
    }
    let start = broadcast_offset(x_shape.len(), y.ndim(), axis).ok_or_else(|| {
        RuntimeError::ShapeError(format!(
            "cannot broadcast {:?} onto {:?} at axis {axis}",
            y.shape(),
            x_shape
        ))
    })?;
    let mut shape = vec![1; x_shape.len()];
    shape[start..start + y.ndim()].copy_from_slice(y.shape());
    y.as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(&shape))
        .map_err(|e| RuntimeError::ShapeError(e.to_string()))
}

fn op_conv2d(
    input: ArrayD<f32>,
    filter: ArrayD<f32>,
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<ArrayD<f32>> {
    let input_arr: Array4<f32> = input
        .into_dimensionality::<Ix4>()
        .map_err(|e| RuntimeError::ShapeError(format!("conv2d input: {e}")))?;
    let weight_arr: Array4<f32> = filter
        .into_dimensionality::<Ix4>()
        .map_err(|e| RuntimeError::ShapeError(format!("conv2d filter: {e}")))?;

    let (batch_size, in_channels, in_h, in_w) = input_arr.dim();
    let (out_channels, weight_in_channels, kernel_h, kernel_w) = weight_arr.dim();
    if in_channels != weight_in_channels {
        return Err(RuntimeError::ShapeError(format!(
            "conv2d: input channels {in_channels} != filter channels {weight_in_channels}"
        )));
    }

    let (stride_h, stride_w) = stride;
    let (pad_h, pad_w) = padding;
    if stride_h == 0 || stride_w == 0 || in_h + 2 * pad_h < kernel_h || in_w + 2 * pad_w < kernel_w {
        return Err(RuntimeError::ShapeError(format!(
            "conv2d: kernel {kernel_h}x{kernel_w} does not fit input {in_h}x{in_w}"
        )));
    }
    let out_h = (in_h + 2 * pad_h - kernel_h) / stride_h + 1;
    let out_w = (in_w + 2 * pad_w - kernel_w) / stride_w + 1;

    let mut output = Array4::<f32>::zeros((batch_size, out_channels, out_h, out_w));
    for n in 0..batch_size {
        for oc in 0..out_channels {
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let mut sum = 0.0f32;
                    for ic in 0..in_channels {
                        for kh in 0..kernel_h {
                            for kw in 0..kernel_w {
                                let ih = (oh * stride_h + kh) as isize - pad_h as isize;
                                let iw = (ow * stride_w + kw) as isize - pad_w as isize;
                                if ih >= 0 && ih < in_h as isize && iw >= 0 && iw < in_w as isize {
                                    sum += input_arr[[n, ic, ih as usize, iw as usize]]
                                        * weight_arr[[oc, ic, kh, kw]];
                                }
                            }
                        }
                    }
                    output[[n, oc, oh, ow]] = sum;
                }
            }
        }
    }
    Ok(output.into_dyn())
}

/// `X` flattened to `[prod(X[..k]), prod(X[k..])]` times `Y`.
fn op_mul(x: ArrayD<f32>, y: ArrayD<f32>, x_num_col_dims: usize) -> Result<ArrayD<f32>> {
    if x_num_col_dims == 0 || x_num_col_dims >= x.ndim() {
        return Err(RuntimeError::ShapeError(format!(
            "mul: x_num_col_dims {x_num_col_dims} for input of rank {}",
            x.ndim()
        )));
    }
    let lead = x.shape()[..x_num_col_dims].to_vec();
    let rows: usize = lead.iter().product();
    let cols: usize = x.shape()[x_num_col_dims..].iter().product();

    let x_mat: Array2<f32> = x
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, cols))
        .map_err(|e| RuntimeError::ShapeError(format!("mul X: {e}")))?;
    let y_mat: Array2<f32> = y
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("mul Y: {e}")))?;
    if y_mat.nrows() != cols {
        return Err(RuntimeError::ShapeError(format!(
            "mul: flattened input has {cols} columns, weight has {} rows",
            y_mat.nrows()
        )));
    }

    let mut out_shape = lead;
    out_shape.push(y_mat.ncols());
    x_mat
        .dot(&y_mat)
        .into_shape(IxDyn(&out_shape))
        .map_err(|e| RuntimeError::ShapeError(e.to_string()))
}

struct BatchNormStats {
    scale: ArrayD<f32>,
    bias: ArrayD<f32>,
    mean: ArrayD<f32>,
    variance: ArrayD<f32>,
}

fn op_batch_norm(x: ArrayD<f32>, stats: &BatchNormStats, epsilon: f32) -> Result<ArrayD<f32>> {
    if x.ndim() < 2 {
        return Err(RuntimeError::ShapeError(format!(
            "batch_norm: input of rank {} has no channel axis",
            x.ndim()
        )));
    }
    let channels = x.shape()[1];
    let per_channel = |t: &ArrayD<f32>, what: &str| -> Result<Vec<f32>> {
        if t.len() != channels {
            return Err(RuntimeError::ShapeError(format!(
                "batch_norm: {what} has {} entries for {channels} channels",
                t.len()
            )));
        }
        Ok(t.iter().copied().collect())
    };
    let scale = per_channel(&stats.scale, "scale")?;
    let bias = per_channel(&stats.bias, "bias")?;
    let mean = per_channel(&stats.mean, "mean")?;
    let variance = per_channel(&stats.variance, "variance")?;

    let mut out = x;
    for (c, mut lane) in out.axis_iter_mut(Axis(1)).enumerate() {
        let inv_std = 1.0 / (variance[c] + epsilon).sqrt();
        lane.mapv_inplace(|v| (v - mean[c]) * inv_std * scale[c] + bias[c]);
    }
    Ok(out)
}

fn op_pool2d(
    x: ArrayD<f32>,
    pool_type: PoolType,
    kernel_size: (usize, usize),
    stride: (usize, usize),
) -> Result<ArrayD<f32>> {
    let input_arr: Array4<f32> = x
        .into_dimensionality::<Ix4>()
        .map_err(|e| RuntimeError::ShapeError(format!("pool2d input: {e}")))?;
    let (n, c, h, w) = input_arr.dim();
    let (kh, kw) = kernel_size;
    let (sh, sw) = stride;
    if sh == 0 || sw == 0 || h < kh || w < kw {
        return Err(RuntimeError::ShapeError(format!(
            "pool2d: window {kh}x{kw} does not fit input {h}x{w}"
        )));
    }
    let out_h = (h - kh) / sh + 1;
    let out_w = (w - kw) / sw + 1;
    let area = (kh * kw) as f32;

    let mut output = Array4::<f32>::zeros((n, c, out_h, out_w));
    for n_idx in 0..n {
        for c_idx in 0..c {
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let (h0, w0) = (oh * sh, ow * sw);
                    let window = input_arr.slice(s![n_idx, c_idx, h0..h0 + kh, w0..w0 + kw]);
                    output[[n_idx, c_idx, oh, ow]] = match pool_type {
                        PoolType::Max => window.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v)),
                        PoolType::Avg => window.sum() / area,
                    };
                }
            }
        }
    }
    Ok(output.into_dyn())
}

/// Fraction of rows whose arg-max equals the integer label.
fn op_accuracy(logits: ArrayD<f32>, label: ArrayD<f32>) -> Result<ArrayD<f32>> {
    let logits: Array2<f32> = logits
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("accuracy logits: {e}")))?;
    let rows = logits.nrows();
    if rows == 0 || label.len() != rows {
        return Err(RuntimeError::ShapeError(format!(
            "accuracy: {rows} predictions for {} labels",
            label.len()
        )));
    }
    let correct = logits
        .outer_iter()
        .zip(label.iter())
        .filter(|(row, &target)| {
            let predicted = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i);
            predicted == Some(target as usize)
        })
        .count();
    Ok(ArrayD::from_elem(IxDyn(&[1]), correct as f32 / rows as f32))
}
