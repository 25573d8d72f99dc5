//! Structural propagation of a pruned convolution filter.
//!
//! Pruning output channels of one `conv2d` filter changes the channel count
//! of everything downstream. [`Propagator::propagate`] walks the visit path
//! produced by [`walker::search`] once, left to right, threading an index
//! accumulator through it:
//!
//! - `seed` holds the channels removed from the triggering filter,
//! - `corrected` holds the same channels expressed in the coordinates of the
//!   tensor currently being corrected (shifted by concat offsets, expanded to
//!   flattened positions by fully-connected layers).
//!
//! Every dependent parameter is shrunk through the [`StructuredPruner`] and
//! written back to the scope together with its new shape descriptor. Lazy
//! pruning zeroes slices instead of dropping them and records the original
//! tensors in a [`Backup`] so a measurement trial can be undone.

use super::error::{PruneError, Result};
use super::pruner::StructuredPruner;
use super::walker;
use crate::graph::{Graph, OpId, OpKind, Operation, Shape, VarId};
use crate::runtime::scope::{Place, Scope};
use ndarray::ArrayD;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Axis of the output channels in NCHW activations.
const CHANNEL_AXIS: usize = 1;

#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    value: ArrayD<f32>,
    shape: Shape,
    place: Place,
}

/// Original tensors touched by lazy pruning, restorable in one step.
///
/// The first snapshot of a variable wins, so a tensor touched more than once
/// during a trial is restored to its state before the trial.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Backup {
    snapshots: HashMap<VarId, Snapshot>,
    order: Vec<VarId>,
}

impl Backup {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, var: VarId, value: ArrayD<f32>, shape: Shape, place: Place) {
        if self.snapshots.contains_key(&var) {
            return;
        }
        self.snapshots.insert(var, Snapshot { value, shape, place });
        self.order.push(var);
    }

    pub fn contains(&self, var: VarId) -> bool {
        self.snapshots.contains_key(&var)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Puts every recorded buffer and shape descriptor back.
    ///
    /// All entries are attempted; the first failure is reported afterwards.
    pub fn restore(self, graph: &mut Graph, scope: &mut Scope) -> Result<()> {
        let Backup {
            mut snapshots,
            order,
        } = self;
        let mut first_error = None;
        for var in order {
            let Some(snapshot) = snapshots.remove(&var) else {
                continue;
            };
            let restored = graph.set_shape(var, snapshot.shape).and_then(|_| {
                let name = &graph.var(var)?.name;
                scope.set(name, snapshot.value, snapshot.place);
                Ok(())
            });
            if let Err(e) = restored {
                first_error.get_or_insert(PruneError::from(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// One tensor mutation performed during propagation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShrinkRecord {
    pub var: VarId,
    pub name: String,
    pub axis: usize,
    pub indices: Vec<usize>,
    pub before: Shape,
    pub after: Shape,
}

/// Index sets threaded along the visit path.
#[derive(Debug, Clone, Default)]
struct IndexAccumulator {
    seed: Option<Vec<usize>>,
    corrected: Option<Vec<usize>>,
}

impl IndexAccumulator {
    fn seed(&self, op: &Operation) -> Result<&[usize]> {
        self.seed
            .as_deref()
            .ok_or_else(|| PruneError::MissingSeed {
                op: op.idx,
                op_type: op.type_name().to_string(),
            })
    }

    fn corrected(&self, op: &Operation) -> Result<&[usize]> {
        self.corrected
            .as_deref()
            .ok_or_else(|| PruneError::MissingSeed {
                op: op.idx,
                op_type: op.type_name().to_string(),
            })
    }
}

/// Mutable state of one propagation call.
struct Session<'a> {
    pruner: &'a dyn StructuredPruner,
    graph: &'a mut Graph,
    scope: &'a mut Scope,
    place: Place,
    backup: Option<&'a mut Backup>,
    shrunk: HashSet<(VarId, usize)>,
    records: Vec<ShrinkRecord>,
}

impl Session<'_> {
    fn lazy(&self) -> bool {
        self.backup.is_some()
    }

    /// Shrinks `var` along `axis`; a tensor is shrunk at most once per axis.
    ///
    /// Every route from the seed to a tensor carries the same index set, so a
    /// second visit (a residual add reached from both branches, a consumer
    /// behind a concat of one input with itself) is a no-op rather than a
    /// second removal of already-shifted positions.
    fn shrink(&mut self, var: VarId, indices: &[usize], axis: usize) -> Result<()> {
        if !self.shrunk.insert((var, axis)) {
            trace!(var, axis, "already shrunk along this axis, skipping");
            return Ok(());
        }
        let variable = self.graph.var(var)?;
        let name = variable.name.clone();
        let before = variable.shape.clone();

        let original = self.scope.find(&name)?.clone();
        let reduced = self
            .pruner
            .shrink_tensor(&original, indices, axis, self.lazy())?;
        let after = reduced.shape().to_vec();

        if let Some(backup) = self.backup.as_deref_mut() {
            let place = self.scope.place_of(&name)?;
            backup.record(var, original, before.clone(), place);
        }
        self.graph.set_shape(var, after.clone())?;
        self.scope.set(&name, reduced, self.place);

        debug!(param = %name, axis, pruned = indices.len(), ?before, ?after, "shrunk tensor");
        self.records.push(ShrinkRecord {
            var,
            name,
            axis,
            indices: indices.to_vec(),
            before,
            after,
        });
        Ok(())
    }

    /// Shrinks every parameter bound to an input of `op`.
    fn shrink_inputs(&mut self, op: &Operation, indices: &[usize], axis: usize) -> Result<()> {
        for var in op.input_vars() {
            if self.graph.var(var)?.is_parameter() {
                self.shrink(var, indices, axis)?;
            }
        }
        Ok(())
    }

    /// Prunes `param` itself and returns the removed output channels.
    fn prune_seed(&mut self, op: &Operation, param: VarId, ratio: f32) -> Result<Vec<usize>> {
        let name = self.graph.var(param)?.name.clone();
        if !op.input("Filter")?.contains(&param) {
            return Err(PruneError::NotPrunable {
                name,
                reason: format!("it is not the filter of operation {}", op.idx),
            });
        }
        let values = self.scope.find(&name)?;
        let (indices, axis) = self.pruner.compute_pruned_indices(&name, values, ratio)?;
        if axis != 0 {
            return Err(PruneError::NotPrunable {
                name,
                reason: format!("pruner chose axis {axis}, only output channels (axis 0) propagate"),
            });
        }
        self.shrink(param, &indices, 0)?;
        Ok(indices)
    }

    /// Bias-add correction: shrinks the bias, then walks back through the
    /// producers of the add (minus `excludes`), shrinking conv filters along
    /// their output channels and recursing into nested adds.
    fn prune_add(
        &mut self,
        op_id: OpId,
        indices: &[usize],
        excludes: &[OpId],
        seen: &mut HashSet<OpId>,
    ) -> Result<()> {
        if !seen.insert(op_id) {
            return Ok(());
        }
        let op = self.graph.op(op_id)?.clone();
        self.shrink_inputs(&op, indices, 0)?;

        for pre_id in self.graph.producers(op_id)? {
            if excludes.contains(&pre_id) {
                continue;
            }
            let pre = self.graph.op(pre_id)?.clone();
            match pre.kind {
                OpKind::Conv2d { .. } => self.shrink_inputs(&pre, indices, 0)?,
                OpKind::ElementwiseAdd { .. } => self.prune_add(pre_id, indices, excludes, seen)?,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Propagates the pruning of one convolution filter through the graph.
pub struct Propagator<'p> {
    pruner: &'p dyn StructuredPruner,
    prune_batch_norm: bool,
}

impl<'p> Propagator<'p> {
    pub fn new(pruner: &'p dyn StructuredPruner) -> Self {
        Self {
            pruner,
            prune_batch_norm: true,
        }
    }

    /// Whether `batch_norm` statistics follow the pruned channels.
    pub fn with_batch_norm(mut self, enabled: bool) -> Self {
        self.prune_batch_norm = enabled;
        self
    }

    /// Prunes `ratio` of the output channels of `param` and every dependent
    /// tensor. Passing a `backup` makes the pruning lazy: slices are zeroed
    /// rather than removed and each original tensor is recorded.
    ///
    /// Errors leave already-mutated tensors in place; under lazy pruning the
    /// backup still holds their originals.
    pub fn propagate(
        &self,
        graph: &mut Graph,
        scope: &mut Scope,
        param: VarId,
        ratio: f32,
        place: Place,
        backup: Option<&mut Backup>,
    ) -> Result<Vec<ShrinkRecord>> {
        let path = walker::search(graph, param);
        debug!(
            param = %graph.var(param)?.name,
            ratio,
            lazy = backup.is_some(),
            path_len = path.len(),
            "propagating pruning"
        );

        let mut session = Session {
            pruner: self.pruner,
            graph,
            scope,
            place,
            backup,
            shrunk: HashSet::new(),
            records: Vec::new(),
        };
        path.iter().enumerate().try_fold(
            IndexAccumulator::default(),
            |acc, (pos, &op_id)| self.step(&mut session, &path, pos, op_id, param, ratio, acc),
        )?;
        Ok(session.records)
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        session: &mut Session<'_>,
        path: &[OpId],
        pos: usize,
        op_id: OpId,
        param: VarId,
        ratio: f32,
        mut acc: IndexAccumulator,
    ) -> Result<IndexAccumulator> {
        let op = session.graph.op(op_id)?.clone();
        trace!(op = op_id, op_type = op.type_name(), "propagation step");

        match &op.kind {
            OpKind::Conv2d { .. } => {
                if op.consumes(param) {
                    if acc.seed.is_none() {
                        let seed = session.prune_seed(&op, param, ratio)?;
                        acc.corrected = Some(seed.clone());
                        acc.seed = Some(seed);
                    }
                } else {
                    let corrected = acc.corrected(&op)?.to_vec();
                    session.shrink_inputs(&op, &corrected, 1)?;
                }
            }

            OpKind::ElementwiseAdd { .. } => {
                let last = Self::predecessor(path, pos, &op)?;
                let corrected = acc.corrected(&op)?.to_vec();
                session.prune_add(op_id, &corrected, &[last], &mut HashSet::new())?;
            }

            OpKind::Mul { x_num_col_dims } => {
                let mut weight = None;
                let mut activation = None;
                for var in op.input_vars() {
                    if session.graph.var(var)?.is_parameter() {
                        weight = Some(var);
                    } else {
                        activation = Some(var);
                    }
                }
                let (Some(weight), Some(activation)) = (weight, activation) else {
                    return Err(Self::structural(&op, "expected one parameter and one activation input"));
                };
                let shape = &session.graph.var(activation)?.shape;
                let k = *x_num_col_dims;
                if k == 0 || k >= shape.len() {
                    return Err(Self::structural(&op, "x_num_col_dims out of range for the input rank"));
                }
                if k > CHANNEL_AXIS {
                    // Channels stay in the rows of the flattened input; the
                    // weight rows only span the trailing dims.
                    acc.corrected(&op)?;
                    debug!(op = op_id, x_num_col_dims = k, "channels not flattened into fc rows");
                    return Ok(acc);
                }
                let feature_map: usize = shape[k + 1..].iter().product();
                let expanded: Vec<usize> = acc
                    .corrected(&op)?
                    .iter()
                    .flat_map(|&c| c * feature_map..(c + 1) * feature_map)
                    .collect();
                session.shrink(weight, &expanded, 0)?;
                acc.corrected = Some(expanded);
            }

            OpKind::Concat { axis } => {
                let last = Self::predecessor(path, pos, &op)?;
                let last_op = session.graph.op(last)?;
                let inputs = op.input("X")?;
                // An input bound to several slots is pruned in every one of
                // them, each shifted by the widths of the inputs before it.
                let mut shifted = Vec::new();
                let mut offset = 0;
                for (slot, &var) in inputs.iter().enumerate() {
                    if last_op.produces(var) {
                        trace!(op = op_id, slot, offset, "concat offset");
                        shifted.extend(acc.seed(&op)?.iter().map(|&i| i + offset));
                    }
                    let shape = &session.graph.var(var)?.shape;
                    offset += shape.get(*axis).copied().ok_or_else(|| {
                        Self::structural(&op, "input has no concat axis")
                    })?;
                }
                if shifted.is_empty() {
                    return Err(Self::structural(
                        &op,
                        "no input is produced by the preceding operation",
                    ));
                }
                acc.corrected = Some(shifted);
            }

            OpKind::BatchNorm { .. } => {
                if self.prune_batch_norm {
                    let corrected = acc.corrected(&op)?.to_vec();
                    for slot in ["Mean", "Variance", "Scale", "Bias"] {
                        session.shrink(op.single_input(slot)?, &corrected, 0)?;
                    }
                } else {
                    debug!(op = op_id, "batch_norm propagation disabled, statistics left as is");
                }
            }

            OpKind::ElementwiseMul { .. }
            | OpKind::Relu
            | OpKind::Pool2d { .. }
            | OpKind::Assign
            | OpKind::Mean
            | OpKind::Accuracy
            | OpKind::Other(_) => {}
        }
        Ok(acc)
    }

    fn predecessor(path: &[OpId], pos: usize, op: &Operation) -> Result<OpId> {
        pos.checked_sub(1)
            .and_then(|p| path.get(p).copied())
            .ok_or_else(|| PruneError::MissingPredecessor {
                op: op.idx,
                op_type: op.type_name().to_string(),
            })
    }

    fn structural(op: &Operation, reason: &str) -> PruneError {
        PruneError::Structural {
            op: op.idx,
            op_type: op.type_name().to_string(),
            reason: reason.to_string(),
        }
    }
}
