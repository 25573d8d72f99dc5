// --- File: src/prune/pruner.rs ---

//! Pruning policies: which slices or elements of a tensor to remove.
//!
//! Two capabilities are kept apart because the strategies use them differently:
//!
//! - [`StructuredPruner`] chooses whole slices along an axis and shrinks the
//!   tensor. Structural propagation and sensitivity analysis rely on it.
//! - [`MaskPruner`] produces an elementwise keep-mask with the tensor's own
//!   shape. The masking strategy multiplies parameters by it during training.

use super::error::{PruneError, Result};
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Key matching every parameter in per-name policy maps.
pub const ANY_PARAM: &str = "*";

/// Chooses slices to remove and shrinks tensors accordingly.
pub trait StructuredPruner {
    /// Returns the indices to remove (ascending) and the axis they index.
    fn compute_pruned_indices(
        &self,
        name: &str,
        values: &ArrayD<f32>,
        ratio: f32,
    ) -> Result<(Vec<usize>, usize)>;

    /// Removes `indices` along `axis`. With `lazy` the slices are zeroed and
    /// the shape is kept.
    fn shrink_tensor(
        &self,
        values: &ArrayD<f32>,
        indices: &[usize],
        axis: usize,
        lazy: bool,
    ) -> Result<ArrayD<f32>> {
        shrink_along_axis(values, indices, axis, lazy)
    }
}

/// Produces a keep-mask (`true` keeps the element) for a parameter.
pub trait MaskPruner {
    fn mask(&self, name: &str, values: &ArrayD<f32>) -> Result<ArrayD<bool>>;
}

/// Drops (or, lazily, zeroes) the slices `indices` of `values` along `axis`.
pub fn shrink_along_axis(
    values: &ArrayD<f32>,
    indices: &[usize],
    axis: usize,
    lazy: bool,
) -> Result<ArrayD<f32>> {
    if axis >= values.ndim() {
        return Err(PruneError::InvalidAxis {
            axis,
            rank: values.ndim(),
        });
    }
    let extent = values.len_of(Axis(axis));
    if let Some(&index) = indices.iter().find(|&&i| i >= extent) {
        return Err(PruneError::IndexOutOfBounds {
            axis,
            index,
            extent,
        });
    }

    if lazy {
        let mut out = values.clone();
        for &i in indices {
            out.index_axis_mut(Axis(axis), i).fill(0.0);
        }
        return Ok(out);
    }
    let pruned: BTreeSet<usize> = indices.iter().copied().collect();
    let keep: Vec<usize> = (0..extent).filter(|i| !pruned.contains(i)).collect();
    Ok(values.select(Axis(axis), &keep))
}

fn check_ratio(ratio: f32) -> Result<()> {
    if (0.0..=1.0).contains(&ratio) {
        Ok(())
    } else {
        Err(PruneError::InvalidRatio(ratio))
    }
}

fn lookup<'a, T>(map: &'a HashMap<String, T>, name: &str) -> Option<&'a T> {
    map.get(name).or_else(|| map.get(ANY_PARAM))
}

/// Slice importance measure used by [`StructurePruner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    /// Sum of absolute values over every non-pruned axis.
    #[default]
    L1Norm,
}

impl Criterion {
    fn scores(&self, values: &ArrayD<f32>, axis: usize) -> Vec<f32> {
        match self {
            Criterion::L1Norm => values
                .axis_iter(Axis(axis))
                .map(|slice| slice.iter().map(|v| v.abs()).sum())
                .collect(),
        }
    }
}

/// Removes the least important slices along a per-parameter axis.
///
/// `pruning_axis` and `criterions` are keyed by parameter name, with `"*"` as
/// the fallback. `round(extent * ratio)` slices are pruned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructurePruner {
    pub pruning_axis: HashMap<String, usize>,
    pub criterions: HashMap<String, Criterion>,
}

impl Default for StructurePruner {
    fn default() -> Self {
        Self {
            pruning_axis: HashMap::from([(ANY_PARAM.to_string(), 0)]),
            criterions: HashMap::from([(ANY_PARAM.to_string(), Criterion::L1Norm)]),
        }
    }
}

impl StructurePruner {
    pub fn new(pruning_axis: HashMap<String, usize>, criterions: HashMap<String, Criterion>) -> Self {
        Self {
            pruning_axis,
            criterions,
        }
    }

    pub fn with_axis(mut self, name: &str, axis: usize) -> Self {
        self.pruning_axis.insert(name.to_string(), axis);
        self
    }

    pub fn with_criterion(mut self, name: &str, criterion: Criterion) -> Self {
        self.criterions.insert(name.to_string(), criterion);
        self
    }

    pub fn axis_for(&self, name: &str) -> usize {
        lookup(&self.pruning_axis, name).copied().unwrap_or(0)
    }

    pub fn criterion_for(&self, name: &str) -> Criterion {
        lookup(&self.criterions, name).copied().unwrap_or_default()
    }
}

impl StructuredPruner for StructurePruner {
    fn compute_pruned_indices(
        &self,
        name: &str,
        values: &ArrayD<f32>,
        ratio: f32,
    ) -> Result<(Vec<usize>, usize)> {
        check_ratio(ratio)?;
        let axis = self.axis_for(name);
        if axis >= values.ndim() {
            return Err(PruneError::InvalidAxis {
                axis,
                rank: values.ndim(),
            });
        }
        let extent = values.len_of(Axis(axis));
        let prune_num = ((extent as f32 * ratio).round() as usize).min(extent);

        let scores = self.criterion_for(name).scores(values, axis);
        let mut order: Vec<usize> = (0..extent).collect();
        order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]).then(a.cmp(&b)));
        let mut pruned: Vec<usize> = order.into_iter().take(prune_num).collect();
        pruned.sort_unstable();
        Ok((pruned, axis))
    }
}

/// Keeps the `ratio` share of elements with the largest magnitude.
///
/// Ratios are looked up by name with `"*"` as the fallback; a missing entry or
/// a ratio of at least 1 keeps everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatioPruner {
    pub ratios: HashMap<String, f32>,
}

impl RatioPruner {
    pub fn new(ratios: HashMap<String, f32>) -> Self {
        Self { ratios }
    }

    /// Same keep ratio for every parameter.
    pub fn uniform(ratio: f32) -> Self {
        Self::new(HashMap::from([(ANY_PARAM.to_string(), ratio)]))
    }
}

impl MaskPruner for RatioPruner {
    fn mask(&self, name: &str, values: &ArrayD<f32>) -> Result<ArrayD<bool>> {
        let ratio = lookup(&self.ratios, name).copied().unwrap_or(1.0);
        check_ratio(ratio.min(1.0))?;
        if ratio >= 1.0 || values.is_empty() {
            return Ok(values.mapv(|_| true));
        }
        let k = ((ratio * values.len() as f32) as usize).max(1);
        let mut magnitudes: Vec<f32> = values.iter().map(|v| v.abs()).collect();
        magnitudes.sort_unstable_by(|a, b| b.total_cmp(a));
        let threshold = magnitudes[k - 1];
        Ok(values.mapv(|v| v.abs() >= threshold))
    }
}

/// Keeps elements whose magnitude reaches `threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MagnitudePruner {
    pub threshold: f32,
}

impl MagnitudePruner {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl MaskPruner for MagnitudePruner {
    fn mask(&self, _name: &str, values: &ArrayD<f32>) -> Result<ArrayD<bool>> {
        Ok(values.mapv(|v| v.abs() >= self.threshold))
    }
}
