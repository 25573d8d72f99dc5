// --- File: src/prune/sensitivity.rs ---

//! Sensitivity analysis: how much a metric drops when one filter is pruned.
//!
//! For every eligible convolution filter the analyzer sweeps a decreasing
//! ratio schedule. Each trial prunes lazily, measures, and restores the
//! backup before the next trial, whether or not the measurement succeeded.

use super::error::{PruneError, Result};
use super::propagate::{Backup, Propagator};
use crate::graph::{Graph, OpKind, VarId, Variable};
use crate::runtime::scope::{Place, Scope};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Tried ratios and the metric loss observed for each, in sweep order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensitivityCurve {
    pub pruned_percent: Vec<f32>,
    pub acc_loss: Vec<f32>,
}

impl SensitivityCurve {
    pub fn push(&mut self, ratio: f32, loss: f32) {
        self.pruned_percent.push(ratio);
        self.acc_loss.push(loss);
    }

    /// `(ratio, loss)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (f32, f32)> + '_ {
        self.pruned_percent
            .iter()
            .copied()
            .zip(self.acc_loss.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.pruned_percent.len().min(self.acc_loss.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SensitivityEntry {
    name: String,
    #[serde(flatten)]
    curve: SensitivityCurve,
}

/// Parameter name to sensitivity curve, in insertion order.
///
/// Entries are only ever added. Serialized as a JSON list of
/// `{"name", "pruned_percent", "acc_loss"}` objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensitivityTable {
    entries: Vec<SensitivityEntry>,
}

impl SensitivityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&SensitivityCurve> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.curve)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Adds a curve. An existing curve for `name` is kept.
    pub fn insert(&mut self, name: &str, curve: SensitivityCurve) -> bool {
        if self.contains(name) {
            return false;
        }
        self.entries.push(SensitivityEntry {
            name: name.to_string(),
            curve,
        });
        true
    }

    /// Adds every curve of `other` whose name is not present yet.
    pub fn merge(&mut self, other: SensitivityTable) {
        for entry in other.entries {
            self.insert(&entry.name, entry.curve);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SensitivityCurve)> {
        self.entries.iter().map(|e| (e.name.as_str(), &e.curve))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }
}

/// Ratios `1, 1 - delta, 1 - 2*delta, ...` down to but excluding 0.
///
/// Steps are counted as integers so float drift cannot add a trailing
/// near-zero ratio; each ratio is rounded to six decimals.
pub fn ratio_schedule(delta_rate: f32) -> Result<Vec<f32>> {
    if !(delta_rate > 0.0 && delta_rate <= 1.0) {
        return Err(PruneError::InvalidConfig(format!(
            "delta_rate must be in (0, 1], got {delta_rate}"
        )));
    }
    let delta = f64::from(delta_rate);
    let steps = (1.0 / delta - 1e-6).ceil() as usize;
    Ok((0..steps)
        .map(|k| ((1.0 - k as f64 * delta) * 1e6).round() / 1e6)
        .filter(|&r| r > 0.0)
        .map(|r| r as f32)
        .collect())
}

/// Sweeps pruning ratios over every eligible convolution filter.
pub struct SensitivityAnalyzer<'p> {
    propagator: Propagator<'p>,
    delta_rate: f32,
    pattern: Regex,
}

impl<'p> SensitivityAnalyzer<'p> {
    /// `param_pattern` must match a parameter name from its start.
    pub fn new(propagator: Propagator<'p>, delta_rate: f32, param_pattern: &str) -> Result<Self> {
        ratio_schedule(delta_rate)?;
        Ok(Self {
            propagator,
            delta_rate,
            pattern: Regex::new(&format!("^(?:{param_pattern})"))?,
        })
    }

    /// A parameter is analyzed when its name matches the pattern and it is
    /// the filter of some `conv2d`.
    pub fn is_eligible(&self, graph: &Graph, var: &Variable) -> bool {
        var.is_parameter()
            && self.pattern.is_match(&var.name)
            && graph.consumers(var.id).into_iter().any(|op_id| {
                graph.op(op_id).is_ok_and(|op| {
                    matches!(op.kind, OpKind::Conv2d { .. })
                        && op.input("Filter").is_ok_and(|f| f.contains(&var.id))
                })
            })
    }

    /// Fills `table` with a curve per eligible parameter not already in it.
    ///
    /// `measure` evaluates the metric on the current graph and scope. The
    /// baseline is measured once before any pruning.
    pub fn analyze<M>(
        &self,
        graph: &mut Graph,
        scope: &mut Scope,
        place: Place,
        table: &mut SensitivityTable,
        mut measure: M,
    ) -> Result<()>
    where
        M: FnMut(&Graph, &mut Scope) -> Result<f32>,
    {
        let ratios = ratio_schedule(self.delta_rate)?;
        let snapshot: &Graph = graph;
        let params: Vec<(VarId, String)> = snapshot
            .parameters()
            .filter(|p| self.is_eligible(snapshot, p))
            .map(|p| (p.id, p.name.clone()))
            .collect();
        let baseline = measure(graph, scope)?;
        info!(baseline, params = params.len(), ?ratios, "computing sensitivities");

        for (param, name) in params {
            if table.contains(&name) {
                debug!(param = %name, "sensitivity already known, skipping");
                continue;
            }
            let mut curve = SensitivityCurve::default();
            for &ratio in &ratios {
                let pruned = self.trial(graph, scope, place, param, ratio, &mut measure)?;
                curve.push(ratio, baseline - pruned);
            }
            info!(param = %name, losses = ?curve.acc_loss, "sensitivity measured");
            table.insert(&name, curve);
        }
        Ok(())
    }

    /// Lazily prunes `param` by `ratio`, measures, and restores.
    fn trial<M>(
        &self,
        graph: &mut Graph,
        scope: &mut Scope,
        place: Place,
        param: VarId,
        ratio: f32,
        measure: &mut M,
    ) -> Result<f32>
    where
        M: FnMut(&Graph, &mut Scope) -> Result<f32>,
    {
        let mut backup = Backup::new();
        let outcome = self
            .propagator
            .propagate(graph, scope, param, ratio, place, Some(&mut backup))
            .and_then(|_| measure(graph, scope));
        let restored = backup.restore(graph, scope);
        let metric = outcome?;
        restored?;
        debug!(param, ratio, metric, "trial done");
        Ok(metric)
    }
}
