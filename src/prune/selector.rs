//! Ratio selection from sensitivity curves.

use super::error::{PruneError, Result};
use super::sensitivity::SensitivityTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Which measured losses count as acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatioSelection {
    /// Only a loss of exactly zero.
    #[default]
    ZeroLoss,
    /// Any loss up to the accuracy-loss threshold.
    WithinThreshold,
}

/// Picks one ratio per parameter and rescales the picks to a global target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatioSelector {
    pub selection: RatioSelection,
    pub acc_loss_threshold: f32,
}

impl Default for RatioSelector {
    fn default() -> Self {
        Self {
            selection: RatioSelection::ZeroLoss,
            acc_loss_threshold: 0.2,
        }
    }
}

impl RatioSelector {
    pub fn new(selection: RatioSelection, acc_loss_threshold: f32) -> Self {
        Self {
            selection,
            acc_loss_threshold,
        }
    }

    fn acceptable(&self, loss: f32) -> bool {
        match self.selection {
            RatioSelection::ZeroLoss => loss == 0.0,
            RatioSelection::WithinThreshold => loss <= self.acc_loss_threshold,
        }
    }

    /// Largest acceptable ratio of every parameter that has one, in table
    /// order. Parameters without an acceptable ratio are left out.
    pub fn best_ratios(&self, table: &SensitivityTable) -> Vec<(String, f32)> {
        table
            .iter()
            .filter_map(|(name, curve)| {
                let best = curve
                    .iter()
                    .filter(|&(ratio, loss)| ratio > 0.0 && self.acceptable(loss))
                    .map(|(ratio, _)| ratio)
                    .fold(None, |best: Option<f32>, r| Some(best.map_or(r, |b| b.max(r))));
                if best.is_none() {
                    debug!(param = name, "no acceptable ratio, parameter excluded");
                }
                best.map(|r| (name.to_string(), r))
            })
            .collect()
    }

    /// Best ratios scaled by `target_ratio / sum`, so they add up to the
    /// target.
    pub fn select(&self, table: &SensitivityTable, target_ratio: f32) -> Result<Vec<(String, f32)>> {
        if !(target_ratio > 0.0 && target_ratio <= 1.0) {
            return Err(PruneError::InvalidRatio(target_ratio));
        }
        let best = self.best_ratios(table);
        let sum: f32 = best.iter().map(|(_, r)| r).sum();
        if best.is_empty() || sum <= 0.0 {
            return Err(PruneError::NoZeroLossRatio);
        }
        let scale = target_ratio / sum;
        let selected: Vec<(String, f32)> = best
            .into_iter()
            .map(|(name, ratio)| (name, ratio * scale))
            .collect();
        info!(target_ratio, ?selected, "selected pruning ratios");
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prune::sensitivity::SensitivityCurve;
    use approx::assert_abs_diff_eq;

    fn curve(points: &[(f32, f32)]) -> SensitivityCurve {
        let mut c = SensitivityCurve::default();
        for &(r, l) in points {
            c.push(r, l);
        }
        c
    }

    #[test]
    fn rescales_to_target() {
        let mut table = SensitivityTable::new();
        table.insert("A", curve(&[(1.0, 0.4), (0.5, 0.1), (0.3, 0.0)]));
        table.insert("B", curve(&[(1.0, 0.2), (0.5, 0.0)]));

        let selected = RatioSelector::default().select(&table, 0.4).unwrap();
        assert_eq!(selected[0].0, "A");
        assert_eq!(selected[1].0, "B");
        assert_abs_diff_eq!(selected[0].1, 0.15, epsilon = 1e-6);
        assert_abs_diff_eq!(selected[1].1, 0.25, epsilon = 1e-6);
        let total: f32 = selected.iter().map(|(_, r)| r).sum();
        assert_abs_diff_eq!(total, 0.4, epsilon = 1e-6);
    }

    #[test]
    fn largest_zero_loss_ratio_wins() {
        let mut table = SensitivityTable::new();
        table.insert("A", curve(&[(1.0, 0.3), (0.75, 0.0), (0.5, 0.0), (0.25, 0.0)]));
        let best = RatioSelector::default().best_ratios(&table);
        assert_eq!(best, vec![("A".to_string(), 0.75)]);
    }

    #[test]
    fn parameters_without_zero_loss_are_excluded() {
        let mut table = SensitivityTable::new();
        table.insert("A", curve(&[(1.0, 0.3), (0.5, 0.0)]));
        table.insert("B", curve(&[(1.0, 0.3), (0.5, 0.1)]));
        let selected = RatioSelector::default().select(&table, 0.5).unwrap();
        assert_eq!(selected.len(), 1);
        assert_abs_diff_eq!(selected[0].1, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn no_zero_loss_anywhere_is_an_error() {
        let mut table = SensitivityTable::new();
        table.insert("A", curve(&[(1.0, 0.3), (0.5, 0.1)]));
        assert!(matches!(
            RatioSelector::default().select(&table, 0.5),
            Err(PruneError::NoZeroLossRatio)
        ));
        assert!(matches!(
            RatioSelector::default().select(&SensitivityTable::new(), 0.5),
            Err(PruneError::NoZeroLossRatio)
        ));
    }

    #[test]
    fn threshold_policy_accepts_small_losses() {
        let mut table = SensitivityTable::new();
        table.insert("A", curve(&[(1.0, 0.3), (0.5, 0.1)]));
        let selector = RatioSelector::new(RatioSelection::WithinThreshold, 0.2);
        assert_eq!(selector.best_ratios(&table), vec![("A".to_string(), 0.5)]);
    }

    #[test]
    fn target_must_be_a_ratio() {
        let table = SensitivityTable::new();
        assert!(matches!(
            RatioSelector::default().select(&table, 0.0),
            Err(PruneError::InvalidRatio(_))
        ));
    }
}
