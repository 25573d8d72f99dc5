//! Strategy configuration.
//!
//! Every field has a default, so a JSON file only needs the values it
//! changes:
//!
//! ```
//! use graphslim::strategy::config::SensitivePruneConfig;
//!
//! let config = SensitivePruneConfig::from_json_str(r#"{ "delta_rate": 0.25 }"#).unwrap();
//! assert_eq!(config.delta_rate, 0.25);
//! assert_eq!(config.target_ratio, 0.5);
//! ```

use crate::prune::error::{PruneError, Result};
use crate::prune::selector::RatioSelection;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn from_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

fn check_epochs(start_epoch: usize, end_epoch: usize) -> Result<()> {
    if start_epoch > end_epoch {
        return Err(PruneError::InvalidConfig(format!(
            "start_epoch {start_epoch} is after end_epoch {end_epoch}"
        )));
    }
    Ok(())
}

/// Configuration of the masking strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneConfig {
    /// Prune on every batch whose id is a multiple of this.
    pub mini_batch_pruning_frequency: usize,
    pub start_epoch: usize,
    /// Exclusive.
    pub end_epoch: usize,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            mini_batch_pruning_frequency: 1,
            start_epoch: 0,
            end_epoch: 10,
        }
    }
}

impl PruneConfig {
    pub fn with_frequency(mut self, frequency: usize) -> Self {
        self.mini_batch_pruning_frequency = frequency;
        self
    }

    pub fn with_epochs(mut self, start_epoch: usize, end_epoch: usize) -> Self {
        self.start_epoch = start_epoch;
        self.end_epoch = end_epoch;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.mini_batch_pruning_frequency == 0 {
            return Err(PruneError::InvalidConfig(
                "mini_batch_pruning_frequency must be at least 1".to_string(),
            ));
        }
        check_epochs(self.start_epoch, self.end_epoch)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = from_json_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Configuration of the sensitivity-driven structural strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitivePruneConfig {
    pub start_epoch: usize,
    pub end_epoch: usize,
    /// Step between tried ratios.
    pub delta_rate: f32,
    /// Loss accepted by [`RatioSelection::WithinThreshold`].
    pub acc_loss_threshold: f32,
    /// Sum of the ratios applied across all selected filters.
    pub target_ratio: f32,
    /// Names of parameters to analyze, matched from the start.
    pub param_pattern: String,
    pub selection: RatioSelection,
    /// Shrink `batch_norm` statistics along with the pruned channels.
    pub prune_batch_norm: bool,
    /// Sensitivities are loaded from and saved to this file when set.
    pub sensitivities_file: Option<PathBuf>,
}

impl Default for SensitivePruneConfig {
    fn default() -> Self {
        Self {
            start_epoch: 0,
            end_epoch: 10,
            delta_rate: 0.20,
            acc_loss_threshold: 0.2,
            target_ratio: 0.5,
            param_pattern: r"conv2d_.+\.w_.+".to_string(),
            selection: RatioSelection::ZeroLoss,
            prune_batch_norm: true,
            sensitivities_file: None,
        }
    }
}

impl SensitivePruneConfig {
    pub fn with_delta_rate(mut self, delta_rate: f32) -> Self {
        self.delta_rate = delta_rate;
        self
    }

    pub fn with_target_ratio(mut self, target_ratio: f32) -> Self {
        self.target_ratio = target_ratio;
        self
    }

    pub fn with_acc_loss_threshold(mut self, threshold: f32) -> Self {
        self.acc_loss_threshold = threshold;
        self
    }

    pub fn with_param_pattern(mut self, pattern: &str) -> Self {
        self.param_pattern = pattern.to_string();
        self
    }

    pub fn with_selection(mut self, selection: RatioSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_batch_norm(mut self, enabled: bool) -> Self {
        self.prune_batch_norm = enabled;
        self
    }

    pub fn with_sensitivities_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sensitivities_file = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_epochs(self.start_epoch, self.end_epoch)?;
        if !(self.delta_rate > 0.0 && self.delta_rate <= 1.0) {
            return Err(PruneError::InvalidConfig(format!(
                "delta_rate must be in (0, 1], got {}",
                self.delta_rate
            )));
        }
        if !(self.target_ratio > 0.0 && self.target_ratio <= 1.0) {
            return Err(PruneError::InvalidConfig(format!(
                "target_ratio must be in (0, 1], got {}",
                self.target_ratio
            )));
        }
        if !(self.acc_loss_threshold >= 0.0) {
            return Err(PruneError::InvalidConfig(format!(
                "acc_loss_threshold must be non-negative, got {}",
                self.acc_loss_threshold
            )));
        }
        Regex::new(&self.param_pattern)?;
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = from_json_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Both strategies as one file. A missing section is `None` and disables
/// that strategy when the file drives the setup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub prune: Option<PruneConfig>,
    pub sensitive_prune: Option<SensitivePruneConfig>,
}

impl CompressionConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(prune) = &self.prune {
            prune.validate()?;
        }
        if let Some(sensitive) = &self.sensitive_prune {
            sensitive.validate()?;
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = from_json_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let prune = PruneConfig::default();
        assert_eq!(prune.mini_batch_pruning_frequency, 1);
        assert_eq!((prune.start_epoch, prune.end_epoch), (0, 10));

        let sensitive = SensitivePruneConfig::default();
        assert_eq!(sensitive.delta_rate, 0.20);
        assert_eq!(sensitive.acc_loss_threshold, 0.2);
        assert_eq!(sensitive.selection, RatioSelection::ZeroLoss);
        assert!(sensitive.prune_batch_norm);
        sensitive.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SensitivePruneConfig::from_json_str(
            r#"{ "target_ratio": 0.3, "selection": "within_threshold" }"#,
        )
        .unwrap();
        assert_eq!(config.target_ratio, 0.3);
        assert_eq!(config.selection, RatioSelection::WithinThreshold);
        assert_eq!(config.delta_rate, 0.20);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(PruneConfig::default().with_frequency(0).validate().is_err());
        assert!(PruneConfig::default().with_epochs(5, 2).validate().is_err());
        assert!(SensitivePruneConfig::default()
            .with_delta_rate(0.0)
            .validate()
            .is_err());
        assert!(SensitivePruneConfig::default()
            .with_target_ratio(1.5)
            .validate()
            .is_err());
        assert!(matches!(
            SensitivePruneConfig::default()
                .with_param_pattern("conv2d_(")
                .validate(),
            Err(PruneError::Pattern(_))
        ));
        assert!(matches!(
            PruneConfig::from_json_str(r#"{ "mini_batch_pruning_frequency": 0 }"#),
            Err(PruneError::InvalidConfig(_))
        ));
    }

    #[test]
    fn compression_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "prune": {{ "mini_batch_pruning_frequency": 2 }}, "sensitive_prune": {{ "delta_rate": 0.5 }} }}"#
        )
        .unwrap();
        let config = CompressionConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.prune.unwrap().mini_batch_pruning_frequency, 2);
        assert_eq!(config.sensitive_prune.unwrap().delta_rate, 0.5);
    }
}
