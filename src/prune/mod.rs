//! # Pruning Module
//!
//! Building blocks for structured pruning of convolutional networks:
//!
//! - [`pruner`]: policies that pick slices or elements to remove.
//! - [`walker`]: finds the operations affected by pruning one filter.
//! - [`propagate`]: shrinks every dependent tensor congruently.
//! - [`sensitivity`]: measures metric loss per filter and ratio.
//! - [`selector`]: turns sensitivity curves into per-filter ratios.

pub mod error;
pub mod propagate;
pub mod pruner;
pub mod selector;
pub mod sensitivity;
pub mod walker;

pub use error::PruneError;
pub use propagate::{Backup, Propagator, ShrinkRecord};
pub use pruner::{MagnitudePruner, MaskPruner, RatioPruner, StructurePruner, StructuredPruner};
pub use selector::{RatioSelection, RatioSelector};
pub use sensitivity::{ratio_schedule, SensitivityAnalyzer, SensitivityCurve, SensitivityTable};
