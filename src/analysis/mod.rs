//! # Graph Analysis Module
//!
//! Analysis passes over the graph IR.
//!
//! ## Available Passes
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): derives activation
//!   shapes from parameter and feed shapes, detecting mismatches before
//!   runtime.
//!
//! ## How It Works
//!
//! Parameters are the source of truth. Structural pruning shrinks parameter
//! descriptors only; a refresh pass then brings every activation back in
//! line:
//!
//! ```text
//! Graph (pruned parameters) -> Shape Inference -> Graph (consistent shapes)
//! ```
//!
//! A half-pruned graph, where a consumer was not corrected congruently,
//! fails the refresh with a channel mismatch instead of at execution time.

pub mod shape_inference;
