//! # graphslim: Structured Pruning for Computation Graphs
//!
//! **graphslim** compresses convolutional networks described as a graph of
//! typed operations. Removing output channels from one convolution filter
//! changes the shape of everything downstream of it; the crate finds those
//! dependent tensors (biases, batch-norm statistics, the input channels of
//! the next convolution, fully-connected rows, concat offsets) and shrinks
//! them congruently so the graph stays executable.
//!
//! ## Usage Example
//!
//! ```
//! use graphslim::graph::builder::GraphBuilder;
//! use graphslim::prune::{Propagator, StructurePruner};
//! use graphslim::runtime::scope::{Place, Scope};
//! use ndarray::{ArrayD, IxDyn};
//!
//! // 1. Build a graph: conv -> bias add -> relu -> conv
//! let mut b = GraphBuilder::new();
//! let image = b.data("image", vec![1, 3, 8, 8]).unwrap();
//! let c0 = b.conv2d(image, 8, 3, 1, 1, true).unwrap();
//! let r0 = b.relu(c0).unwrap();
//! b.conv2d(r0, 4, 3, 1, 1, false).unwrap();
//! let mut graph = b.finish();
//!
//! // 2. Give every parameter a buffer
//! let mut scope = Scope::new();
//! scope.init_parameters(&graph, Place::Cpu, |v| ArrayD::ones(IxDyn(&v.shape)));
//!
//! // 3. Remove half of the first filter's output channels
//! let pruner = StructurePruner::default();
//! let w0 = graph.var_id("conv2d_0.w_0").unwrap();
//! Propagator::new(&pruner)
//!     .propagate(&mut graph, &mut scope, w0, 0.5, Place::Cpu, None)
//!     .unwrap();
//!
//! assert_eq!(graph.var_by_name("conv2d_0.b_0").unwrap().shape, vec![4]);
//! assert_eq!(graph.var_by_name("conv2d_1.w_0").unwrap().shape, vec![4, 4, 3, 3]);
//! ```
//!
//! Training-loop integration goes through [`strategy::Compressor`] and the
//! two strategies in [`strategy`].

pub mod analysis;
pub mod graph;
pub mod prune;
pub mod runtime;
pub mod strategy;
