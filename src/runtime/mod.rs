//! Execution side of the crate: tensor storage and executors.
//!
//! The [`scope::Scope`] holds the numeric buffers of parameters and feeds,
//! keyed by variable name. An [`backend::Executor`] runs a graph against a
//! scope and returns the requested fetch values; [`cpu_backend::CpuExecutor`]
//! is the reference implementation.

pub mod backend;
pub mod cpu_backend;
pub mod scope;
