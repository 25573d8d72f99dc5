//! Execution context handed to strategy hooks by the training loop.

use crate::graph::Graph;
use crate::prune::error::{PruneError, Result};
use crate::runtime::backend::Executor;
use crate::runtime::scope::{Place, Scope};
use std::collections::HashMap;

/// Context key naming the variable whose value is the sensitivity metric.
pub const SENSITIVITY_METRIC: &str = "sensitivity_metric";

/// Graph, storage and executor of the running job, plus loop counters.
///
/// `entries` maps well-known keys (such as [`SENSITIVITY_METRIC`]) to
/// variable names in the graph.
pub struct Context<'a> {
    pub graph: &'a mut Graph,
    pub scope: &'a mut Scope,
    pub executor: &'a dyn Executor,
    pub place: Place,
    pub epoch_id: usize,
    pub batch_id: usize,
    entries: HashMap<String, String>,
}

impl<'a> Context<'a> {
    pub fn new(
        graph: &'a mut Graph,
        scope: &'a mut Scope,
        executor: &'a dyn Executor,
        place: Place,
    ) -> Self {
        Self {
            graph,
            scope,
            executor,
            place,
            epoch_id: 0,
            batch_id: 0,
            entries: HashMap::new(),
        }
    }

    pub fn with_entry(mut self, key: &str, var_name: &str) -> Self {
        self.put(key, var_name);
        self
    }

    pub fn put(&mut self, key: &str, var_name: &str) {
        self.entries.insert(key.to_string(), var_name.to_string());
    }

    pub fn get(&self, key: &str) -> Result<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| PruneError::MissingContextEntry(key.to_string()))
    }

    /// Runs the graph and reduces the fetched variable to its mean.
    pub fn evaluate(&mut self, fetch: &str) -> Result<f32> {
        evaluate(self.executor, self.graph, self.scope, self.place, fetch)
    }
}

/// Runs `graph` and reduces the fetched variable to its mean.
pub fn evaluate(
    executor: &dyn Executor,
    graph: &Graph,
    scope: &mut Scope,
    place: Place,
    fetch: &str,
) -> Result<f32> {
    let values = executor.run(graph, scope, place, &[fetch])?;
    values
        .first()
        .and_then(|v| v.mean())
        .ok_or_else(|| PruneError::EmptyMetric {
            name: fetch.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OpKind;
    use crate::runtime::cpu_backend::CpuExecutor;
    use ndarray::arr1;

    #[test]
    fn entries_and_evaluation() {
        let mut g = Graph::new();
        let x = g.add_activation("x", vec![3]).unwrap();
        let m = g.add_activation("m", vec![1]).unwrap();
        g.add_op(OpKind::Mean, vec![("X", vec![x])], vec![("Out", vec![m])])
            .unwrap();
        let mut scope = Scope::new();
        scope.set("x", arr1(&[1.0f32, 2.0, 6.0]).into_dyn(), Place::Cpu);
        let executor = CpuExecutor::new();

        let mut ctx = Context::new(&mut g, &mut scope, &executor, Place::Cpu)
            .with_entry(SENSITIVITY_METRIC, "m");
        assert!(matches!(
            ctx.get("loss"),
            Err(PruneError::MissingContextEntry(key)) if key == "loss"
        ));
        let metric = ctx.get(SENSITIVITY_METRIC).unwrap().to_string();
        assert_eq!(ctx.evaluate(&metric).unwrap(), 3.0);
        assert_eq!(ctx.evaluate("x").unwrap(), 3.0);
    }
}
