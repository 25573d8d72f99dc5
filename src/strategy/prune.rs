// --- File: src/strategy/prune.rs ---

//! Masking strategy: zeroes weights in place while training runs.
//!
//! On each triggering batch a scratch graph is built with, per parameter,
//! `p@PRUNED = p * p@MASK` followed by `assign(p@PRUNED -> p)`. The masks
//! are fed through the scope and the scratch graph is run by the context's
//! executor, which commits the masked values back into the live parameters.
//! Shapes never change.

use super::config::PruneConfig;
use super::context::Context;
use super::Strategy;
use crate::graph::{Graph, OpKind};
use crate::prune::error::Result;
use crate::prune::pruner::MaskPruner;
use ndarray::ArrayD;
use tracing::{debug, info};

fn mask_name(param: &str) -> String {
    format!("{param}@MASK")
}

/// Builds the multiply-then-assign graph over every parameter of `graph`.
pub fn build_mask_graph(graph: &Graph) -> Result<Graph> {
    let mut scratch = Graph::new();
    for param in graph.parameters() {
        let p = scratch.add_parameter(&param.name, param.shape.clone())?;
        let mask = scratch.add_activation(&mask_name(&param.name), param.shape.clone())?;
        let pruned = scratch.add_activation(&format!("{}@PRUNED", param.name), param.shape.clone())?;
        scratch.add_op(
            OpKind::ElementwiseMul { axis: -1 },
            vec![("X", vec![p]), ("Y", vec![mask])],
            vec![("Out", vec![pruned])],
        )?;
        scratch.add_op(
            OpKind::Assign,
            vec![("X", vec![pruned])],
            vec![("Out", vec![p])],
        )?;
    }
    Ok(scratch)
}

/// Periodically multiplies every parameter by its pruner mask.
pub struct PruneStrategy<P> {
    pruner: P,
    config: PruneConfig,
}

impl<P: MaskPruner> PruneStrategy<P> {
    pub fn new(pruner: P, config: PruneConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { pruner, config })
    }

    pub fn config(&self) -> &PruneConfig {
        &self.config
    }

    /// `start_epoch <= epoch < end_epoch` and the batch id is a multiple of
    /// the pruning frequency.
    pub fn triggered(&self, epoch_id: usize, batch_id: usize) -> bool {
        batch_id % self.config.mini_batch_pruning_frequency == 0
            && (self.config.start_epoch..self.config.end_epoch).contains(&epoch_id)
    }

    fn apply_masks(&self, ctx: &mut Context<'_>) -> Result<()> {
        let masks = ctx
            .graph
            .parameters()
            .map(|p| {
                let keep = self.pruner.mask(&p.name, ctx.scope.find(&p.name)?)?;
                Ok((mask_name(&p.name), keep.mapv(|k| if k { 1.0 } else { 0.0 })))
            })
            .collect::<Result<Vec<(String, ArrayD<f32>)>>>()?;
        let scratch = build_mask_graph(ctx.graph)?;

        let kept: f32 = masks.iter().map(|(_, m)| m.sum()).sum();
        let total: usize = masks.iter().map(|(_, m)| m.len()).sum();
        let names: Vec<String> = masks.iter().map(|(n, _)| n.clone()).collect();
        for (name, mask) in masks {
            ctx.scope.set(&name, mask, ctx.place);
        }
        let outcome = ctx.executor.run(&scratch, ctx.scope, ctx.place, &[]);
        for name in &names {
            ctx.scope.remove(name);
        }
        outcome?;

        debug!(
            epoch = ctx.epoch_id,
            batch = ctx.batch_id,
            kept = kept as usize,
            total,
            "masked parameters"
        );
        Ok(())
    }
}

impl<P: MaskPruner> Strategy for PruneStrategy<P> {
    fn name(&self) -> &str {
        "prune"
    }

    fn start_epoch(&self) -> usize {
        self.config.start_epoch
    }

    fn end_epoch(&self) -> usize {
        self.config.end_epoch
    }

    fn on_compression_begin(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        info!(
            frequency = self.config.mini_batch_pruning_frequency,
            start_epoch = self.config.start_epoch,
            end_epoch = self.config.end_epoch,
            params = ctx.graph.parameters().count(),
            "mask pruning enabled"
        );
        Ok(())
    }

    fn on_batch_end(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        if !self.triggered(ctx.epoch_id, ctx.batch_id) {
            return Ok(());
        }
        self.apply_masks(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prune::pruner::{MagnitudePruner, RatioPruner};
    use crate::runtime::cpu_backend::CpuExecutor;
    use crate::runtime::scope::{Place, Scope};
    use ndarray::{arr1, arr2};

    fn setup() -> (Graph, Scope) {
        let mut g = Graph::new();
        g.add_parameter("fc_0.w_0", vec![2, 2]).unwrap();
        g.add_parameter("fc_0.b_0", vec![2]).unwrap();
        let mut scope = Scope::new();
        scope.set("fc_0.w_0", arr2(&[[0.1f32, -2.0], [3.0, 0.2]]).into_dyn(), Place::Cpu);
        scope.set("fc_0.b_0", arr1(&[0.05f32, 1.0]).into_dyn(), Place::Cpu);
        (g, scope)
    }

    #[test]
    fn trigger_window_and_frequency() {
        let strategy = PruneStrategy::new(
            MagnitudePruner::new(0.5),
            PruneConfig::default().with_frequency(2).with_epochs(1, 3),
        )
        .unwrap();
        assert!(!strategy.triggered(0, 0));
        assert!(strategy.triggered(1, 0));
        assert!(!strategy.triggered(1, 1));
        assert!(strategy.triggered(2, 4));
        assert!(!strategy.triggered(3, 0));
    }

    #[test]
    fn batch_end_masks_parameters_in_place() {
        let (mut g, mut scope) = setup();
        let executor = CpuExecutor::new();
        let mut strategy = PruneStrategy::new(MagnitudePruner::new(0.5), PruneConfig::default()).unwrap();
        {
            let mut ctx = Context::new(&mut g, &mut scope, &executor, Place::Cpu);
            strategy.on_batch_end(&mut ctx).unwrap();
        }
        assert_eq!(
            scope.find("fc_0.w_0").unwrap(),
            &arr2(&[[0.0f32, -2.0], [3.0, 0.0]]).into_dyn()
        );
        assert_eq!(scope.find("fc_0.b_0").unwrap(), &arr1(&[0.0f32, 1.0]).into_dyn());
        // Masks are scratch state.
        assert_eq!(scope.len(), 2);
        assert_eq!(g.var_by_name("fc_0.w_0").unwrap().shape, vec![2, 2]);
    }

    #[test]
    fn untriggered_batches_leave_weights_alone() {
        let (mut g, mut scope) = setup();
        let before = scope.clone();
        let executor = CpuExecutor::new();
        let mut strategy = PruneStrategy::new(
            RatioPruner::uniform(0.5),
            PruneConfig::default().with_frequency(3),
        )
        .unwrap();
        let mut ctx = Context::new(&mut g, &mut scope, &executor, Place::Cpu);
        ctx.batch_id = 1;
        strategy.on_batch_end(&mut ctx).unwrap();
        assert_eq!(scope, before);
    }

    #[test]
    fn failed_run_still_drops_masks() {
        let (mut g, mut scope) = setup();
        let executor = CpuExecutor::new();
        let mut strategy = PruneStrategy::new(MagnitudePruner::new(0.5), PruneConfig::default()).unwrap();
        let mut ctx = Context::new(&mut g, &mut scope, &executor, Place::Device(0));
        assert!(strategy.on_batch_end(&mut ctx).is_err());
        assert_eq!(scope.len(), 2);
    }

    #[test]
    fn mask_graph_layout() {
        let (g, _) = setup();
        let scratch = build_mask_graph(&g).unwrap();
        let kinds: Vec<_> = scratch.ops().iter().map(|op| op.type_name()).collect();
        assert_eq!(kinds, vec!["elementwise_mul", "assign", "elementwise_mul", "assign"]);
        assert!(scratch.var_by_name("fc_0.w_0@MASK").is_ok());
    }
}
