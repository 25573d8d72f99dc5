//! Sensitivity-driven structural pruning, applied once when compression
//! begins: analyze, select ratios, then prune every selected filter for good.

use super::config::SensitivePruneConfig;
use super::context::{evaluate, Context, SENSITIVITY_METRIC};
use super::Strategy;
use crate::analysis::shape_inference::ShapeInference;
use crate::prune::error::Result;
use crate::prune::propagate::{Propagator, ShrinkRecord};
use crate::prune::pruner::StructuredPruner;
use crate::prune::selector::RatioSelector;
use crate::prune::sensitivity::{SensitivityAnalyzer, SensitivityTable};
use tracing::{debug, info};

pub struct SensitivePruneStrategy<P> {
    pruner: P,
    config: SensitivePruneConfig,
    sensitivities: SensitivityTable,
}

impl<P: StructuredPruner> SensitivePruneStrategy<P> {
    pub fn new(pruner: P, config: SensitivePruneConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pruner,
            config,
            sensitivities: SensitivityTable::new(),
        })
    }

    /// Seeds the table; parameters already present are not re-analyzed.
    pub fn with_sensitivities(mut self, table: SensitivityTable) -> Self {
        self.sensitivities = table;
        self
    }

    pub fn sensitivities(&self) -> &SensitivityTable {
        &self.sensitivities
    }

    pub fn config(&self) -> &SensitivePruneConfig {
        &self.config
    }

    fn propagator(pruner: &P, prune_batch_norm: bool) -> Propagator<'_> {
        Propagator::new(pruner).with_batch_norm(prune_batch_norm)
    }

    /// Measures a curve for every eligible filter missing from the table.
    pub fn compute_sensitivities(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        if let Some(path) = &self.config.sensitivities_file {
            if path.exists() {
                let stored = SensitivityTable::load(path)?;
                debug!(path = %path.display(), entries = stored.len(), "loaded sensitivities");
                self.sensitivities.merge(stored);
            }
        }

        let metric = ctx.get(SENSITIVITY_METRIC)?.to_string();
        let analyzer = SensitivityAnalyzer::new(
            Self::propagator(&self.pruner, self.config.prune_batch_norm),
            self.config.delta_rate,
            &self.config.param_pattern,
        )?;
        let (executor, place) = (ctx.executor, ctx.place);
        analyzer.analyze(
            ctx.graph,
            ctx.scope,
            place,
            &mut self.sensitivities,
            |graph, scope| evaluate(executor, graph, scope, place, &metric),
        )?;

        if let Some(path) = &self.config.sensitivities_file {
            self.sensitivities.save(path)?;
            debug!(path = %path.display(), "saved sensitivities");
        }
        Ok(())
    }

    /// Hard-prunes each `(name, ratio)` in order. Shapes are refreshed after
    /// every filter so later ones see current channel counts.
    pub fn prune_parameters(
        &self,
        ctx: &mut Context<'_>,
        selected: &[(String, f32)],
    ) -> Result<Vec<ShrinkRecord>> {
        let propagator = Self::propagator(&self.pruner, self.config.prune_batch_norm);
        let mut records = Vec::new();
        for (name, ratio) in selected {
            let param = ctx.graph.var_id(name)?;
            let shrunk = propagator.propagate(ctx.graph, ctx.scope, param, *ratio, ctx.place, None)?;
            ShapeInference::run(ctx.graph)?;
            info!(param = %name, ratio, tensors = shrunk.len(), "pruned");
            records.extend(shrunk);
        }
        Ok(records)
    }
}

impl<P: StructuredPruner> Strategy for SensitivePruneStrategy<P> {
    fn name(&self) -> &str {
        "sensitive_prune"
    }

    fn start_epoch(&self) -> usize {
        self.config.start_epoch
    }

    fn end_epoch(&self) -> usize {
        self.config.end_epoch
    }

    fn on_compression_begin(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        self.compute_sensitivities(ctx)?;
        let selector = RatioSelector::new(self.config.selection, self.config.acc_loss_threshold);
        let selected = selector.select(&self.sensitivities, self.config.target_ratio)?;
        let records = self.prune_parameters(ctx, &selected)?;
        info!(
            params = selected.len(),
            tensors = records.len(),
            "sensitive pruning finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::GraphBuilder;
    use crate::graph::Graph;
    use crate::prune::error::PruneError;
    use crate::prune::pruner::StructurePruner;
    use crate::prune::sensitivity::SensitivityCurve;
    use crate::runtime::backend::Executor;
    use crate::runtime::cpu_backend::CpuExecutor;
    use crate::runtime::scope::{Place, Scope};
    use ndarray::{ArrayD, IxDyn};

    /// conv(3->4) -> relu -> conv(4->2) -> mean
    fn net() -> (Graph, Scope) {
        let mut b = GraphBuilder::new();
        let x = b.data("image", vec![1, 3, 4, 4]).unwrap();
        let c0 = b.conv2d(x, 4, 1, 1, 0, true).unwrap();
        let r = b.relu(c0).unwrap();
        let c1 = b.conv2d(r, 2, 1, 1, 0, false).unwrap();
        b.mean(c1).unwrap();
        let g = b.finish();
        let mut scope = Scope::new();
        scope.init_parameters(&g, Place::Cpu, |v| {
            ArrayD::from_shape_fn(IxDyn(&v.shape), |idx| (idx[0] + 1) as f32)
        });
        scope.set("image", ArrayD::from_elem(IxDyn(&[1, 3, 4, 4]), 1.0), Place::Cpu);
        (g, scope)
    }

    fn seeded_table() -> SensitivityTable {
        let mut table = SensitivityTable::new();
        for (name, zero_at) in [("conv2d_0.w_0", 0.5), ("conv2d_1.w_0", 0.5)] {
            let mut c = SensitivityCurve::default();
            c.push(1.0, 0.7);
            c.push(zero_at, 0.0);
            table.insert(name, c);
        }
        table
    }

    #[test]
    fn compression_begin_hard_prunes_selected_filters() {
        let (mut g, mut scope) = net();
        let executor = CpuExecutor::new();
        let mut strategy = SensitivePruneStrategy::new(
            StructurePruner::default(),
            SensitivePruneConfig::default().with_target_ratio(1.0),
        )
        .unwrap()
        .with_sensitivities(seeded_table());

        let mut ctx = Context::new(&mut g, &mut scope, &executor, Place::Cpu)
            .with_entry(SENSITIVITY_METRIC, "mean_0.tmp_0");
        strategy.on_compression_begin(&mut ctx).unwrap();
        // Both filters selected at 0.5, rescaled to 0.5 each.
        assert_eq!(g.var_by_name("conv2d_0.w_0").unwrap().shape, vec![2, 3, 1, 1]);
        assert_eq!(g.var_by_name("conv2d_0.b_0").unwrap().shape, vec![2]);
        assert_eq!(g.var_by_name("conv2d_1.w_0").unwrap().shape, vec![1, 2, 1, 1]);
        assert_eq!(g.var_by_name("relu_0.tmp_0").unwrap().shape, vec![1, 2, 4, 4]);
        scope.check_parameter_shapes(&g).unwrap();

        // The pruned graph still runs.
        let out = executor
            .run(&g, &mut scope, Place::Cpu, &["conv2d_1.tmp_0"])
            .unwrap();
        assert_eq!(out[0].shape(), &[1, 1, 4, 4]);
    }

    #[test]
    fn analysis_runs_the_metric_and_restores() {
        let (mut g, mut scope) = net();
        let (g0, s0) = (g.clone(), scope.clone());
        let executor = CpuExecutor::new();
        let mut strategy = SensitivePruneStrategy::new(
            StructurePruner::default(),
            SensitivePruneConfig::default().with_delta_rate(0.5),
        )
        .unwrap();
        let mut ctx = Context::new(&mut g, &mut scope, &executor, Place::Cpu)
            .with_entry(SENSITIVITY_METRIC, "mean_0.tmp_0");
        strategy.compute_sensitivities(&mut ctx).unwrap();

        let table = strategy.sensitivities();
        assert_eq!(table.len(), 2);
        // Zeroing every filter of the last conv drops the mean to zero.
        let last = table.get("conv2d_1.w_0").unwrap();
        assert_eq!(last.pruned_percent, vec![1.0, 0.5]);
        assert!(last.acc_loss[0] > 0.0);
        assert_eq!(g, g0);
        assert_eq!(scope, s0);
    }

    #[test]
    fn missing_metric_entry_fails() {
        let (mut g, mut scope) = net();
        let executor = CpuExecutor::new();
        let mut strategy =
            SensitivePruneStrategy::new(StructurePruner::default(), SensitivePruneConfig::default()).unwrap();
        let mut ctx = Context::new(&mut g, &mut scope, &executor, Place::Cpu);
        assert!(matches!(
            strategy.on_compression_begin(&mut ctx),
            Err(PruneError::MissingContextEntry(_))
        ));
    }

    #[test]
    fn sensitivities_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sens.json");
        seeded_table().save(&path).unwrap();

        let (mut g, mut scope) = net();
        let executor = CpuExecutor::new();
        let mut strategy = SensitivePruneStrategy::new(
            StructurePruner::default(),
            SensitivePruneConfig::default().with_sensitivities_file(&path),
        )
        .unwrap();
        let mut ctx = Context::new(&mut g, &mut scope, &executor, Place::Cpu)
            .with_entry(SENSITIVITY_METRIC, "mean_0.tmp_0");
        strategy.compute_sensitivities(&mut ctx).unwrap();
        assert_eq!(strategy.sensitivities(), &seeded_table());
        assert_eq!(SensitivityTable::load(&path).unwrap(), seeded_table());
    }
}
