//! Property and integration tests for the sensitivity sweep, ratio selection
//! and the lazy prune/restore cycle.

use graphslim::graph::builder::GraphBuilder;
use graphslim::graph::Graph;
use graphslim::prune::{
    ratio_schedule, Backup, MagnitudePruner, PruneError, Propagator, RatioSelector, SensitivityCurve,
    SensitivityTable, StructurePruner,
};
use graphslim::runtime::cpu_backend::CpuExecutor;
use graphslim::runtime::scope::{Place, Scope};
use graphslim::strategy::{
    Compressor, Context, PruneConfig, PruneStrategy, SensitivePruneConfig, SensitivePruneStrategy,
    SENSITIVITY_METRIC,
};

use approx::assert_abs_diff_eq;
use ndarray::{ArrayD, IxDyn};
use proptest::prelude::*;

// =============================================================================
// Fixtures
// =============================================================================

/// conv(bias) -> bn -> relu -> conv -> fc -> accuracy
fn network() -> Graph {
    let mut b = GraphBuilder::new();
    let x = b.data("image", vec![4, 2, 4, 4]).unwrap();
    let label = b.data("label", vec![4, 1]).unwrap();
    let c0 = b.conv2d(x, 6, 3, 1, 1, true).unwrap();
    let bn = b.batch_norm(c0).unwrap();
    let r = b.relu(bn).unwrap();
    let c1 = b.conv2d(r, 4, 1, 1, 0, false).unwrap();
    let logits = b.fc(c1, 2, true).unwrap();
    b.accuracy(logits, label).unwrap();
    b.finish()
}

fn filled_scope(g: &Graph) -> Scope {
    let mut scope = Scope::new();
    scope.init_parameters(g, Place::Cpu, |v| {
        ArrayD::from_shape_fn(IxDyn(&v.shape), |idx| {
            let i = idx[0] as f32;
            if v.name.ends_with(".w_2") {
                1.0 + i
            } else {
                ((i * 37.0 + 11.0) % 17.0 - 8.0) * 0.1
            }
        })
    });
    scope.set(
        "image",
        ArrayD::from_shape_fn(IxDyn(&[4, 2, 4, 4]), |idx| {
            ((idx[0] + 2 * idx[1] + idx[2] * idx[3]) % 7) as f32 * 0.3
        }),
        Place::Cpu,
    );
    scope.set("label", ArrayD::zeros(IxDyn(&[4, 1])), Place::Cpu);
    scope
}

fn curve(points: &[(f32, f32)]) -> SensitivityCurve {
    let mut c = SensitivityCurve::default();
    for &(ratio, loss) in points {
        c.push(ratio, loss);
    }
    c
}

// =============================================================================
// Lazy pruning is fully reversible
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_lazy_prune_then_restore_is_identity(
        ratio in 0.01f32..=1.0f32,
        first in any::<bool>(),
    ) {
        let mut g = network();
        let mut scope = filled_scope(&g);
        let (g0, s0) = (g.clone(), scope.clone());
        let pruner = StructurePruner::default();
        let name = if first { "conv2d_0.w_0" } else { "conv2d_1.w_0" };
        let param = g.var_id(name).unwrap();

        let mut backup = Backup::new();
        Propagator::new(&pruner)
            .propagate(&mut g, &mut scope, param, ratio, Place::Cpu, Some(&mut backup))
            .unwrap();
        backup.restore(&mut g, &mut scope).unwrap();

        prop_assert_eq!(g, g0);
        prop_assert_eq!(scope, s0);
    }

    #[test]
    fn prop_schedule_starts_at_one_and_stays_positive(delta in 0.01f32..=1.0f32) {
        let ratios = ratio_schedule(delta).unwrap();
        prop_assert_eq!(ratios[0], 1.0);
        prop_assert!(ratios.iter().all(|&r| r > 0.0 && r <= 1.0));
        prop_assert!(ratios.windows(2).all(|w| w[0] > w[1]));
        prop_assert!(ratios.len() <= (1.0 / delta).ceil() as usize);
    }

    #[test]
    fn prop_rescaled_ratios_sum_to_target(
        zero_at in proptest::collection::vec(1usize..=4, 1..6),
        target in 0.05f32..=1.0f32,
    ) {
        let mut table = SensitivityTable::new();
        for (i, &k) in zero_at.iter().enumerate() {
            let points: Vec<(f32, f32)> = ratio_schedule(0.25)
                .unwrap()
                .into_iter()
                .enumerate()
                .map(|(step, r)| (r, if step + 1 >= k { 0.0 } else { 0.5 }))
                .collect();
            table.insert(&format!("conv2d_{i}.w_0"), curve(&points));
        }
        let selected = RatioSelector::default().select(&table, target).unwrap();
        prop_assert_eq!(selected.len(), zero_at.len());
        let total: f32 = selected.iter().map(|(_, r)| r).sum();
        prop_assert!((total - target).abs() < 1e-4);
    }
}

// =============================================================================
// Sweep and selection examples
// =============================================================================

#[test]
fn quarter_step_schedule() {
    assert_eq!(ratio_schedule(0.25).unwrap(), vec![1.0, 0.75, 0.5, 0.25]);
}

#[test]
fn rescale_example() {
    let mut table = SensitivityTable::new();
    table.insert("A", curve(&[(1.0, 0.2), (0.3, 0.0)]));
    table.insert("B", curve(&[(1.0, 0.2), (0.5, 0.0)]));
    let selected = RatioSelector::default().select(&table, 0.4).unwrap();
    assert_eq!(selected.len(), 2);
    assert_abs_diff_eq!(selected[0].1, 0.15, epsilon = 1e-6);
    assert_abs_diff_eq!(selected[1].1, 0.25, epsilon = 1e-6);
}

#[test]
fn selection_without_zero_loss_fails_explicitly() {
    let mut table = SensitivityTable::new();
    table.insert("A", curve(&[(1.0, 0.2), (0.5, 0.1)]));
    let err = RatioSelector::default().select(&table, 0.4).unwrap_err();
    assert!(matches!(err, PruneError::NoZeroLossRatio));
}

// =============================================================================
// End to end through the compressor
// =============================================================================

#[test]
fn compressor_runs_both_strategies() {
    let mut g = network();
    let mut scope = filled_scope(&g);
    let executor = CpuExecutor::new();

    let mut table = SensitivityTable::new();
    table.insert("conv2d_0.w_0", curve(&[(1.0, 0.5), (0.5, 0.0)]));
    table.insert("conv2d_1.w_0", curve(&[(1.0, 0.5), (0.5, 0.0)]));

    let mut compressor = Compressor::new()
        .add_strategy(
            SensitivePruneStrategy::new(
                StructurePruner::default(),
                SensitivePruneConfig::default().with_target_ratio(1.0),
            )
            .unwrap()
            .with_sensitivities(table),
        )
        .add_strategy(
            PruneStrategy::new(MagnitudePruner::new(0.15), PruneConfig::default().with_epochs(0, 1))
                .unwrap(),
        );
    assert_eq!(compressor.len(), 2);

    let mut accuracies = Vec::new();
    {
        let mut ctx = Context::new(&mut g, &mut scope, &executor, Place::Cpu)
            .with_entry(SENSITIVITY_METRIC, "accuracy_0.tmp_0");
        compressor
            .run(&mut ctx, 2, 2, |ctx| {
                let metric = ctx.get(SENSITIVITY_METRIC)?.to_string();
                accuracies.push(ctx.evaluate(&metric)?);
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(accuracies.len(), 4);
    assert!(accuracies.iter().all(|a| (0.0..=1.0).contains(a)));
    assert_eq!(g.var_by_name("conv2d_0.w_0").unwrap().shape, vec![3, 2, 3, 3]);
    assert_eq!(g.var_by_name("batch_norm_0.w_2").unwrap().shape, vec![3]);
    assert_eq!(g.var_by_name("conv2d_1.w_0").unwrap().shape, vec![2, 3, 1, 1]);
    assert_eq!(g.var_by_name("fc_0.w_0").unwrap().shape, vec![2 * 16, 2]);
    scope.check_parameter_shapes(&g).unwrap();
    // Masking ran during the first epoch.
    let w = scope.find("conv2d_0.w_0").unwrap();
    assert!(w.iter().all(|&v| v == 0.0 || v.abs() >= 0.15));
}
