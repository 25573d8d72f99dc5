//! `graphslim` demo: builds a small convolutional classifier, then runs
//! sensitivity-driven filter pruning followed by in-training weight masking
//! on synthetic data.

use clap::Parser;
use graphslim::graph::builder::GraphBuilder;
use graphslim::graph::{Graph, PoolType, Variable};
use graphslim::prune::{RatioPruner, RatioSelection, StructurePruner};
use graphslim::runtime::backend::Executor;
use graphslim::runtime::cpu_backend::CpuExecutor;
use graphslim::runtime::scope::{Place, Scope};
use graphslim::strategy::{
    CompressionConfig, Compressor, Context, PruneConfig, PruneStrategy, SensitivePruneConfig,
    SensitivePruneStrategy, SENSITIVITY_METRIC,
};
use ndarray::{ArrayD, Axis, IxDyn};
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const BATCH: usize = 8;
const CLASSES: usize = 4;
const METRIC: &str = "accuracy_0.tmp_0";
const LOGITS: &str = "fc_0.tmp_1";

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "graphslim: structured pruning demo", long_about = None)]
struct Args {
    /// Step between ratios tried by the sensitivity sweep
    #[arg(long, default_value_t = 0.25)]
    delta_rate: f32,

    /// Sum of the ratios applied across all pruned filters
    #[arg(long, default_value_t = 0.5)]
    target_ratio: f32,

    /// Accept ratios whose loss stays under the threshold, not only zero loss
    #[arg(long)]
    within_threshold: bool,

    /// JSON file with `prune` and `sensitive_prune` sections; overrides the flags above
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to cache the sensitivity table
    #[arg(long)]
    sensitivities: Option<PathBuf>,

    #[arg(long, default_value_t = 2)]
    epochs: usize,

    #[arg(long, default_value_t = 4)]
    batches: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_configs(&args)?;

    // ---------- 1. Model ----------
    let mut graph = build_model()?;
    info!(ops = graph.num_ops(), params = graph.parameters().count(), "model built");

    // ---------- 2. Parameters and synthetic data ----------
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut scope = Scope::new();
    scope.init_parameters(&graph, Place::Cpu, |v| init_parameter(v, &mut rng));
    let pixels = Uniform::new(0.0f32, 1.0);
    let image = ArrayD::from_shape_fn(IxDyn(&[BATCH, 3, 8, 8]), |_| rng.sample(pixels));
    scope.set("image", image, Place::Cpu);

    // Labels are the unpruned model's own predictions, so the baseline is 1.0.
    let executor = CpuExecutor::new();
    scope.set("label", ArrayD::zeros(IxDyn(&[BATCH, 1])), Place::Cpu);
    let logits = executor.run(&graph, &mut scope, Place::Cpu, &[LOGITS])?.remove(0);
    let labels = logits.map_axis(Axis(1), |row| {
        row.iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0.0, |(i, _)| i as f32)
    });
    scope.set("label", labels.insert_axis(Axis(1)), Place::Cpu);

    // ---------- 3. Compression ----------
    let mut compressor = build_compressor(config)?;
    info!(strategies = compressor.len(), "compressor ready");

    {
        let mut ctx = Context::new(&mut graph, &mut scope, &executor, Place::Cpu)
            .with_entry(SENSITIVITY_METRIC, METRIC);
        compressor.run(&mut ctx, args.epochs, args.batches, |ctx| {
            let metric = ctx.get(SENSITIVITY_METRIC)?.to_string();
            let accuracy = ctx.evaluate(&metric)?;
            info!(epoch = ctx.epoch_id, batch = ctx.batch_id, accuracy, "batch");
            Ok(())
        })?;
    }

    // ---------- 4. Report ----------
    report(&graph, &mut scope, &executor)?;
    Ok(())
}

/// With `--config`, the file decides which strategies run; without it both
/// run with the command-line settings.
fn load_configs(args: &Args) -> Result<CompressionConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => CompressionConfig::from_json_file(path)?,
        None => {
            let selection = if args.within_threshold {
                RatioSelection::WithinThreshold
            } else {
                RatioSelection::ZeroLoss
            };
            CompressionConfig {
                prune: Some(PruneConfig::default().with_epochs(0, args.epochs)),
                sensitive_prune: Some(
                    SensitivePruneConfig::default()
                        .with_delta_rate(args.delta_rate)
                        .with_target_ratio(args.target_ratio)
                        .with_selection(selection),
                ),
            }
        }
    };
    if let (Some(path), Some(sensitive)) = (&args.sensitivities, config.sensitive_prune.as_mut()) {
        sensitive.sensitivities_file = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Registers one strategy per configured section, sensitive pruning first.
fn build_compressor(config: CompressionConfig) -> Result<Compressor, Box<dyn std::error::Error>> {
    let mut compressor = Compressor::new();
    if let Some(sensitive) = config.sensitive_prune {
        compressor = compressor.add_strategy(SensitivePruneStrategy::new(StructurePruner::default(), sensitive)?);
    }
    if let Some(prune) = config.prune {
        compressor = compressor.add_strategy(PruneStrategy::new(RatioPruner::uniform(0.9), prune)?);
    }
    if compressor.is_empty() {
        warn!("no strategy configured, the model is left as is");
    }
    Ok(compressor)
}

/// conv-bn-relu, two parallel convs concatenated, conv, avg pool, fc.
fn build_model() -> Result<Graph, Box<dyn std::error::Error>> {
    let mut b = GraphBuilder::new();
    let image = b.data("image", vec![BATCH, 3, 8, 8])?;
    let label = b.data("label", vec![BATCH, 1])?;

    let c0 = b.conv2d(image, 8, 3, 1, 1, true)?;
    let bn = b.batch_norm(c0)?;
    let r0 = b.relu(bn)?;

    let c1 = b.conv2d(r0, 8, 3, 1, 1, true)?;
    let r1 = b.relu(c1)?;
    let c2 = b.conv2d(r0, 4, 1, 1, 0, true)?;
    let cat = b.concat(&[r1, c2])?;

    let c3 = b.conv2d(cat, 8, 3, 1, 1, false)?;
    let pooled = b.pool2d(c3, PoolType::Avg, 2, 2)?;
    let logits = b.fc(pooled, CLASSES, true)?;
    b.accuracy(logits, label)?;
    Ok(b.finish())
}

fn init_parameter(var: &Variable, rng: &mut StdRng) -> ArrayD<f32> {
    let shape = IxDyn(&var.shape);
    if var.name.starts_with("batch_norm") {
        // Scale and variance start at one, shift and mean at zero.
        let ones = var.name.ends_with(".w_0") || var.name.ends_with(".w_2");
        return ArrayD::from_elem(shape, if ones { 1.0 } else { 0.0 });
    }
    let fan_in: usize = var.shape.iter().skip(1).product::<usize>().max(1);
    let bound = (1.0 / fan_in as f32).sqrt();
    let dist = Uniform::new_inclusive(-bound, bound);
    ArrayD::from_shape_fn(shape, |_| rng.sample(dist))
}

fn report(graph: &Graph, scope: &mut Scope, executor: &CpuExecutor) -> Result<(), Box<dyn std::error::Error>> {
    println!("\nParameter shapes after compression:");
    for param in graph.parameters() {
        let zeros = scope.find(&param.name)?.iter().filter(|&&v| v == 0.0).count();
        println!("  {:<20} {:?} ({} zeros)", param.name, param.shape, zeros);
    }
    match executor.run(graph, scope, Place::Cpu, &[METRIC]) {
        Ok(values) => println!("Final accuracy: {:.3}", values[0].mean().unwrap_or(0.0)),
        Err(e) => warn!(error = %e, "final evaluation failed"),
    }
    Ok(())
}
