//! # Compression Strategies
//!
//! A [`Strategy`] reacts to phases of an external training loop. The loop
//! owns the epoch and batch counters and calls the hooks through a
//! [`Compressor`], which forwards each hook to its strategies in
//! registration order.
//!
//! - [`PruneStrategy`]: masks weights at batch ends.
//! - [`SensitivePruneStrategy`]: analyzes, selects and hard-prunes once at
//!   compression begin.

pub mod config;
pub mod context;
pub mod prune;
pub mod sensitive;

pub use config::{CompressionConfig, PruneConfig, SensitivePruneConfig};
pub use context::{Context, SENSITIVITY_METRIC};
pub use prune::PruneStrategy;
pub use sensitive::SensitivePruneStrategy;

use crate::prune::error::Result;
use tracing::debug;

/// Lifecycle hooks of a compression strategy. All hooks default to no-ops.
pub trait Strategy {
    fn name(&self) -> &str;

    fn start_epoch(&self) -> usize;

    fn end_epoch(&self) -> usize;

    fn on_compression_begin(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
        Ok(())
    }

    fn on_epoch_begin(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
        Ok(())
    }

    fn on_batch_begin(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
        Ok(())
    }

    fn on_batch_end(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
        Ok(())
    }

    fn on_compression_end(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
        Ok(())
    }
}

/// Ordered set of strategies driven by one training loop.
#[derive(Default)]
pub struct Compressor {
    strategies: Vec<Box<dyn Strategy>>,
}

macro_rules! forward_hook {
    ($($hook:ident),* $(,)?) => {
        $(
            pub fn $hook(&mut self, ctx: &mut Context<'_>) -> Result<()> {
                for strategy in &mut self.strategies {
                    debug!(strategy = strategy.name(), hook = stringify!($hook), "dispatch");
                    strategy.$hook(ctx)?;
                }
                Ok(())
            }
        )*
    };
}

impl Compressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_strategy(mut self, strategy: impl Strategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    forward_hook!(
        on_compression_begin,
        on_epoch_begin,
        on_epoch_end,
        on_batch_begin,
        on_batch_end,
        on_compression_end,
    );

    /// Minimal training loop: calls `train_batch` for every batch of every
    /// epoch, with all hooks fired around it and the context counters kept
    /// current.
    pub fn run<F>(
        &mut self,
        ctx: &mut Context<'_>,
        epochs: usize,
        batches_per_epoch: usize,
        mut train_batch: F,
    ) -> Result<()>
    where
        F: FnMut(&mut Context<'_>) -> Result<()>,
    {
        self.on_compression_begin(ctx)?;
        for epoch in 0..epochs {
            ctx.epoch_id = epoch;
            ctx.batch_id = 0;
            self.on_epoch_begin(ctx)?;
            for batch in 0..batches_per_epoch {
                ctx.batch_id = batch;
                self.on_batch_begin(ctx)?;
                train_batch(ctx)?;
                self.on_batch_end(ctx)?;
            }
            self.on_epoch_end(ctx)?;
        }
        self.on_compression_end(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::prune::error::PruneError;
    use crate::runtime::cpu_backend::CpuExecutor;
    use crate::runtime::scope::{Place, Scope};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        label: &'static str,
        log: Rc<RefCell<Vec<String>>>,
        fail_on_batch_end: bool,
    }

    impl Strategy for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn start_epoch(&self) -> usize {
            0
        }

        fn end_epoch(&self) -> usize {
            1
        }

        fn on_compression_begin(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
            self.log.borrow_mut().push(format!("{}:begin", self.label));
            Ok(())
        }

        fn on_batch_end(&mut self, ctx: &mut Context<'_>) -> Result<()> {
            self.log
                .borrow_mut()
                .push(format!("{}:batch{}.{}", self.label, ctx.epoch_id, ctx.batch_id));
            if self.fail_on_batch_end {
                return Err(PruneError::InvalidConfig("boom".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn hooks_run_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut compressor = Compressor::new()
            .add_strategy(Recorder { label: "a", log: log.clone(), fail_on_batch_end: false })
            .add_strategy(Recorder { label: "b", log: log.clone(), fail_on_batch_end: false });
        let (mut g, mut scope) = (Graph::new(), Scope::new());
        let executor = CpuExecutor::new();
        let mut ctx = Context::new(&mut g, &mut scope, &executor, Place::Cpu);

        let mut trained = 0;
        compressor
            .run(&mut ctx, 2, 1, |_| {
                trained += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(trained, 2);
        assert_eq!(
            *log.borrow(),
            vec!["a:begin", "b:begin", "a:batch0.0", "b:batch0.0", "a:batch1.0", "b:batch1.0"]
        );
    }

    #[test]
    fn first_error_stops_dispatch() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut compressor = Compressor::new()
            .add_strategy(Recorder { label: "a", log: log.clone(), fail_on_batch_end: true })
            .add_strategy(Recorder { label: "b", log: log.clone(), fail_on_batch_end: false });
        let (mut g, mut scope) = (Graph::new(), Scope::new());
        let executor = CpuExecutor::new();
        let mut ctx = Context::new(&mut g, &mut scope, &executor, Place::Cpu);

        assert!(compressor.on_batch_end(&mut ctx).is_err());
        assert_eq!(*log.borrow(), vec!["a:batch0.0"]);
    }
}
