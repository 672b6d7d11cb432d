//! Pass scheduler for orchestrating SSA pass execution.
//!
//! The `PassScheduler` runs the optimization passes in a fixed order. The
//! order is grouped into four stages:
//!
//! 1. **Prologue**: the initial validator, run once
//! 2. **Cleanup**: dead code, colon and flatten elimination, allocation value
//!    elimination (followed by the `mid` validator when enabled)
//! 3. **Loops**: loop interchange, loop fusion and a trailing dead code pass
//! 4. **Epilogue**: the final validator, run once
//!
//! Stages 2 and 3 repeat until an iteration changes nothing for
//! `stable_iterations` consecutive iterations, or `max_iterations` is hit.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use rayon::prelude::*;

use crate::{
    compiler::{
        cache::AnalysisCache,
        config::PipelineConfig,
        context::CompilerContext,
        events::{EventKind, PipelineStats},
        pass::SsaPass,
        passes::{
            AllocationValueEliminationPass, ColonEliminationPass, DeadCodeEliminationPass,
            LoopFusionPass, LoopInterchangePass, SsaValidatorPass,
            VerticalFlattenEliminationPass,
        },
        removal::{RemovalDriver, SizeAwareRemovalDriver},
    },
    Result,
};

/// Orchestrates SSA pass execution over every function of a context.
///
/// Functions are independent: each pass is applied to all functions in
/// parallel, and a function's analyses live in its own [`AnalysisCache`].
/// After every pass invocation that reports a change the scheduler marks
/// the analyses named by [`SsaPass::invalidates`] stale.
#[allow(clippy::struct_field_names)]
pub struct PassScheduler {
    /// Maximum iterations for the repeated stages.
    max_iterations: usize,
    /// Number of unchanged iterations before stopping.
    stable_iterations: usize,
    /// Maximum consecutive runs of one pass on one function.
    max_phase_iterations: usize,
    /// Iterations completed by the last `run_pipeline`.
    iterations: usize,
    /// Runs once before the first iteration.
    pub prologue: Vec<Box<dyn SsaPass>>,
    /// Element-wise rewrites and their cleanup.
    pub cleanup: Vec<Box<dyn SsaPass>>,
    /// Loop restructuring.
    pub loops: Vec<Box<dyn SsaPass>>,
    /// Runs once after the last iteration.
    pub epilogue: Vec<Box<dyn SsaPass>>,
}

impl Default for PassScheduler {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl PassScheduler {
    /// Creates a scheduler without passes.
    ///
    /// # Arguments
    ///
    /// * `max_iterations` - Maximum iterations of the repeated stages.
    /// * `stable_iterations` - Stop early if no changes for this many iterations.
    /// * `max_phase_iterations` - Maximum consecutive runs of one pass on one function.
    #[must_use]
    pub fn new(
        max_iterations: usize,
        stable_iterations: usize,
        max_phase_iterations: usize,
    ) -> Self {
        Self {
            max_iterations,
            stable_iterations: stable_iterations.max(1),
            max_phase_iterations: max_phase_iterations.max(1),
            iterations: 0,
            prologue: Vec::new(),
            cleanup: Vec::new(),
            loops: Vec::new(),
            epilogue: Vec::new(),
        }
    }

    /// Creates the standard pipeline selected by `config`.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut scheduler = Self::new(
            config.max_iterations,
            config.stable_iterations,
            config.max_phase_iterations,
        );

        scheduler
            .prologue
            .push(Box::new(SsaValidatorPass::new("initial")));

        if config.enable_dead_code_elimination {
            scheduler
                .cleanup
                .push(Box::new(RemovalDriver::new(DeadCodeEliminationPass::new())));
        }
        if config.enable_colon_elimination {
            scheduler.cleanup.push(Box::new(SizeAwareRemovalDriver::new(
                ColonEliminationPass::new(),
            )));
        }
        if config.enable_flatten_elimination {
            scheduler.cleanup.push(Box::new(SizeAwareRemovalDriver::new(
                VerticalFlattenEliminationPass::new(),
            )));
        }
        if config.enable_dead_code_elimination
            && (config.enable_colon_elimination || config.enable_flatten_elimination)
        {
            scheduler
                .cleanup
                .push(Box::new(RemovalDriver::new(DeadCodeEliminationPass::new())));
        }
        if config.enable_allocation_value_elimination {
            scheduler
                .cleanup
                .push(Box::new(AllocationValueEliminationPass::new()));
        }
        if config.validate_between_passes {
            scheduler.cleanup.push(Box::new(SsaValidatorPass::new("mid")));
        }

        if config.enable_loop_interchange {
            scheduler.loops.push(Box::new(LoopInterchangePass::from_kind(
                config.interchange_format,
            )));
        }
        if config.enable_loop_fusion {
            scheduler.loops.push(Box::new(LoopFusionPass::new()));
        }
        if config.enable_dead_code_elimination && !scheduler.loops.is_empty() {
            scheduler
                .loops
                .push(Box::new(RemovalDriver::new(DeadCodeEliminationPass::new())));
        }

        scheduler
            .epilogue
            .push(Box::new(SsaValidatorPass::new("final")));

        scheduler
    }

    /// Names of all scheduled passes in execution order.
    #[must_use]
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.prologue
            .iter()
            .chain(&self.cleanup)
            .chain(&self.loops)
            .chain(&self.epilogue)
            .map(|pass| pass.name())
            .collect()
    }

    /// Iterations completed by the last [`run_pipeline`](Self::run_pipeline).
    #[must_use]
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Statistics of `ctx`'s events, tagged with this scheduler's iteration count.
    #[must_use]
    pub fn stats(&self, ctx: &CompilerContext) -> PipelineStats {
        PipelineStats::from_log(&ctx.events)
            .with_iterations(self.iterations)
            .with_time(ctx.elapsed())
    }

    /// Runs one pass over every function.
    ///
    /// Each function is removed from the context, rewritten with no lock held
    /// and reinserted, so a function is never visible to two workers. The
    /// pass is repeated on a function while it reports changes, at most
    /// `max_phase_iterations` times.
    ///
    /// # Returns
    ///
    /// The number of invocations that changed a function.
    fn run_pass(
        ctx: &CompilerContext,
        pass: &dyn SsaPass,
        caches: &DashMap<String, AnalysisCache>,
        max_phase_iterations: usize,
    ) -> Result<usize> {
        let changes = AtomicUsize::new(0);

        ctx.function_names()
            .par_iter()
            .try_for_each(|name| -> Result<()> {
                let Some(mut function) = ctx.take_function(name) else {
                    return Ok(());
                };
                if !pass.should_run(&function, ctx) {
                    ctx.add_function(function);
                    return Ok(());
                }

                let mut cache = caches.remove(name).map(|(_, c)| c).unwrap_or_default();
                let mut outcome = Ok(());
                for _ in 0..max_phase_iterations {
                    match pass.run_on_function(&mut function, &mut cache, ctx) {
                        Ok(true) => {
                            cache.invalidate(pass.invalidates());
                            changes.fetch_add(1, Ordering::Relaxed);
                            ctx.changed_functions.insert(name.clone());
                            ctx.events
                                .record(EventKind::PassCompleted)
                                .function(name.as_str())
                                .pass(pass.name());
                        }
                        Ok(false) => break,
                        Err(error) => {
                            outcome = Err(error);
                            break;
                        }
                    }
                }

                caches.insert(name.clone(), cache);
                ctx.add_function(function);
                outcome
            })?;

        Ok(changes.load(Ordering::Relaxed))
    }

    /// Runs a stage's passes once each, in order.
    fn run_stage(
        ctx: &CompilerContext,
        passes: &mut [Box<dyn SsaPass>],
        caches: &DashMap<String, AnalysisCache>,
        max_phase_iterations: usize,
    ) -> Result<usize> {
        for pass in passes.iter_mut() {
            pass.initialize(ctx)?;
        }

        let mut changes = 0;
        for pass in passes.iter() {
            changes += Self::run_pass(ctx, pass.as_ref(), caches, max_phase_iterations)?;
        }

        for pass in passes.iter_mut() {
            pass.finalize(ctx)?;
        }

        Ok(changes)
    }

    /// Runs the complete optimization pipeline.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The compiler context holding the functions to optimize.
    ///
    /// # Returns
    ///
    /// The number of pass invocations that changed a function. Running the
    /// pipeline again on its own output returns `0`. Events are accumulated
    /// in `ctx.events`.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a pass; the function that raised it
    /// is left in the state the failing pass produced.
    pub fn run_pipeline(&mut self, ctx: &CompilerContext) -> Result<usize> {
        let caches = DashMap::new();
        let max_phase = self.max_phase_iterations;
        let mut changes = Self::run_stage(ctx, &mut self.prologue, &caches, max_phase)?;

        let mut stable_count = 0;
        let mut converged = false;
        self.iterations = 0;
        for iteration in 0..self.max_iterations {
            self.iterations = iteration + 1;

            let mut iteration_changes =
                Self::run_stage(ctx, &mut self.cleanup, &caches, max_phase)?;
            iteration_changes += Self::run_stage(ctx, &mut self.loops, &caches, max_phase)?;
            changes += iteration_changes;

            if iteration_changes == 0 {
                stable_count += 1;
                if stable_count >= self.stable_iterations {
                    converged = true;
                    break;
                }
            } else {
                stable_count = 0;
            }
        }

        if !converged {
            ctx.events.record(EventKind::Warning).message(format!(
                "pipeline still changing after {} iterations",
                self.iterations
            ));
        }

        changes += Self::run_stage(ctx, &mut self.epilogue, &caches, max_phase)?;
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        analysis::{BlockId, FunctionBody, Instruction, VariableTypes},
        compiler::{cache::AnalysisSet, services::TypedFunction, InterchangeFormatKind},
        Error,
    };

    /// Reports a change on its first `budget` invocations.
    struct TestPass {
        name: &'static str,
        budget: AtomicUsize,
        invalidates: AnalysisSet,
    }

    impl TestPass {
        fn new(name: &'static str, budget: usize) -> Self {
            Self {
                name,
                budget: AtomicUsize::new(budget),
                invalidates: AnalysisSet::ALL,
            }
        }
    }

    impl SsaPass for TestPass {
        fn name(&self) -> &'static str {
            self.name
        }

        fn run_on_function(
            &self,
            function: &mut TypedFunction,
            cache: &mut AnalysisCache,
            ctx: &CompilerContext,
        ) -> Result<bool> {
            cache.usages(&function.body);
            let changed = self
                .budget
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| b.checked_sub(1))
                .is_ok();
            if changed {
                ctx.events
                    .record(EventKind::InstructionEliminated)
                    .function(function.name())
                    .message("test");
            }
            Ok(changed)
        }

        fn invalidates(&self) -> AnalysisSet {
            self.invalidates
        }
    }

    struct FailingPass;

    impl SsaPass for FailingPass {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run_on_function(
            &self,
            function: &mut TypedFunction,
            _cache: &mut AnalysisCache,
            _ctx: &CompilerContext,
        ) -> Result<bool> {
            Err(malformed_error!("broken {}", function.name()))
        }
    }

    fn context(names: &[&str]) -> CompilerContext {
        let ctx = CompilerContext::new();
        for name in names {
            let mut body = FunctionBody::new(*name);
            body.block_mut(BlockId::ENTRY)
                .unwrap()
                .add_instruction(Instruction::assign_integer("x", 1));
            ctx.add_function(TypedFunction::new(body, VariableTypes::new()));
        }
        ctx
    }

    #[test]
    fn test_scheduler_iteration_limits() {
        let scheduler = PassScheduler::new(10, 3, 5);
        assert_eq!(scheduler.max_iterations, 10);
        assert_eq!(scheduler.stable_iterations, 3);
        assert_eq!(scheduler.max_phase_iterations, 5);
    }

    #[test]
    fn test_default_pipeline_order() {
        let scheduler = PassScheduler::default();
        assert_eq!(
            scheduler.pass_names(),
            vec![
                "ssa_validator",
                "dead_code_elimination",
                "colon_elimination",
                "vertical_flatten_elimination",
                "dead_code_elimination",
                "allocation_value_elimination",
                "ssa_validator",
                "loop_interchange",
                "loop_fusion",
                "dead_code_elimination",
                "ssa_validator",
            ]
        );
    }

    #[test]
    fn test_minimal_pipeline() {
        let scheduler = PassScheduler::from_config(&PipelineConfig::minimal());
        assert_eq!(
            scheduler.pass_names(),
            vec!["ssa_validator", "dead_code_elimination", "ssa_validator", "ssa_validator"]
        );

        let config = PipelineConfig::default()
            .with_loop_transforms(false)
            .with_interchange_format(InterchangeFormatKind::ColumnMajor);
        let scheduler = PassScheduler::from_config(&config);
        assert!(scheduler.loops.is_empty());
    }

    #[test]
    fn test_runs_until_stable() {
        let ctx = context(&["f", "g"]);
        let mut scheduler = PassScheduler::new(8, 1, 1);
        scheduler.cleanup.push(Box::new(TestPass::new("budget", 3)));

        let changes = scheduler.run_pipeline(&ctx).unwrap();
        assert_eq!(changes, 3);
        assert_eq!(ctx.events.count_kind(EventKind::InstructionEliminated), 3);
        assert!(scheduler.iterations() <= 3);
        assert!(ctx.was_changed("f") || ctx.was_changed("g"));
        assert_eq!(ctx.function_count(), 2);

        let mut again = PassScheduler::new(8, 1, 1);
        again.cleanup.push(Box::new(TestPass::new("budget", 0)));
        assert_eq!(again.run_pipeline(&ctx).unwrap(), 0);
        assert_eq!(again.iterations(), 1);
    }

    #[test]
    fn test_iterations_are_bounded() {
        let ctx = context(&["f"]);
        let mut scheduler = PassScheduler::new(2, 1, 1);
        scheduler.loops.push(Box::new(TestPass::new("busy", 100)));

        assert_eq!(scheduler.run_pipeline(&ctx).unwrap(), 2);
        assert_eq!(scheduler.iterations(), 2);
        assert_eq!(ctx.events.count_kind(EventKind::Warning), 1);
    }

    #[test]
    fn test_error_propagates_and_keeps_function() {
        let ctx = context(&["f"]);
        let mut scheduler = PassScheduler::new(2, 1, 1);
        scheduler.cleanup.push(Box::new(FailingPass));

        let result = scheduler.run_pipeline(&ctx);
        assert!(matches!(result, Err(Error::Malformed { .. })));
        assert!(ctx.has_function("f"));
    }

    #[test]
    fn test_stats() {
        let ctx = context(&["f"]);
        let mut scheduler = PassScheduler::new(4, 1, 2);
        scheduler.cleanup.push(Box::new(TestPass::new("budget", 1)));
        scheduler.run_pipeline(&ctx).unwrap();

        let stats = scheduler.stats(&ctx);
        assert_eq!(stats.iterations, scheduler.iterations());
        assert_eq!(stats.count(EventKind::InstructionEliminated), 1);
        assert_eq!(stats.count(EventKind::PassCompleted), 1);
    }
}
