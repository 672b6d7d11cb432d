//! The trait every optimization pass implements.

use crate::{
    compiler::{
        cache::{AnalysisCache, AnalysisSet},
        context::CompilerContext,
        services::TypedFunction,
    },
    Result,
};

/// A rewrite of one [`TypedFunction`].
///
/// The scheduler hands the same pass object to several worker threads at
/// once, each with its own function and analysis cache, hence `Send + Sync`
/// and `&self` on [`run_on_function`](Self::run_on_function).
///
/// Order is fixed by [`PassScheduler`](crate::compiler::PassScheduler), not by
/// the pass. Whenever a run reports a change the scheduler drops the cached
/// analyses listed by [`invalidates`](Self::invalidates).
///
/// Finding nothing to rewrite, or failing a legality check, is `Ok(false)`.
/// `Err` means the IR is corrupt.
pub trait SsaPass: Send + Sync {
    /// Short snake_case name, used in events.
    fn name(&self) -> &'static str;

    /// Cheap pre-filter consulted before [`run_on_function`](Self::run_on_function).
    ///
    /// Passes override it to honour a function's skip set or to skip
    /// functions without any candidate instruction.
    fn should_run(&self, _function: &TypedFunction, _ctx: &CompilerContext) -> bool {
        true
    }

    /// Rewrites `function` in place and reports whether anything changed.
    ///
    /// `cache` holds analyses of `function` and rebuilds stale entries on
    /// demand. Events go to `ctx.events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the function's IR is malformed.
    fn run_on_function(
        &self,
        function: &mut TypedFunction,
        cache: &mut AnalysisCache,
        ctx: &CompilerContext,
    ) -> Result<bool>;

    /// Analyses made stale when this pass changes a function.
    fn invalidates(&self) -> AnalysisSet {
        AnalysisSet::ALL
    }

    /// Hook run before each stage execution that includes this pass.
    ///
    /// # Errors
    ///
    /// An error aborts the pipeline.
    fn initialize(&mut self, _ctx: &CompilerContext) -> Result<()> {
        Ok(())
    }

    /// Hook run after each stage execution that includes this pass.
    ///
    /// # Errors
    ///
    /// An error aborts the pipeline.
    fn finalize(&mut self, _ctx: &CompilerContext) -> Result<()> {
        Ok(())
    }

    /// One-line human description.
    fn description(&self) -> &'static str {
        self.name()
    }
}
