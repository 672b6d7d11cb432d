//! SSA validation as a pipeline stage.
//!
//! Runs [`validate`](crate::analysis::validate) on each function. The pass
//! never changes anything; it exists so that a broken rewrite is caught at
//! the point in the pipeline where it happened rather than in the backend.
//! Each instance carries a label (`"initial"`, `"mid"`, `"final"`) that shows
//! up in the events it records.

use crate::{
    analysis::validate,
    compiler::{
        cache::{AnalysisCache, AnalysisSet},
        context::CompilerContext,
        events::EventKind,
        pass::SsaPass,
        services::TypedFunction,
    },
    Result,
};

/// Checks the SSA invariants of every function.
pub struct SsaValidatorPass {
    label: &'static str,
}

impl SsaValidatorPass {
    /// Creates a validator identified by `label` in events.
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }

    /// Label of this validator instance.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl SsaPass for SsaValidatorPass {
    fn name(&self) -> &'static str {
        "ssa_validator"
    }

    fn run_on_function(
        &self,
        function: &mut TypedFunction,
        _cache: &mut AnalysisCache,
        ctx: &CompilerContext,
    ) -> Result<bool> {
        if let Err(error) = validate(&function.body) {
            ctx.events
                .record(EventKind::Error)
                .function(function.name())
                .pass(self.name())
                .message(format!("{}: {}", self.label, error));
            return Err(error);
        }

        ctx.events
            .record(EventKind::FunctionValidated)
            .function(function.name())
            .pass(self.name())
            .message(self.label);
        Ok(false)
    }

    fn invalidates(&self) -> AnalysisSet {
        AnalysisSet::empty()
    }

    fn description(&self) -> &'static str {
        "Checks SSA invariants and aborts the function on a violation"
    }
}
