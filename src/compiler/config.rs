//! Configuration for the optimization pipeline.
//!
//! [`PipelineConfig`] selects which passes run and bounds the scheduler's
//! fixpoint loops. Function-level switches (for example "assume indices in
//! range") are not configured here; they travel with each function as
//! [`FunctionProperties`](crate::analysis::FunctionProperties).

/// Access-order convention used by loop interchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterchangeFormatKind {
    /// The last subscript of an access varies fastest; it gets the
    /// innermost loop.
    #[default]
    Memory,
    /// The first subscript of an access varies fastest (column-major
    /// storage); it gets the innermost loop.
    ColumnMajor,
}

/// Configuration of the pass pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum iterations of the whole pipeline (default: 4).
    pub max_iterations: usize,

    /// Number of unchanged iterations before stopping (default: 1).
    pub stable_iterations: usize,

    /// Maximum runs of one pass on one function in a single iteration
    /// (default: 16).
    pub max_phase_iterations: usize,

    /// Run the SSA validator between pass groups (default: true).
    pub validate_between_passes: bool,

    /// Enable dead code elimination.
    pub enable_dead_code_elimination: bool,

    /// Enable colon elimination.
    pub enable_colon_elimination: bool,

    /// Enable vertical flatten elimination.
    pub enable_flatten_elimination: bool,

    /// Enable allocation value elimination.
    pub enable_allocation_value_elimination: bool,

    /// Enable loop interchange.
    pub enable_loop_interchange: bool,

    /// Enable loop fusion.
    pub enable_loop_fusion: bool,

    /// Access-order convention for loop interchange.
    pub interchange_format: InterchangeFormatKind,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 4,
            stable_iterations: 1,
            max_phase_iterations: 16,
            validate_between_passes: true,
            enable_dead_code_elimination: true,
            enable_colon_elimination: true,
            enable_flatten_elimination: true,
            enable_allocation_value_elimination: true,
            enable_loop_interchange: true,
            enable_loop_fusion: true,
            interchange_format: InterchangeFormatKind::Memory,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration that only cleans up.
    ///
    /// Dead code elimination and validation run; every rewrite that changes
    /// loops or allocations is disabled.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            max_iterations: 1,
            enable_colon_elimination: false,
            enable_flatten_elimination: false,
            enable_allocation_value_elimination: false,
            enable_loop_interchange: false,
            enable_loop_fusion: false,
            ..Self::default()
        }
    }

    /// Creates a configuration that iterates longer.
    ///
    /// This configuration uses:
    /// - More pipeline iterations (16 max)
    /// - Two stable iterations before stopping
    /// - No intermediate validation (the final validation still runs)
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            max_iterations: 16,
            stable_iterations: 2,
            max_phase_iterations: 64,
            validate_between_passes: false,
            ..Self::default()
        }
    }

    /// Sets the maximum number of pipeline iterations.
    ///
    /// # Arguments
    ///
    /// * `max` - The maximum number of iterations.
    ///
    /// # Returns
    ///
    /// The modified configuration (builder pattern).
    #[must_use]
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Selects the access-order convention of loop interchange.
    #[must_use]
    pub fn with_interchange_format(mut self, format: InterchangeFormatKind) -> Self {
        self.interchange_format = format;
        self
    }

    /// Enables or disables both loop transformations.
    #[must_use]
    pub fn with_loop_transforms(mut self, enable: bool) -> Self {
        self.enable_loop_interchange = enable;
        self.enable_loop_fusion = enable;
        self
    }

    /// Returns true if any rewriting pass besides dead code elimination is
    /// enabled.
    #[must_use]
    pub fn any_rewrites_enabled(&self) -> bool {
        self.enable_colon_elimination
            || self.enable_flatten_elimination
            || self.enable_allocation_value_elimination
            || self.enable_loop_interchange
            || self.enable_loop_fusion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let minimal = PipelineConfig::minimal();
        assert!(minimal.enable_dead_code_elimination);
        assert!(!minimal.any_rewrites_enabled());

        let aggressive = PipelineConfig::aggressive();
        assert!(aggressive.max_iterations > PipelineConfig::default().max_iterations);
        assert!(aggressive.any_rewrites_enabled());
    }

    #[test]
    fn test_builders() {
        let config = PipelineConfig::new()
            .with_max_iterations(2)
            .with_loop_transforms(false)
            .with_interchange_format(InterchangeFormatKind::ColumnMajor);
        assert_eq!(config.max_iterations, 2);
        assert!(!config.enable_loop_fusion);
        assert_eq!(config.interchange_format, InterchangeFormatKind::ColumnMajor);
    }
}
