//! # matopt Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the matopt library. Import this module to get quick access to everything needed
//! to build functions, run the pipeline and inspect what it did.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all matopt operations
pub use crate::Error;

/// The result type used throughout matopt
pub use crate::Result;

// ================================================================================================
// Program Model
// ================================================================================================

/// SSA program model
pub use crate::analysis::{
    BlockId, FunctionBody, FunctionProperties, Instruction, PhiNode, SsaBlock, TypeProvider,
    TypeShape, VariableType, VariableTypes,
};

/// SSA invariant checking
pub use crate::analysis::validate;

// ================================================================================================
// Analyses
// ================================================================================================

/// Analyses consulted by passes
pub use crate::analysis::{SizeGroupInformation, StructuredCfg, UsageMap};

// ================================================================================================
// Pipeline
// ================================================================================================

/// Pipeline configuration and execution
pub use crate::compiler::{
    AnalysisCache, AnalysisSet, CompilerContext, InterchangeFormatKind, PassScheduler,
    PipelineConfig, SsaPass, TypedFunction,
};

/// Diagnostics
pub use crate::compiler::{Event, EventCategory, EventKind, EventLog, PipelineStats};

/// Builtin services
pub use crate::compiler::{BuiltinProvider, StandardBuiltins};
