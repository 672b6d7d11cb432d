//! Compiler infrastructure for SSA-based code transformations.
//!
//! This module sits between type inference and the backend:
//!
//! - [`crate::analysis`] - program model, size groups, usages, validation
//! - [`compiler`](self) - editing primitives, passes and the pass pipeline
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Compiler Pipeline                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  CompilerContext              Shared state of one run            │
//! │    ├─ TypedFunctions          (body + variable types)            │
//! │    ├─ BuiltinProvider         (builtin output types)             │
//! │    └─ EventLog                                                   │
//! │                                                                  │
//! │  PassScheduler               Fixed-order fixpoint execution      │
//! │    ├─ Prologue                (initial validation)               │
//! │    ├─ Cleanup                 (DCE, colon, flatten, allocation)  │
//! │    ├─ Loops                   (interchange, fusion)              │
//! │    └─ Epilogue                (final validation)                 │
//! │    Functions run in parallel; each owns an AnalysisCache         │
//! │                                                                  │
//! │  SsaPass trait               Interface for all passes            │
//! │    ├─ run_on_function()       Per-function transformation        │
//! │    ├─ invalidates()           Analyses a change makes stale      │
//! │    └─ initialize()/finalize() Per-iteration hooks                │
//! │                                                                  │
//! │  Removal framework           "match, rewrite, rescan" drivers    │
//! │  BlockEditor                 Instruction/loop/branch emission    │
//! │  EventLog                    Change tracking and diagnostics     │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use matopt::compiler::{CompilerContext, PassScheduler, PipelineConfig};
//!
//! let ctx = CompilerContext::new();
//! ctx.add_function(function);
//!
//! let mut scheduler = PassScheduler::from_config(&PipelineConfig::default());
//! let changes = scheduler.run_pipeline(&ctx)?;
//! println!("{} ({} changes)", scheduler.stats(&ctx), changes);
//! ```

mod cache;
mod config;
mod context;
mod editor;
mod events;
mod pass;
mod passes;
mod removal;
mod scheduler;
mod services;

pub use cache::{AnalysisCache, AnalysisSet};
pub use config::{InterchangeFormatKind, PipelineConfig};
pub use context::CompilerContext;
pub use editor::{BlockEditor, BranchHandles, ForLoopHandles};
pub use events::{Event, EventBuilder, EventCategory, EventKind, EventLog, PipelineStats};
pub use pass::SsaPass;
pub use passes::{
    combine_loop_properties, describe_first_loop, AccessIndex, AllocationValueEliminationPass,
    ColonEliminationPass, ColumnMajorInterchangeFormat, DeadCodeEliminationPass,
    InterchangeFormat, LoopFusionPass, LoopInterchangePass, LoopLevel, LoopNestDescription,
    MatrixAccessPattern, MemoryInterchangeFormat, SsaValidatorPass,
    VerticalFlattenEliminationPass, SKIP_ALIASING, SKIP_ONLY_RELATED,
};
pub use removal::{
    Facts, InstructionRemovalPass, RemovalDriver, RemovalSite, SizeAwareInstructionRemovalPass,
    SizeAwareRemovalDriver, SizeInfoUpdate,
};
pub use scheduler::PassScheduler;
pub use services::{BuiltinProvider, FunctionSignature, StandardBuiltins, TypedFunction};
