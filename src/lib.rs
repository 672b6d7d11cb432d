// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! # matopt
//!
//! The optimizing middle-end of a MATLAB-to-native compiler. After the front
//! end has parsed a program and type inference has produced a typed SSA form
//! of each function, `matopt` rewrites that form before the backend lowers
//! it to native code:
//!
//! - high-level array operations (`colon`, `A(:)`) become explicit loops;
//! - allocations whose initial values are never observed stop initializing;
//! - perfectly nested loops are reordered to walk memory in storage order;
//! - adjacent loops over the same iteration space are fused.
//!
//! ## Quick Start
//!
//! ```rust
//! use matopt::prelude::*;
//! use matopt::testing::FunctionBuilder;
//!
//! let ctx = CompilerContext::new();
//! ctx.add_function(FunctionBuilder::two_fill_loops("kernel", false));
//!
//! let mut scheduler = PassScheduler::from_config(&PipelineConfig::default());
//! let changes = scheduler.run_pipeline(&ctx)?;
//! assert!(changes > 0);
//! assert!(ctx.events.has(EventKind::LoopFused));
//! # Ok::<(), matopt::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`analysis`] - the SSA program model and the analyses passes consult:
//!   usage counts, the control-flow relation, conventional loop variables
//!   and symbolic size groups. [`analysis::validate`] checks the SSA
//!   invariants.
//! - [`compiler`] - the block editor, the removal framework, the passes,
//!   the per-function analysis cache and the [`PassScheduler`](compiler::PassScheduler).
//!
//! The program model is owned by the pipeline. Every pass mutates one
//! function at a time in place; functions are processed in parallel.
//!
//! ## Error Handling
//!
//! Optimization non-applicability is never an error: a pass that cannot
//! prove a rewrite legal simply leaves the function alone and may record a
//! `*Rejected` event. [`Error`] is reserved for corrupt IR, which aborts the
//! function and propagates to the caller of the pipeline.
//!
//! ## Testing
//!
//! [`testing::FunctionBuilder`] builds small typed functions block by block
//! and provides the fixtures the unit tests, integration tests and benches
//! share.

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use matopt::prelude::*;
///
/// let config = PipelineConfig::minimal();
/// let scheduler = PassScheduler::from_config(&config);
/// assert!(!scheduler.pass_names().is_empty());
/// ```
pub mod prelude;

/// SSA program model and analyses.
pub mod analysis;

/// Passes, pass infrastructure and the pass pipeline.
pub mod compiler;

/// Function fixtures for tests and benchmarks.
pub mod testing;

/// `matopt` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `matopt` Error type
///
/// The single error type of this crate. Every variant describes corrupt IR or
/// a broken pipeline invariant.
pub use error::Error;
