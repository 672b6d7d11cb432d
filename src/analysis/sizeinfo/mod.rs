//! Symbolic size-group analysis.
//!
//! Answers questions such as "are matrices `A` and `B` the same size?",
//! "is index `i` within the bounds of `A`?" or "is the number of elements of
//! `A` the value held by `n`?" without knowing any concrete size.
//!
//! # Architecture
//!
//! - [`ScalarValueInformation`] - equivalence groups of scalar names with
//!   optional constants, plus order facts between them
//! - [`SizeGroupInformation`] - groups of matrices sharing a symbolic size,
//!   with the scalars holding each group's element count and dimensions
//! - [`SizeGroupBuilder`] - walks a function body and accumulates the facts
//!
//! # Usage
//!
//! ```rust,ignore
//! use matopt::analysis::SizeGroupInformation;
//!
//! let mut info = SizeGroupInformation::build(&body, &types);
//! if info.are_same_size("A$1", "B$1") {
//!     // A$1 and B$1 can share a loop
//! }
//! let numel = info.get_numel_result("A$1");
//! assert!(info.are_same_value(&numel, "n$1"));
//! ```
//!
//! Names starting with `#` are *meta names*: scalars minted by the analysis
//! for sizes no program variable holds. They never appear in the IR.

mod builder;
mod groups;
mod scalar;

pub use builder::SizeGroupBuilder;
pub use groups::SizeGroupInformation;
pub use scalar::ScalarValueInformation;
