//! Per-function cache of derived analyses.
//!
//! Every analysis in [`crate::analysis`] is a snapshot of the function it was
//! built from. Reading a snapshot after the function was rewritten is the
//! most dangerous bug a pass can have, so analyses are never stored by the
//! passes themselves. They live in an [`AnalysisCache`] owned by the
//! scheduler:
//!
//! - each slot carries a dirty flag;
//! - accessors rebuild a slot that is missing or dirty;
//! - passes declare, as an [`AnalysisSet`], which slots their rewrites
//!   invalidate, and the scheduler marks those slots dirty after every pass
//!   that reports a change.
//!
//! # Example
//!
//! ```rust,ignore
//! use matopt::compiler::{AnalysisCache, AnalysisSet};
//!
//! let mut cache = AnalysisCache::new();
//! let unused = cache.usages(&body).is_unused("x$1");
//! // ... rewrite body ...
//! cache.invalidate(AnalysisSet::USAGES);
//! ```

use bitflags::bitflags;

use crate::analysis::{
    DefUseIndex, FunctionBody, SizeGroupInformation, StructuredCfg, TypeProvider, UsageMap,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// A set of cached analyses.
    pub struct AnalysisSet: u32 {
        /// [`UsageMap`] and [`DefUseIndex`].
        const USAGES = 0x0001;
        /// [`StructuredCfg`].
        const CONTROL_FLOW = 0x0002;
        /// [`SizeGroupInformation`].
        const SIZE_GROUPS = 0x0004;
        /// Every cached analysis.
        const ALL = Self::USAGES.bits() | Self::CONTROL_FLOW.bits() | Self::SIZE_GROUPS.bits();
    }
}

impl Default for AnalysisSet {
    fn default() -> Self {
        AnalysisSet::ALL
    }
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    dirty: bool,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot {
            value: None,
            dirty: false,
        }
    }
}

impl<T> Slot<T> {
    fn get_or_build(&mut self, builds: &mut usize, build: impl FnOnce() -> T) -> &mut T {
        if self.dirty {
            self.value = None;
            self.dirty = false;
        }
        if self.value.is_none() {
            *builds += 1;
        }
        self.value.get_or_insert_with(build)
    }

    fn invalidate(&mut self) {
        self.dirty = true;
    }

    fn is_valid(&self) -> bool {
        !self.dirty && self.value.is_some()
    }
}

/// Lazily built analyses of one function.
#[derive(Debug, Default)]
pub struct AnalysisCache {
    usages: Slot<UsageMap>,
    def_use: Slot<DefUseIndex>,
    control_flow: Slot<StructuredCfg>,
    size_groups: Slot<SizeGroupInformation>,
    builds: usize,
}

impl AnalysisCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        AnalysisCache::default()
    }

    /// Usage counts of `body`.
    pub fn usages(&mut self, body: &FunctionBody) -> &UsageMap {
        self.usages
            .get_or_build(&mut self.builds, || UsageMap::build(body))
    }

    /// Definition and use sites of `body`.
    pub fn def_use(&mut self, body: &FunctionBody) -> &DefUseIndex {
        self.def_use
            .get_or_build(&mut self.builds, || DefUseIndex::build(body))
    }

    /// Control-flow relation of `body`.
    pub fn control_flow(&mut self, body: &FunctionBody) -> &StructuredCfg {
        self.control_flow
            .get_or_build(&mut self.builds, || StructuredCfg::build(body))
    }

    /// Size groups of `body`.
    ///
    /// The reference is mutable so that size-aware rewrites can teach the
    /// analysis their new instructions instead of forcing a rebuild.
    pub fn size_groups(
        &mut self,
        body: &FunctionBody,
        types: &dyn TypeProvider,
    ) -> &mut SizeGroupInformation {
        self.size_groups
            .get_or_build(&mut self.builds, || SizeGroupInformation::build(body, types))
    }

    /// Marks every analysis in `set` as stale.
    pub fn invalidate(&mut self, set: AnalysisSet) {
        if set.contains(AnalysisSet::USAGES) {
            self.usages.invalidate();
            self.def_use.invalidate();
        }
        if set.contains(AnalysisSet::CONTROL_FLOW) {
            self.control_flow.invalidate();
        }
        if set.contains(AnalysisSet::SIZE_GROUPS) {
            self.size_groups.invalidate();
        }
    }

    /// Analyses that are built and not stale.
    #[must_use]
    pub fn valid(&self) -> AnalysisSet {
        let mut set = AnalysisSet::empty();
        if self.usages.is_valid() || self.def_use.is_valid() {
            set |= AnalysisSet::USAGES;
        }
        if self.control_flow.is_valid() {
            set |= AnalysisSet::CONTROL_FLOW;
        }
        if self.size_groups.is_valid() {
            set |= AnalysisSet::SIZE_GROUPS;
        }
        set
    }

    /// Number of analyses built since the cache was created.
    #[must_use]
    pub fn builds(&self) -> usize {
        self.builds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{BlockId, Instruction, VariableTypes};

    fn body() -> FunctionBody {
        let mut body = FunctionBody::new("f");
        let entry = body.block_mut(BlockId::ENTRY).unwrap();
        entry.add_instruction(Instruction::assign_integer("a", 1));
        entry.add_instruction(Instruction::assign_variable("b", "a"));
        body
    }

    #[test]
    fn test_builds_once_until_invalidated() {
        let body = body();
        let mut cache = AnalysisCache::new();

        assert_eq!(cache.usages(&body).usage_count("a"), 1);
        assert_eq!(cache.usages(&body).usage_count("a"), 1);
        assert_eq!(cache.builds(), 1);
        assert_eq!(cache.valid(), AnalysisSet::USAGES);

        cache.invalidate(AnalysisSet::USAGES);
        assert!(cache.valid().is_empty());
        cache.usages(&body);
        assert_eq!(cache.builds(), 2);
    }

    #[test]
    fn test_invalidation_is_selective() {
        let body = body();
        let types = VariableTypes::new();
        let mut cache = AnalysisCache::new();

        cache.usages(&body);
        cache.control_flow(&body);
        cache.size_groups(&body, &types);
        cache.invalidate(AnalysisSet::SIZE_GROUPS);

        assert_eq!(
            cache.valid(),
            AnalysisSet::USAGES | AnalysisSet::CONTROL_FLOW
        );
    }

    #[test]
    fn test_stale_value_is_rebuilt() {
        let mut body = body();
        let mut cache = AnalysisCache::new();
        assert!(cache.usages(&body).is_unused("b"));

        body.block_mut(BlockId::ENTRY)
            .unwrap()
            .add_instruction(Instruction::assign_variable("c", "b"));
        cache.invalidate(AnalysisSet::default());

        assert!(!cache.usages(&body).is_unused("b"));
    }
}
