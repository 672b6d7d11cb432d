//! Compiler context shared by every pass.
//!
//! The [`CompilerContext`] owns all functions of the program being optimized,
//! the builtin lookup service and the [`EventLog`]. Every collection uses a
//! thread-safe type so that the scheduler can process functions in parallel:
//! a worker removes a function from the map, rewrites it without holding any
//! lock, and reinserts it. No function is ever visible to two workers.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::{DashMap, DashSet};

use crate::{
    compiler::{
        events::EventLog,
        services::{BuiltinProvider, StandardBuiltins, TypedFunction},
    },
    Error, Result,
};

/// Shared state of one pipeline run.
pub struct CompilerContext {
    /// Functions by name (mutated in place by passes).
    pub functions: DashMap<String, TypedFunction>,

    /// Accumulated events from all passes.
    pub events: EventLog,

    /// Functions that at least one pass changed.
    pub changed_functions: DashSet<String>,

    builtins: Arc<dyn BuiltinProvider>,

    start_time: Instant,
}

impl Default for CompilerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerContext {
    /// Creates an empty context using [`StandardBuiltins`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_builtins(Arc::new(StandardBuiltins))
    }

    /// Creates an empty context with a custom builtin lookup service.
    #[must_use]
    pub fn with_builtins(builtins: Arc<dyn BuiltinProvider>) -> Self {
        Self {
            functions: DashMap::new(),
            events: EventLog::new(),
            changed_functions: DashSet::new(),
            builtins,
            start_time: Instant::now(),
        }
    }

    /// The builtin lookup service.
    #[must_use]
    pub fn builtins(&self) -> &dyn BuiltinProvider {
        self.builtins.as_ref()
    }

    /// Returns the elapsed time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Adds (or replaces) a function.
    pub fn add_function(&self, function: TypedFunction) {
        self.functions.insert(function.name().to_string(), function);
    }

    /// Returns `true` if a function named `name` exists.
    #[must_use]
    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Removes a function from the context.
    pub fn take_function(&self, name: &str) -> Option<TypedFunction> {
        self.functions.remove(name).map(|(_, f)| f)
    }

    /// Executes a closure with a reference to a function.
    pub fn with_function<R, F>(&self, name: &str, f: F) -> Option<R>
    where
        F: FnOnce(&TypedFunction) -> R,
    {
        self.functions.get(name).map(|r| f(&r))
    }

    /// Executes a closure with a mutable reference to a function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FunctionNotFound`] if no function is named `name`.
    pub fn with_function_mut<R, F>(&self, name: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut TypedFunction) -> R,
    {
        self.functions
            .get_mut(name)
            .map(|mut r| f(r.value_mut()))
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))
    }

    /// Names of all functions, sorted.
    #[must_use]
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of functions.
    #[must_use]
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Returns `true` if a pass changed `name`.
    #[must_use]
    pub fn was_changed(&self, name: &str) -> bool {
        self.changed_functions.contains(name)
    }
}
