//! What the pipeline did, as data.
//!
//! Passes report through the context's [`EventLog`] instead of printing. A
//! fused loop, a rejected interchange or a failed validation each become one
//! [`Event`]. The log is write-only from the pipeline's point of view: no
//! pass consults it, so removing every event changes no output.
//!
//! Workers append concurrently through `&EventLog`; the backing `boxcar`
//! vector needs no lock.
//!
//! ```rust,ignore
//! ctx.events
//!     .record(EventKind::InterchangeRejected)
//!     .at("kernel", 2)
//!     .pass("loop_interchange")
//!     .message("access order is not a permutation");
//! ```

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use strum::{EnumCount, EnumIter, IntoEnumIterator, IntoStaticStr};

/// Broad grouping of [`EventKind`]s, used when summarizing a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    /// The program was rewritten.
    Transformation,
    /// A rewrite was considered and found illegal.
    Rejection,
    /// Bookkeeping by the scheduler or the validator.
    Engine,
    /// Something went wrong or looked suspicious.
    Diagnostic,
}

/// What an [`Event`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, IntoStaticStr)]
pub enum EventKind {
    /// Two adjacent loops or loop nests now share one header.
    LoopFused,
    /// The headers of a perfect nest were reordered.
    LoopInterchanged,
    /// An instruction with no live outputs was dropped.
    InstructionEliminated,
    /// A `colon` call became an explicit loop or assignment.
    ColonEliminated,
    /// An `A(:)` became an alias or a linear copy loop.
    FlattenEliminated,
    /// A `zeros`/`ones` allocation stopped initializing its elements.
    AllocationSimplified,

    /// A fusion candidate failed a legality check.
    FusionRejected,
    /// An interchange candidate failed a legality check.
    InterchangeRejected,

    /// A function passed SSA validation.
    FunctionValidated,
    /// A pass changed a function.
    PassCompleted,

    /// Recoverable anomaly, such as a pipeline that never settled.
    Warning,
    /// A check failed.
    Error,
}

impl EventKind {
    /// The category this kind is summarized under.
    #[must_use]
    pub fn category(self) -> EventCategory {
        match self {
            Self::LoopFused
            | Self::LoopInterchanged
            | Self::InstructionEliminated
            | Self::ColonEliminated
            | Self::FlattenEliminated
            | Self::AllocationSimplified => EventCategory::Transformation,
            Self::FusionRejected | Self::InterchangeRejected => EventCategory::Rejection,
            Self::FunctionValidated | Self::PassCompleted => EventCategory::Engine,
            Self::Warning | Self::Error => EventCategory::Diagnostic,
        }
    }

    /// True for kinds that record a rewrite of the program.
    #[must_use]
    pub fn is_transformation(self) -> bool {
        self.category() == EventCategory::Transformation
    }

    /// Lower-case label, also used as the default event message.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::LoopFused => "loop fused",
            Self::LoopInterchanged => "loop interchanged",
            Self::InstructionEliminated => "instruction eliminated",
            Self::ColonEliminated => "colon eliminated",
            Self::FlattenEliminated => "flatten eliminated",
            Self::AllocationSimplified => "allocation simplified",
            Self::FusionRejected => "fusion rejected",
            Self::InterchangeRejected => "interchange rejected",
            Self::FunctionValidated => "function validated",
            Self::PassCompleted => "pass completed",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One entry of an [`EventLog`].
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Function concerned, if any.
    pub function: Option<String>,
    /// Block index inside `function`.
    pub location: Option<usize>,
    /// Free-form detail. Defaults to the kind's label.
    pub message: String,
    /// Name of the reporting pass.
    pub pass: Option<String>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.kind)?;
        if let Some(function) = &self.function {
            f.write_str(function)?;
            if let Some(block) = self.location {
                write!(f, "#{block}")?;
            }
            f.write_str(": ")?;
        }
        f.write_str(&self.message)
    }
}

/// Pending event returned by [`EventLog::record`].
///
/// Nothing is stored until the builder goes out of scope, so a bare
/// `log.record(kind);` statement records an event with default fields.
pub struct EventBuilder<'a> {
    log: &'a EventLog,
    event: Event,
}

impl EventBuilder<'_> {
    /// Attaches the event to block `block` of `function`.
    pub fn at(mut self, function: impl Into<String>, block: usize) -> Self {
        self.event.function = Some(function.into());
        self.event.location = Some(block);
        self
    }

    /// Attaches the event to `function` as a whole.
    pub fn function(mut self, function: impl Into<String>) -> Self {
        self.event.function = Some(function.into());
        self
    }

    /// Replaces the default message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.event.message = message.into();
        self
    }

    /// Names the reporting pass.
    pub fn pass(mut self, name: impl Into<String>) -> Self {
        self.event.pass = Some(name.into());
        self
    }
}

impl Drop for EventBuilder<'_> {
    fn drop(&mut self) {
        let event = Event {
            kind: self.event.kind,
            function: self.event.function.take(),
            location: self.event.location,
            message: std::mem::take(&mut self.event.message),
            pass: self.event.pass.take(),
        };
        self.log.events.push(event);
    }
}

/// Append-only record of everything the pipeline reported.
#[derive(Debug)]
pub struct EventLog {
    events: boxcar::Vec<Event>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventLog {
    fn clone(&self) -> Self {
        let copy = Self::new();
        for event in self.iter() {
            copy.events.push(event.clone());
        }
        copy
    }
}

impl EventLog {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: boxcar::Vec::new(),
        }
    }

    /// True until the first event is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.count()
    }

    /// Starts an event of `kind`; see [`EventBuilder`].
    pub fn record(&self, kind: EventKind) -> EventBuilder<'_> {
        EventBuilder {
            log: self,
            event: Event {
                kind,
                function: None,
                location: None,
                message: kind.label().to_string(),
                pass: None,
            },
        }
    }

    /// Events in the order they were recorded.
    ///
    /// Events from different functions interleave nondeterministically when
    /// the scheduler runs functions in parallel.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|(_, event)| event)
    }

    /// Whether an event of `kind` was recorded.
    #[must_use]
    pub fn has(&self, kind: EventKind) -> bool {
        self.iter().any(|event| event.kind == kind)
    }

    /// Whether an event of any of `kinds` was recorded.
    #[must_use]
    pub fn has_any(&self, kinds: &[EventKind]) -> bool {
        self.iter().any(|event| kinds.contains(&event.kind))
    }

    /// Number of events of `kind`.
    #[must_use]
    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.iter().filter(|event| event.kind == kind).count()
    }

    /// Events attached to `function`.
    pub fn filter_function<'a>(&'a self, function: &'a str) -> impl Iterator<Item = &'a Event> {
        self.iter()
            .filter(move |event| event.function.as_deref() == Some(function))
    }

    /// Events that record a rewrite.
    pub fn transformations(&self) -> impl Iterator<Item = &Event> {
        self.iter().filter(|event| event.kind.is_transformation())
    }

    /// Number of rewrites recorded.
    #[must_use]
    pub fn transformation_count(&self) -> usize {
        self.transformations().count()
    }

    /// [`EventKind::Error`] events.
    pub fn errors(&self) -> impl Iterator<Item = &Event> {
        self.iter().filter(|event| event.kind == EventKind::Error)
    }

    /// Event counts per kind. Kinds never recorded are absent.
    #[must_use]
    pub fn count_by_kind(&self) -> HashMap<EventKind, usize> {
        self.iter().fold(HashMap::new(), |mut counts, event| {
            *counts.entry(event.kind).or_default() += 1;
            counts
        })
    }

    /// Number of distinct functions with at least one rewrite.
    #[must_use]
    pub fn functions_affected(&self) -> usize {
        self.transformations()
            .filter_map(|event| event.function.as_deref())
            .collect::<HashSet<_>>()
            .len()
    }

    /// One line listing rewrite counts, e.g. `"2 loop fused, 1 colon eliminated"`.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "no events".to_string();
        }

        let counts = self.count_by_kind();
        let rewrites: Vec<String> = EventKind::iter()
            .filter(|kind| kind.is_transformation())
            .filter_map(|kind| counts.get(&kind).map(|n| format!("{n} {kind}")))
            .collect();

        if rewrites.is_empty() {
            format!("{} events, no rewrites", self.len())
        } else {
            rewrites.join(", ")
        }
    }
}

/// Counters computed from an [`EventLog`] after a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Functions with at least one rewrite.
    pub functions_transformed: usize,
    /// Event counts in [`EventKind`] declaration order.
    pub by_kind: [usize; EventKind::COUNT],
    /// Pipeline iterations run.
    pub iterations: usize,
    /// Wall-clock time.
    pub total_time: Duration,
}

impl PipelineStats {
    /// Counts the events of `log`. Iterations and time are left at zero.
    #[must_use]
    pub fn from_log(log: &EventLog) -> Self {
        let mut by_kind = [0; EventKind::COUNT];
        for event in log.iter() {
            by_kind[event.kind as usize] += 1;
        }
        Self {
            functions_transformed: log.functions_affected(),
            by_kind,
            ..Self::default()
        }
    }

    /// Number of events of `kind`.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.by_kind[kind as usize]
    }

    /// Sets [`total_time`](Self::total_time).
    #[must_use]
    pub fn with_time(mut self, time: Duration) -> Self {
        self.total_time = time;
        self
    }

    /// Sets [`iterations`](Self::iterations).
    #[must_use]
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Rewrites, rejections and diagnostics as one line.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.functions_transformed > 0 {
            parts.push(format!("{} functions", self.functions_transformed));
        }

        for kind in EventKind::iter() {
            let count = self.count(kind);
            if count == 0 || kind.category() == EventCategory::Engine {
                continue;
            }
            let name: &'static str = kind.into();
            parts.push(format!("{count} {name}"));
        }

        let mut line = if parts.is_empty() {
            "no transformations".to_string()
        } else {
            parts.join(", ")
        };
        if !self.total_time.is_zero() {
            line.push_str(&format!(
                " in {:?} ({} iterations)",
                self.total_time, self.iterations
            ));
        }
        line
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_log() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert!(!log.has(EventKind::LoopFused));
        assert_eq!(log.summary(), "no events");
    }

    #[test]
    fn test_record_event() {
        let log = EventLog::new();
        log.record(EventKind::LoopFused)
            .at("kernel", 3)
            .message("fused #3 and #5");

        assert_eq!(log.len(), 1);
        let event = log.iter().next().unwrap();
        assert_eq!(event.function.as_deref(), Some("kernel"));
        assert_eq!(event.location, Some(3));
        assert_eq!(event.to_string(), "[loop fused] kernel#3: fused #3 and #5");
    }

    #[test]
    fn test_default_message() {
        let log = EventLog::new();
        log.record(EventKind::AllocationSimplified).function("f");
        log.record(EventKind::Warning);

        let events: Vec<String> = log.iter().map(ToString::to_string).collect();
        assert_eq!(
            events,
            ["[allocation simplified] f: allocation simplified", "[warning] warning"]
        );
    }

    #[test]
    fn test_categories() {
        let rewrites = EventKind::iter().filter(|k| k.is_transformation()).count();
        assert_eq!(rewrites, 6);
        assert_eq!(EventKind::FusionRejected.category(), EventCategory::Rejection);
        assert_eq!(EventKind::Error.category(), EventCategory::Diagnostic);
    }

    #[test]
    fn test_queries() {
        let log = EventLog::new();
        log.record(EventKind::LoopFused).at("f", 1);
        log.record(EventKind::LoopInterchanged).at("g", 1);
        log.record(EventKind::InstructionEliminated).at("f", 4);
        log.record(EventKind::Error).function("g");

        assert_eq!(log.filter_function("f").count(), 2);
        assert_eq!(log.functions_affected(), 2);
        assert_eq!(log.transformation_count(), 3);
        assert_eq!(log.errors().count(), 1);
        assert!(log.has_any(&[EventKind::FusionRejected, EventKind::Error]));
        assert!(!log.has_any(&[EventKind::FusionRejected]));
    }

    #[test]
    fn test_summary_in_declaration_order() {
        let log = EventLog::new();
        log.record(EventKind::AllocationSimplified).function("f");
        log.record(EventKind::LoopFused).function("f");
        log.record(EventKind::LoopFused).function("g");
        log.record(EventKind::FusionRejected).function("g");
        assert_eq!(log.summary(), "2 loop fused, 1 allocation simplified");

        let quiet = EventLog::new();
        quiet.record(EventKind::FunctionValidated);
        assert_eq!(quiet.summary(), "1 events, no rewrites");
    }

    #[test]
    fn test_pipeline_stats() {
        let log = EventLog::new();
        log.record(EventKind::LoopFused).function("f");
        log.record(EventKind::InterchangeRejected).function("g");
        log.record(EventKind::PassCompleted).function("f");
        log.record(EventKind::Warning);

        let stats = PipelineStats::from_log(&log).with_iterations(2);
        assert_eq!(stats.functions_transformed, 1);
        assert_eq!(stats.count(EventKind::LoopFused), 1);
        assert_eq!(stats.count(EventKind::PassCompleted), 1);
        assert_eq!(
            stats.to_string(),
            "1 functions, 1 LoopFused, 1 InterchangeRejected, 1 Warning"
        );

        let timed = stats.with_time(Duration::from_millis(5));
        assert!(timed.summary().ends_with("in 5ms (2 iterations)"));
    }

    #[test]
    fn test_clone_is_independent() {
        let log = EventLog::new();
        log.record(EventKind::FunctionValidated);
        let copy = log.clone();
        log.record(EventKind::FunctionValidated);
        assert_eq!(copy.len(), 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_concurrent_recording() {
        use std::{sync::Arc, thread};

        let log = Arc::new(EventLog::new());
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for block in 0..100 {
                        log.record(EventKind::InstructionEliminated)
                            .at(format!("f{worker}"), block);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(log.len(), 400);
        assert_eq!(log.functions_affected(), 4);
    }
}
