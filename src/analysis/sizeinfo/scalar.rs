//! Symbolic knowledge about scalar values.
//!
//! [`ScalarValueInformation`] partitions scalar variable names into
//! equivalence groups. Two names in the same group are known to hold the same
//! value at every point where both are defined. A group may additionally carry
//! a known constant.
//!
//! On top of the groups the oracle keeps a set of order facts
//! (`a <= b`, `a < b`) between names. They come from loop bounds, `assume`
//! instructions on comparisons, and `b = minus(a, c)` with `c` a known
//! positive constant.
//!
//! Everything the oracle cannot derive is "unknown": every query answers
//! `false` unless the fact is proven.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
};

use crate::analysis::ssa::is_side_effect_function;

/// Builtins whose calls are never merged by syntactic provenance even though
/// they have no declared side effect.
const NON_DETERMINISTIC_FUNCTIONS: &[&str] = &["rand", "randn", "randi", "tic", "toc", "clock"];

#[derive(Debug, Clone, Default)]
struct ScalarGroup {
    members: Vec<String>,
    constant: Option<f64>,
}

#[derive(Debug, Clone)]
struct OrderFact {
    lesser: String,
    greater: String,
    strict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Less,
    LessOrEqual,
    Equal,
}

#[derive(Debug, Clone)]
struct PureCall {
    function: String,
    inputs: Vec<String>,
    output: String,
}

/// A node in the order graph: either a group or a name no group knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Node<'a> {
    Group(usize),
    Free(&'a str),
}

/// Equivalence groups and order facts over scalar variables.
#[derive(Debug, Clone, Default)]
pub struct ScalarValueInformation {
    groups: Vec<ScalarGroup>,
    group_of: HashMap<String, usize>,
    known_constants: HashMap<String, f64>,
    facts: Vec<OrderFact>,
    calls: Vec<PureCall>,
    comparisons: HashMap<String, (Comparison, String, String)>,
}

impl ScalarValueInformation {
    /// Creates an oracle that knows nothing.
    #[must_use]
    pub fn new() -> Self {
        ScalarValueInformation::default()
    }

    /// Records the statically inferred constant of `name`.
    pub fn learn_constant(&mut self, name: &str, value: f64) {
        self.known_constants.insert(name.to_string(), value);
        if let Some(&group) = self.group_of.get(name) {
            self.groups[group].constant.get_or_insert(value);
        }
    }

    fn group_or_create(&mut self, name: &str) -> usize {
        if let Some(&group) = self.group_of.get(name) {
            return group;
        }
        let id = self.groups.len();
        self.groups.push(ScalarGroup {
            members: vec![name.to_string()],
            constant: self.known_constants.get(name).copied(),
        });
        self.group_of.insert(name.to_string(), id);
        id
    }

    fn node<'a>(&self, name: &'a str) -> Node<'a> {
        match self.group_of.get(name) {
            Some(&group) => Node::Group(group),
            None => Node::Free(name),
        }
    }

    fn node_constant(&self, node: Node<'_>) -> Option<f64> {
        match node {
            Node::Group(group) => self.groups[group].constant,
            Node::Free(name) => self.known_constants.get(name).copied(),
        }
    }

    /// Known constant value of `name`.
    #[must_use]
    pub fn constant_of(&self, name: &str) -> Option<f64> {
        self.node_constant(self.node(name))
    }

    /// States that `a` and `b` hold the same value.
    ///
    /// If both groups carry different constants the first one is kept; this
    /// can only happen on unreachable code.
    pub fn add_alias(&mut self, a: &str, b: &str) {
        let ga = self.group_or_create(a);
        let gb = self.group_or_create(b);
        if ga == gb {
            return;
        }

        let (keep, merge) = if self.groups[ga].members.len() >= self.groups[gb].members.len() {
            (ga, gb)
        } else {
            (gb, ga)
        };
        let merged = std::mem::take(&mut self.groups[merge]);
        for member in &merged.members {
            self.group_of.insert(member.clone(), keep);
        }
        let target = &mut self.groups[keep];
        target.members.extend(merged.members);
        if target.constant.is_none() {
            target.constant = merged.constant;
        }
    }

    /// Declares `output` to be a copy of `input`.
    pub fn build_scalar_copy(&mut self, output: &str, input: &str) {
        self.add_alias(input, output);
    }

    /// Declares that `name` holds `value`.
    pub fn specify_constant(&mut self, name: &str, value: f64) {
        let group = self.group_or_create(name);
        let slot = &mut self.groups[group].constant;
        debug_assert!(
            slot.is_none_or(|c| c == value),
            "redefining constant of {} from {:?} to {}",
            name,
            slot,
            value
        );
        slot.get_or_insert(value);
    }

    /// Records `value <= maximum`.
    pub fn set_up_to(&mut self, value: &str, maximum: &str) {
        self.facts.push(OrderFact {
            lesser: value.to_string(),
            greater: maximum.to_string(),
            strict: false,
        });
    }

    /// Records `value >= minimum`.
    pub fn set_at_least(&mut self, value: &str, minimum: &str) {
        self.set_up_to(minimum, value);
    }

    /// Records `lesser < greater`.
    pub fn set_strictly_less(&mut self, lesser: &str, greater: &str) {
        self.facts.push(OrderFact {
            lesser: lesser.to_string(),
            greater: greater.to_string(),
            strict: true,
        });
    }

    /// Declares that the logical `condition` holds.
    ///
    /// Only conditions produced by a recorded comparison call contribute
    /// facts.
    pub fn set_true(&mut self, condition: &str) {
        let Some((comparison, lhs, rhs)) = self.comparisons.get(condition).cloned() else {
            return;
        };
        match comparison {
            Comparison::Less => self.set_strictly_less(&lhs, &rhs),
            Comparison::LessOrEqual => self.set_up_to(&lhs, &rhs),
            Comparison::Equal => self.add_alias(&lhs, &rhs),
        }
    }

    /// Declares `size` to be the number of elements of `start:end`.
    pub fn set_range_size(&mut self, size: &str, start: &str, end: &str) {
        if let (Some(s), Some(e)) = (self.constant_of(start), self.constant_of(end)) {
            self.specify_constant(size, (e - s + 1.0).floor().max(0.0));
            return;
        }
        self.record_call("$range_size", &[start, end], size);
    }

    /// Learns from a call whose inputs are all scalars.
    ///
    /// Recognized derivations:
    ///
    /// - constant folding of `plus`, `minus`, `times` and `uminus`;
    /// - additive and multiplicative identities (`plus(a, 0)`, `times(a, 1)`);
    /// - `minus(a, c)` with `c > 0` is strictly smaller than `a`;
    /// - comparisons (`lt`, `le`, `gt`, `ge`, `eq`) for later [`set_true`];
    /// - identical pure calls over same-valued inputs yield the same value.
    ///
    /// [`set_true`]: ScalarValueInformation::set_true
    pub fn add_scalar_function_call(&mut self, function: &str, inputs: &[&str], outputs: &[&str]) {
        let [output] = outputs else {
            return;
        };

        match (function, inputs) {
            ("lt", [a, b]) => self.record_comparison(output, Comparison::Less, a, b),
            ("le", [a, b]) => self.record_comparison(output, Comparison::LessOrEqual, a, b),
            ("gt", [a, b]) => self.record_comparison(output, Comparison::Less, b, a),
            ("ge", [a, b]) => self.record_comparison(output, Comparison::LessOrEqual, b, a),
            ("eq", [a, b]) => self.record_comparison(output, Comparison::Equal, a, b),
            _ => {}
        }

        let constants: Option<Vec<f64>> = inputs.iter().map(|i| self.constant_of(i)).collect();
        if let Some(constants) = constants {
            let folded = match (function, constants.as_slice()) {
                ("plus", [a, b]) => Some(a + b),
                ("minus", [a, b]) => Some(a - b),
                ("times", [a, b]) => Some(a * b),
                ("uminus", [a]) => Some(-a),
                _ => None,
            };
            if let Some(value) = folded {
                self.specify_constant(output, value);
            }
        }

        match (function, inputs) {
            ("plus", [a, b]) => {
                if self.is_known_equal(b, 0.0) {
                    self.add_alias(a, output);
                } else if self.is_known_equal(a, 0.0) {
                    self.add_alias(b, output);
                }
            }
            ("minus", [a, b]) => {
                if self.is_known_equal(b, 0.0) {
                    self.add_alias(a, output);
                } else if self.is_known_positive(b) {
                    self.set_strictly_less(output, a);
                }
            }
            ("times", [a, b]) => {
                if self.is_known_equal(b, 1.0) {
                    self.add_alias(a, output);
                } else if self.is_known_equal(a, 1.0) {
                    self.add_alias(b, output);
                }
            }
            _ => {}
        }

        if !is_side_effect_function(function) && !NON_DETERMINISTIC_FUNCTIONS.contains(&function) {
            self.record_call(function, inputs, output);
        }
    }

    fn record_comparison(&mut self, output: &str, comparison: Comparison, lhs: &str, rhs: &str) {
        self.comparisons.insert(
            output.to_string(),
            (comparison, lhs.to_string(), rhs.to_string()),
        );
    }

    fn record_call(&mut self, function: &str, inputs: &[&str], output: &str) {
        let previous = self
            .calls
            .iter()
            .find(|call| {
                call.function == function
                    && call.inputs.len() == inputs.len()
                    && call
                        .inputs
                        .iter()
                        .zip(inputs)
                        .all(|(a, b)| self.are_same_value(a, b))
            })
            .map(|call| call.output.clone());

        match previous {
            Some(previous) => self.add_alias(&previous, output),
            None => self.calls.push(PureCall {
                function: function.to_string(),
                inputs: inputs.iter().map(|i| (*i).to_string()).collect(),
                output: output.to_string(),
            }),
        }
    }

    /// Returns `true` if `a` and `b` are known to hold the same value.
    #[must_use]
    pub fn are_same_value(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        let (na, nb) = (self.node(a), self.node(b));
        if na == nb {
            return true;
        }
        match (self.node_constant(na), self.node_constant(nb)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// Returns `true` if `name` is known to equal `value`.
    #[must_use]
    pub fn is_known_equal(&self, name: &str, value: f64) -> bool {
        self.constant_of(name) == Some(value)
    }

    /// Returns `true` if `name` is known to differ from `value`.
    #[must_use]
    pub fn is_known_not_equal(&self, name: &str, value: f64) -> bool {
        self.constant_of(name).is_some_and(|c| c != value)
    }

    /// Returns `true` if `name` is known to be strictly positive.
    #[must_use]
    pub fn is_known_positive(&self, name: &str) -> bool {
        self.constant_of(name).is_some_and(|c| c > 0.0)
    }

    /// Returns `true` if `name` is known to be strictly negative.
    #[must_use]
    pub fn is_known_negative(&self, name: &str) -> bool {
        self.constant_of(name).is_some_and(|c| c < 0.0)
    }

    /// Returns `true` if `a <= b` is proven.
    #[must_use]
    pub fn is_known_less_or_equal(&self, a: &str, b: &str) -> bool {
        self.are_same_value(a, b) || self.order(a, b).is_some()
    }

    /// Returns `true` if `a < b` is proven.
    #[must_use]
    pub fn is_known_less_than(&self, a: &str, b: &str) -> bool {
        self.order(a, b) == Some(true)
    }

    /// Returns `true` if `a > b` is proven.
    #[must_use]
    pub fn is_known_greater_than(&self, a: &str, b: &str) -> bool {
        self.is_known_less_than(b, a)
    }

    /// Searches the order graph from `a` towards `b`.
    ///
    /// Returns `Some(true)` if `a < b` is proven, `Some(false)` if only
    /// `a <= b` is, and `None` otherwise.
    fn order(&self, a: &str, b: &str) -> Option<bool> {
        let target = self.node(b);
        let target_constant = self.node_constant(target);

        let mut best = None;
        let mut visited = HashSet::new();
        let mut pending = VecDeque::from([(self.node(a), false)]);

        while let Some((node, strict)) = pending.pop_front() {
            if !visited.insert((node, strict)) {
                continue;
            }

            if node == target {
                best = Some(best.unwrap_or(false) || strict);
            }
            if let (Some(value), Some(bound)) = (self.node_constant(node), target_constant) {
                if value < bound {
                    return Some(true);
                }
                if value <= bound {
                    best = Some(best.unwrap_or(false) || strict);
                }
            }
            if best == Some(true) {
                return best;
            }

            for fact in &self.facts {
                if self.node(&fact.lesser) == node {
                    pending.push_back((self.node(&fact.greater), strict || fact.strict));
                }
            }
        }

        best
    }
}

impl fmt::Display for ScalarValueInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[scalars")?;
        for group in self.groups.iter().filter(|g| !g.members.is_empty()) {
            write!(f, " {{{}}}", group.members.join(", "))?;
            if let Some(constant) = group.constant {
                write!(f, "={}", constant)?;
            }
        }
        for fact in &self.facts {
            let op = if fact.strict { "<" } else { "<=" };
            write!(f, " {}{}{}", fact.lesser, op, fact.greater)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_is_transitive() {
        let mut info = ScalarValueInformation::new();
        info.add_alias("a", "b");
        info.add_alias("c", "b");
        assert!(info.are_same_value("a", "c"));
        assert!(!info.are_same_value("a", "d"));
    }

    #[test]
    fn test_constants_compare_by_value() {
        let mut info = ScalarValueInformation::new();
        info.learn_constant("one", 1.0);
        info.specify_constant("k", 1.0);
        assert!(info.are_same_value("one", "k"));
        assert!(info.is_known_equal("k", 1.0));
        assert!(info.is_known_not_equal("k", 0.0));
    }

    #[test]
    fn test_constant_folding() {
        let mut info = ScalarValueInformation::new();
        info.specify_constant("a", 3.0);
        info.specify_constant("b", 4.0);
        info.add_scalar_function_call("times", &["a", "b"], &["c"]);
        info.add_scalar_function_call("uminus", &["c"], &["d"]);
        assert!(info.is_known_equal("c", 12.0));
        assert!(info.is_known_equal("d", -12.0));
    }

    #[test]
    fn test_identical_calls_share_value() {
        let mut info = ScalarValueInformation::new();
        info.add_alias("n", "m");
        info.add_scalar_function_call("fix", &["n"], &["a"]);
        info.add_scalar_function_call("fix", &["m"], &["b"]);
        assert!(info.are_same_value("a", "b"));

        info.add_scalar_function_call("rand", &["n"], &["r1"]);
        info.add_scalar_function_call("rand", &["n"], &["r2"]);
        assert!(!info.are_same_value("r1", "r2"));
    }

    #[test]
    fn test_minus_positive_constant_is_strictly_less() {
        let mut info = ScalarValueInformation::new();
        info.specify_constant("one", 1.0);
        info.add_scalar_function_call("minus", &["n", "one"], &["m"]);
        assert!(info.is_known_less_than("m", "n"));
        assert!(info.is_known_less_or_equal("m", "n"));
        assert!(!info.is_known_less_than("n", "m"));
        // plus is not recognized
        info.add_scalar_function_call("plus", &["n", "one"], &["p"]);
        assert!(!info.is_known_less_than("n", "p"));
    }

    #[test]
    fn test_upper_bound_chain() {
        let mut info = ScalarValueInformation::new();
        info.set_up_to("i", "n");
        info.add_alias("n", "numel");
        assert!(info.is_known_less_or_equal("i", "numel"));
        assert!(!info.is_known_less_than("i", "numel"));
        assert!(!info.are_same_value("i", "n"));
    }

    #[test]
    fn test_assume_comparison() {
        let mut info = ScalarValueInformation::new();
        info.add_scalar_function_call("lt", &["a", "b"], &["c"]);
        assert!(!info.is_known_less_than("a", "b"));
        info.set_true("c");
        assert!(info.is_known_less_than("a", "b"));
    }

    #[test]
    fn test_range_size() {
        let mut info = ScalarValueInformation::new();
        info.specify_constant("s", 2.0);
        info.specify_constant("e", 5.0);
        info.set_range_size("n", "s", "e");
        assert!(info.is_known_equal("n", 4.0));

        info.set_range_size("r1", "s", "x");
        info.set_range_size("r2", "s", "x");
        assert!(info.are_same_value("r1", "r2"));
    }

    #[test]
    fn test_copy_is_independent() {
        let mut info = ScalarValueInformation::new();
        info.add_alias("a", "b");
        let mut copy = info.clone();
        copy.add_alias("b", "c");
        assert!(copy.are_same_value("a", "c"));
        assert!(!info.are_same_value("a", "c"));
    }
}
