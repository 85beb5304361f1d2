//! Selector expressions.
//!
//! A selector is a boolean predicate over message properties, independent of
//! topic. The matching engine treats the parser and evaluator as a
//! collaborator behind [`SelectorParser`]; [`SqlSelectorParser`] is the
//! in-process default and understands a SQL-92 style subset:
//!
//! ```text
//! priority > 4 AND (region = 'emea' OR region IN ('apac', 'amer'))
//! name LIKE 'ord\_%' ESCAPE '\' AND NOT archived AND qty BETWEEN 1 AND 10
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SyntaxError;
use crate::value::Value;

/// Disjunctive-normal-form expansion.
pub mod dnf;
/// Three-valued evaluation against a message.
pub mod eval;
/// Default SQL-style parser.
pub mod parser;

pub use dnf::{to_conjunctions, MAX_CONJUNCTIONS};
pub use eval::{evaluate, EvalCache};
pub use parser::SqlSelectorParser;

/// Deepest group or `NOT` nesting [`SqlSelectorParser`] accepts.
pub const MAX_SELECTOR_DEPTH: usize = 64;

/// Deepest selector tree the engine will index or evaluate.
///
/// Evaluation and DNF expansion recurse over the tree, so anything deeper is
/// rejected as a syntax error at parse time.
pub const MAX_TREE_DEPTH: usize = 256;

/// The selector language a registration was written in.
///
/// `XPath1` selectors are never split into DNF conjunctions; see
/// [`to_conjunctions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorDomain {
    /// JMS message selectors.
    Jms,
    /// Selectors over bus message properties.
    #[default]
    SiMessage,
    /// XPath 1.0 over the message body; never split into conjunctions.
    XPath1,
}

/// Parses selector strings into trees.
pub trait SelectorParser: Send + Sync {
    /// Parses a selector string.
    fn parse(&self, selector: &str, domain: SelectorDomain) -> Result<Selector, SyntaxError>;
}

/// Comparison operators.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// The operator whose result is the negation of this one.
    #[must_use]
    pub const fn negate(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Lt => Self::Ge,
            Self::Le => Self::Gt,
            Self::Gt => Self::Le,
            Self::Ge => Self::Lt,
        }
    }

    const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// A message property reference.
///
/// `position` is assigned when the selector is resolved against a
/// [`PositionAssigner`] and lets [`EvalCache`] memoize lookups per search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    /// Property name as written.
    pub name: String,
    /// Evaluation-cache slot, once resolved.
    pub position: Option<usize>,
}

impl Identifier {
    /// Creates an unresolved identifier.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: None,
        }
    }
}

/// A compiled LIKE pattern.
#[derive(Debug, Clone)]
pub struct LikePattern {
    source: String,
    escape: Option<char>,
    regex: Regex,
}

impl LikePattern {
    /// Compiles a LIKE pattern: `%` matches any run, `_` any single character.
    pub fn new(source: &str, escape: Option<char>) -> Result<Self, String> {
        let mut re = String::from("(?s)^");
        let mut chars = source.chars();
        while let Some(c) = chars.next() {
            if Some(c) == escape {
                let Some(next) = chars.next() else {
                    return Err("escape character at end of LIKE pattern".to_string());
                };
                re.push_str(&regex::escape(&next.to_string()));
                continue;
            }
            match c {
                '%' => re.push_str(".*"),
                '_' => re.push('.'),
                other => re.push_str(&regex::escape(&other.to_string())),
            }
        }
        re.push('$');

        let regex = Regex::new(&re).map_err(|e| e.to_string())?;
        Ok(Self {
            source: source.to_string(),
            escape,
            regex,
        })
    }

    /// Returns true if the value matches the pattern.
    #[must_use]
    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.escape == other.escape
    }
}

/// A parsed selector tree.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Literal(Value),
    Identifier(Identifier),
    Compare {
        op: CompareOp,
        left: Box<Selector>,
        right: Box<Selector>,
    },
    IsNull {
        operand: Box<Selector>,
        negated: bool,
    },
    Like {
        operand: Box<Selector>,
        pattern: LikePattern,
        negated: bool,
    },
    In {
        operand: Box<Selector>,
        values: Vec<Value>,
        negated: bool,
    },
    Between {
        operand: Box<Selector>,
        low: Box<Selector>,
        high: Box<Selector>,
        negated: bool,
    },
    And(Box<Selector>, Box<Selector>),
    Or(Box<Selector>, Box<Selector>),
    Not(Box<Selector>),
}

impl Selector {
    /// Assigns evaluation-cache positions to every identifier in the tree.
    pub fn resolve(&mut self, assigner: &PositionAssigner) {
        match self {
            Self::Literal(_) => {}
            Self::Identifier(id) => id.position = Some(assigner.assign(&id.name)),
            Self::Compare { left, right, .. } => {
                left.resolve(assigner);
                right.resolve(assigner);
            }
            Self::IsNull { operand, .. }
            | Self::Like { operand, .. }
            | Self::In { operand, .. } => operand.resolve(assigner),
            Self::Between {
                operand, low, high, ..
            } => {
                operand.resolve(assigner);
                low.resolve(assigner);
                high.resolve(assigner);
            }
            Self::And(a, b) | Self::Or(a, b) => {
                a.resolve(assigner);
                b.resolve(assigner);
            }
            Self::Not(inner) => inner.resolve(assigner),
        }
    }

    /// Number of nodes on the longest root-to-leaf path.
    ///
    /// Walks the tree with an explicit stack, so it is safe on trees of any
    /// shape.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 1)];
        while let Some((node, level)) = stack.pop() {
            deepest = deepest.max(level);
            let below = level + 1;
            match node {
                Self::Literal(_) | Self::Identifier(_) => {}
                Self::IsNull { operand, .. }
                | Self::Like { operand, .. }
                | Self::In { operand, .. }
                | Self::Not(operand) => stack.push((&**operand, below)),
                Self::Compare { left, right, .. }
                | Self::And(left, right)
                | Self::Or(left, right) => {
                    stack.push((&**left, below));
                    stack.push((&**right, below));
                }
                Self::Between {
                    operand, low, high, ..
                } => {
                    stack.push((&**operand, below));
                    stack.push((&**low, below));
                    stack.push((&**high, below));
                }
            }
        }
        deepest
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let not = |negated: bool| if negated { "NOT " } else { "" };
        match self {
            Self::Literal(v) => write!(f, "{v}"),
            Self::Identifier(id) => f.write_str(&id.name),
            Self::Compare { op, left, right } => write!(f, "{left} {} {right}", op.symbol()),
            Self::IsNull { operand, negated } => {
                write!(f, "{operand} IS {}NULL", not(*negated))
            }
            Self::Like {
                operand,
                pattern,
                negated,
            } => {
                let source = Value::from(pattern.source.as_str());
                write!(f, "{operand} {}LIKE {source}", not(*negated))?;
                if let Some(esc) = pattern.escape {
                    write!(f, " ESCAPE {}", Value::from(esc.to_string()))?;
                }
                Ok(())
            }
            Self::In {
                operand,
                values,
                negated,
            } => {
                let list: Vec<String> = values.iter().map(ToString::to_string).collect();
                write!(f, "{operand} {}IN ({})", not(*negated), list.join(", "))
            }
            Self::Between {
                operand,
                low,
                high,
                negated,
            } => write!(f, "{operand} {}BETWEEN {low} AND {high}", not(*negated)),
            Self::And(a, b) => write!(f, "({a} AND {b})"),
            Self::Or(a, b) => write!(f, "({a} OR {b})"),
            Self::Not(inner) => write!(f, "NOT {inner}"),
        }
    }
}

/// Assigns stable ordinal positions to identifier names.
///
/// Shared by every registration in one index so that the same property name
/// always maps to the same [`EvalCache`] slot.
///
/// Positions are never reclaimed, even after the last selector naming an
/// identifier is removed: compiled conjunctions may still be held by a search
/// in flight. The map therefore holds one entry per distinct property name
/// ever registered, and an [`EvalCache`] grows to at most that many slots.
#[derive(Debug, Default)]
pub struct PositionAssigner {
    positions: Mutex<HashMap<String, usize>>,
}

impl PositionAssigner {
    /// Creates an empty assigner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the position for `name`, assigning the next free one if needed.
    pub fn assign(&self, name: &str) -> usize {
        let mut positions = self
            .positions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let next = positions.len();
        *positions.entry(name.to_string()).or_insert(next)
    }

    /// Number of distinct identifiers seen so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Returns true if no identifier has been assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_stable_per_name() {
        let assigner = PositionAssigner::new();
        let a = assigner.assign("priority");
        let b = assigner.assign("region");
        assert_ne!(a, b);
        assert_eq!(assigner.assign("priority"), a);
        assert_eq!(assigner.len(), 2);
    }

    #[test]
    fn reparsing_known_names_does_not_grow_positions() {
        let assigner = PositionAssigner::new();
        for _ in 0..100 {
            let mut sel = SqlSelectorParser
                .parse("a = 1 OR b IN ('x', 'y')", SelectorDomain::Jms)
                .unwrap();
            sel.resolve(&assigner);
        }
        assert_eq!(assigner.len(), 2);
    }

    #[test]
    fn resolve_assigns_every_identifier() {
        let assigner = PositionAssigner::new();
        let mut sel = SqlSelectorParser
            .parse("a = 1 AND (b > 2 OR a < 0)", SelectorDomain::Jms)
            .unwrap();
        sel.resolve(&assigner);
        assert_eq!(assigner.len(), 2);

        fn all_resolved(s: &Selector) -> bool {
            match s {
                Selector::Identifier(id) => id.position.is_some(),
                Selector::Compare { left, right, .. } => all_resolved(left) && all_resolved(right),
                Selector::And(a, b) | Selector::Or(a, b) => all_resolved(a) && all_resolved(b),
                Selector::Not(inner) => all_resolved(inner),
                _ => true,
            }
        }
        assert!(all_resolved(&sel));
    }

    #[test]
    fn depth_counts_the_longest_path() {
        let sel = SqlSelectorParser
            .parse("a = 1 OR NOT (b BETWEEN 1 AND 2)", SelectorDomain::Jms)
            .unwrap();
        // Or -> Not -> Between -> operand
        assert_eq!(sel.depth(), 4);
        assert_eq!(Selector::Literal(Value::Bool(true)).depth(), 1);
    }

    #[test]
    fn like_pattern_wildcards_and_escape() {
        let p = LikePattern::new("ord\\_%", Some('\\')).unwrap();
        assert!(p.is_match("ord_123"));
        assert!(!p.is_match("ordx123"));

        let q = LikePattern::new("a_c", None).unwrap();
        assert!(q.is_match("abc"));
        assert!(!q.is_match("abbc"));
    }

    #[test]
    fn compare_op_negation_is_involutive() {
        for op in [
            CompareOp::Eq,
            CompareOp::Ne,
            CompareOp::Lt,
            CompareOp::Le,
            CompareOp::Gt,
            CompareOp::Ge,
        ] {
            assert_eq!(op.negate().negate(), op);
        }
    }

    #[test]
    fn display_renders_parsable_text() {
        let sel = SqlSelectorParser
            .parse("NOT (x IS NULL) AND name LIKE 'a%'", SelectorDomain::Jms)
            .unwrap();
        let text = sel.to_string();
        let reparsed = SqlSelectorParser.parse(&text, SelectorDomain::Jms).unwrap();
        assert_eq!(sel, reparsed);
    }
}
