//! Three-valued selector evaluation.
//!
//! `None` is SQL's UNKNOWN: a null or missing property, or incomparable types.
//! A registration only matches when its selector evaluates to `Some(true)`.

use std::cmp::Ordering;

use crate::message::MessageKey;
use crate::value::Value;

use super::{CompareOp, Identifier, Selector};

/// Per-search memo of property lookups, indexed by identifier position.
///
/// Reset between messages; a cache must never be shared across searches of
/// different messages.
#[derive(Debug, Default)]
pub struct EvalCache {
    slots: Vec<Option<Option<Value>>>,
}

impl EvalCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all memoized lookups.
    pub fn reset(&mut self) {
        self.slots.clear();
    }

    fn lookup(&mut self, id: &Identifier, msg: &dyn MessageKey) -> Option<Value> {
        let Some(pos) = id.position else {
            return msg.property(&id.name);
        };
        if pos >= self.slots.len() {
            self.slots.resize(pos + 1, None);
        }
        self.slots[pos]
            .get_or_insert_with(|| msg.property(&id.name))
            .clone()
    }
}

/// Evaluates a selector against a message.
pub fn evaluate(sel: &Selector, msg: &dyn MessageKey, cache: &mut EvalCache) -> Option<bool> {
    match sel {
        Selector::And(a, b) => match (evaluate(a, msg, cache), evaluate(b, msg, cache)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        Selector::Or(a, b) => match (evaluate(a, msg, cache), evaluate(b, msg, cache)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        Selector::Not(inner) => evaluate(inner, msg, cache).map(|v| !v),
        Selector::Compare { op, left, right } => {
            let l = value_of(left, msg, cache)?;
            let r = value_of(right, msg, cache)?;
            let ord = l.compare(&r)?;
            Some(apply(*op, ord))
        }
        Selector::IsNull { operand, negated } => {
            let is_null = value_of(operand, msg, cache).is_none();
            Some(is_null != *negated)
        }
        Selector::Like {
            operand,
            pattern,
            negated,
        } => {
            let v = value_of(operand, msg, cache)?;
            let s = v.as_string()?;
            Some(pattern.is_match(s) != *negated)
        }
        Selector::In {
            operand,
            values,
            negated,
        } => {
            let v = value_of(operand, msg, cache)?;
            let found = values
                .iter()
                .any(|candidate| v.compare(candidate) == Some(Ordering::Equal));
            Some(found != *negated)
        }
        Selector::Between {
            operand,
            low,
            high,
            negated,
        } => {
            let v = value_of(operand, msg, cache)?;
            let lo = value_of(low, msg, cache)?;
            let hi = value_of(high, msg, cache)?;
            let inside = v.compare(&lo)? != Ordering::Less && v.compare(&hi)? != Ordering::Greater;
            Some(inside != *negated)
        }
        Selector::Literal(_) | Selector::Identifier(_) => value_of(sel, msg, cache)?.as_bool(),
    }
}

/// Evaluates and collapses UNKNOWN to false.
pub fn matches(sel: &Selector, msg: &dyn MessageKey, cache: &mut EvalCache) -> bool {
    evaluate(sel, msg, cache) == Some(true)
}

// Null and missing values are both `None`.
fn value_of(sel: &Selector, msg: &dyn MessageKey, cache: &mut EvalCache) -> Option<Value> {
    match sel {
        Selector::Literal(Value::Null) => None,
        Selector::Literal(v) => Some(v.clone()),
        Selector::Identifier(id) => cache.lookup(id, msg).filter(|v| !v.is_null()),
        predicate => evaluate(predicate, msg, cache).map(Value::Bool),
    }
}

const fn apply(op: CompareOp, ord: Ordering) -> bool {
    match op {
        CompareOp::Eq => matches!(ord, Ordering::Equal),
        CompareOp::Ne => !matches!(ord, Ordering::Equal),
        CompareOp::Lt => matches!(ord, Ordering::Less),
        CompareOp::Le => !matches!(ord, Ordering::Greater),
        CompareOp::Gt => matches!(ord, Ordering::Greater),
        CompareOp::Ge => !matches!(ord, Ordering::Less),
    }
}
