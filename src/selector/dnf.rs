//! Disjunctive normal form.
//!
//! Each disjunct becomes its own index registration, so OR'd selectors can be
//! indexed as independent conjunctions of simple tests.

use crate::error::SyntaxError;

use super::{Selector, SelectorDomain};

/// Upper bound on the number of conjunctions a single selector may expand to.
pub const MAX_CONJUNCTIONS: usize = 256;

/// Splits a selector into conjunctions of simple tests.
///
/// The result is a disjunction: the selector matches when any inner list
/// matches in full. `XPath1` selectors are kept whole as a single one-test
/// conjunction.
pub fn to_conjunctions(
    selector: &Selector,
    source: &str,
    domain: SelectorDomain,
) -> Result<Vec<Vec<Selector>>, SyntaxError> {
    if domain == SelectorDomain::XPath1 {
        return Ok(vec![vec![selector.clone()]]);
    }

    let normalized = push_negation(selector.clone(), false);
    expand(&normalized).ok_or_else(|| SyntaxError::SelectorTooComplex {
        selector: source.to_string(),
        max: MAX_CONJUNCTIONS,
    })
}

// Moves NOT down to the leaves. Sound under three-valued logic: De Morgan
// holds, and flipping a comparison or a negatable predicate yields unknown on
// exactly the same inputs as the original.
fn push_negation(sel: Selector, negate: bool) -> Selector {
    match sel {
        Selector::Not(inner) => push_negation(*inner, !negate),
        Selector::And(a, b) => {
            let a = push_negation(*a, negate);
            let b = push_negation(*b, negate);
            if negate {
                Selector::Or(Box::new(a), Box::new(b))
            } else {
                Selector::And(Box::new(a), Box::new(b))
            }
        }
        Selector::Or(a, b) => {
            let a = push_negation(*a, negate);
            let b = push_negation(*b, negate);
            if negate {
                Selector::And(Box::new(a), Box::new(b))
            } else {
                Selector::Or(Box::new(a), Box::new(b))
            }
        }
        other if !negate => other,
        Selector::Compare { op, left, right } => Selector::Compare {
            op: op.negate(),
            left,
            right,
        },
        Selector::IsNull { operand, negated } => Selector::IsNull {
            operand,
            negated: !negated,
        },
        Selector::Like {
            operand,
            pattern,
            negated,
        } => Selector::Like {
            operand,
            pattern,
            negated: !negated,
        },
        Selector::In {
            operand,
            values,
            negated,
        } => Selector::In {
            operand,
            values,
            negated: !negated,
        },
        Selector::Between {
            operand,
            low,
            high,
            negated,
        } => Selector::Between {
            operand,
            low,
            high,
            negated: !negated,
        },
        leaf => Selector::Not(Box::new(leaf)),
    }
}

fn expand(sel: &Selector) -> Option<Vec<Vec<Selector>>> {
    match sel {
        Selector::Or(a, b) => {
            let mut left = expand(a)?;
            let right = expand(b)?;
            if left.len() + right.len() > MAX_CONJUNCTIONS {
                return None;
            }
            left.extend(right);
            Some(left)
        }
        Selector::And(a, b) => {
            let left = expand(a)?;
            let right = expand(b)?;
            if left.len().saturating_mul(right.len()) > MAX_CONJUNCTIONS {
                return None;
            }
            let mut out = Vec::with_capacity(left.len() * right.len());
            for l in &left {
                for r in &right {
                    let mut conj = Vec::with_capacity(l.len() + r.len());
                    conj.extend(l.iter().cloned());
                    conj.extend(r.iter().cloned());
                    out.push(conj);
                }
            }
            Some(out)
        }
        leaf => Some(vec![vec![leaf.clone()]]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{CompareOp, SelectorParser, SqlSelectorParser};

    fn conj(s: &str) -> Vec<Vec<Selector>> {
        let sel = SqlSelectorParser.parse(s, SelectorDomain::Jms).unwrap();
        to_conjunctions(&sel, s, SelectorDomain::Jms).unwrap()
    }

    #[test]
    fn or_splits_into_conjunctions() {
        let c = conj("a = 1 OR b = 2");
        assert_eq!(c.len(), 2);
        assert!(c.iter().all(|tests| tests.len() == 1));
    }

    #[test]
    fn and_distributes_over_or() {
        let c = conj("(a = 1 OR b = 2) AND (c = 3 OR d = 4)");
        assert_eq!(c.len(), 4);
        assert!(c.iter().all(|tests| tests.len() == 2));
    }

    #[test]
    fn negation_is_pushed_to_leaves() {
        let c = conj("NOT (a = 1 AND b IS NULL)");
        assert_eq!(c.len(), 2);
        assert!(matches!(
            c[0][0],
            Selector::Compare {
                op: CompareOp::Ne,
                ..
            }
        ));
        assert!(matches!(c[1][0], Selector::IsNull { negated: true, .. }));
    }

    #[test]
    fn double_negation_cancels() {
        let c = conj("NOT NOT flag");
        assert_eq!(c.len(), 1);
        assert!(matches!(c[0][0], Selector::Identifier(_)));
    }

    #[test]
    fn negated_boolean_identifier_stays_wrapped() {
        let c = conj("NOT flag");
        assert!(matches!(c[0][0], Selector::Not(_)));
    }

    #[test]
    fn xpath_domain_is_not_split() {
        let s = "a = 1 OR b = 2";
        let sel = SqlSelectorParser.parse(s, SelectorDomain::XPath1).unwrap();
        let c = to_conjunctions(&sel, s, SelectorDomain::XPath1).unwrap();
        assert_eq!(c.len(), 1);
        assert!(matches!(c[0][0], Selector::Or(..)));
    }

    #[test]
    fn expansion_is_bounded() {
        // 2^9 = 512 conjunctions
        let clause = |i: usize| format!("(a{i} = 1 OR b{i} = 1)");
        let s = (0..9).map(clause).collect::<Vec<_>>().join(" AND ");
        let sel = SqlSelectorParser.parse(&s, SelectorDomain::Jms).unwrap();
        assert!(matches!(
            to_conjunctions(&sel, &s, SelectorDomain::Jms),
            Err(SyntaxError::SelectorTooComplex { .. })
        ));
    }
}
