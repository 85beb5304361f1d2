//! Consumer categorization by topic expression.
//!
//! Every monitored consumer lands in exactly one of four buckets, decided at
//! registration from whether its topic is wildcarded and whether it has a
//! selector. Within a bucket, consumers are grouped by full topic expression,
//! which lets a new consumer on an already-known expression reuse the monitor
//! matches of its neighbours instead of re-evaluating every monitor.

use std::collections::{HashMap, HashSet};

use crate::error::{KyroError, KyroResult};
use crate::target::RegistrationKey;
use crate::topic::{stems_overlap, TopicPattern};

/// Which bucket a consumer registration falls into.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicExpressionCategory {
    ExactNonSelector = 0,
    WildcardNonSelector = 1,
    ExactSelector = 2,
    WildcardSelector = 3,
}

impl TopicExpressionCategory {
    /// All categories.
    pub const ALL: [Self; 4] = [
        Self::ExactNonSelector,
        Self::WildcardNonSelector,
        Self::ExactSelector,
        Self::WildcardSelector,
    ];

    /// Classifies a registration.
    #[must_use]
    pub const fn classify(wildcarded: bool, has_selector: bool) -> Self {
        match (wildcarded, has_selector) {
            (false, false) => Self::ExactNonSelector,
            (true, false) => Self::WildcardNonSelector,
            (false, true) => Self::ExactSelector,
            (true, true) => Self::WildcardSelector,
        }
    }

    /// Returns true for the wildcarded buckets.
    #[must_use]
    pub const fn is_wildcarded(self) -> bool {
        matches!(self, Self::WildcardNonSelector | Self::WildcardSelector)
    }

    /// Returns true for the selector buckets.
    #[must_use]
    pub const fn has_selector(self) -> bool {
        matches!(self, Self::ExactSelector | Self::WildcardSelector)
    }

    const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
struct ExpressionConsumers {
    pattern: TopicPattern,
    consumers: Vec<RegistrationKey>,
}

/// Per-category maps of topic expression to registered consumers.
#[derive(Debug, Default)]
pub struct SubscriptionRegistrar {
    maps: [HashMap<String, ExpressionConsumers>; 4],
}

impl SubscriptionRegistrar {
    /// Creates an empty registrar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if some consumer is already registered on `expression`
    /// in `category`.
    #[must_use]
    pub fn is_known_expression(&self, expression: &str, category: TopicExpressionCategory) -> bool {
        self.maps[category.index()].contains_key(expression)
    }

    /// Consumers registered on `expression` in `category`.
    #[must_use]
    pub fn consumers_on(
        &self,
        expression: &str,
        category: TopicExpressionCategory,
    ) -> &[RegistrationKey] {
        self.maps[category.index()]
            .get(expression)
            .map(|e| e.consumers.as_slice())
            .unwrap_or_default()
    }

    /// Adds `consumer` under `pattern` in `category`.
    pub fn add_consumer(
        &mut self,
        pattern: &TopicPattern,
        category: TopicExpressionCategory,
        consumer: RegistrationKey,
    ) {
        self.maps[category.index()]
            .entry(pattern.expression().to_string())
            .or_insert_with(|| ExpressionConsumers {
                pattern: pattern.clone(),
                consumers: Vec::new(),
            })
            .consumers
            .push(consumer);
    }

    /// Removes `consumer` from `expression` in `category`, dropping the
    /// expression once its last consumer is gone.
    pub fn remove_consumer(
        &mut self,
        expression: &str,
        category: TopicExpressionCategory,
        consumer: &RegistrationKey,
    ) -> KyroResult<()> {
        let map = &mut self.maps[category.index()];
        let Some(entry) = map.get_mut(expression) else {
            return Err(KyroError::inconsistency(format!(
                "no {category:?} consumer list for '{expression}' while removing {consumer}"
            )));
        };
        let Some(pos) = entry.consumers.iter().position(|c| c == consumer) else {
            return Err(KyroError::inconsistency(format!(
                "{consumer} missing from {category:?} consumer list for '{expression}'"
            )));
        };
        entry.consumers.remove(pos);
        if entry.consumers.is_empty() {
            map.remove(expression);
        }
        Ok(())
    }

    /// Consumers possibly matching a monitored expression.
    ///
    /// Exact-vs-exact is string equality and any pairing with one exact side
    /// is evaluated properly. Wildcard-vs-wildcard cannot be decided, so any
    /// overlap of stems counts: false positives are possible, false negatives
    /// are not. Selectors never exclude a consumer. With `non_selector_only`
    /// the selector buckets are skipped.
    #[must_use]
    pub fn find_candidates(
        &self,
        monitor: &TopicPattern,
        non_selector_only: bool,
    ) -> Vec<RegistrationKey> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for category in TopicExpressionCategory::ALL {
            if non_selector_only && category.has_selector() {
                continue;
            }
            let map = &self.maps[category.index()];

            if !monitor.is_wildcarded() && !category.is_wildcarded() {
                if let Some(entry) = map.get(monitor.expression()) {
                    push_unique(&mut seen, &mut out, &entry.consumers);
                }
                continue;
            }

            for entry in map.values() {
                if entry_matches(monitor, &entry.pattern) {
                    push_unique(&mut seen, &mut out, &entry.consumers);
                }
            }
        }
        out
    }

    /// Total registered consumers across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps
            .iter()
            .flat_map(HashMap::values)
            .map(|e| e.consumers.len())
            .sum()
    }

    /// Returns true if no consumer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.iter().all(HashMap::is_empty)
    }
}

/// Decides whether a monitor expression and a consumer expression overlap.
pub(crate) fn entry_matches(monitor: &TopicPattern, consumer: &TopicPattern) -> bool {
    match (monitor.is_wildcarded(), consumer.is_wildcarded()) {
        (false, false) => monitor.expression() == consumer.expression(),
        (false, true) => {
            stems_overlap(monitor.stem(), consumer.stem()) && consumer.matches(monitor.expression())
        }
        (true, false) => monitor.matches(consumer.expression()),
        (true, true) => stems_overlap(monitor.stem(), consumer.stem()),
    }
}

fn push_unique(
    seen: &mut HashSet<RegistrationKey>,
    out: &mut Vec<RegistrationKey>,
    keys: &[RegistrationKey],
) {
    for key in keys {
        if seen.insert(key.clone()) {
            out.push(key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::ProxySubscriptionId;

    fn key() -> RegistrationKey {
        RegistrationKey::ProxySubscription(ProxySubscriptionId::new())
    }

    fn pat(expr: &str) -> TopicPattern {
        TopicPattern::compile(expr).unwrap()
    }

    #[test]
    fn classify_covers_all_buckets() {
        use TopicExpressionCategory as C;
        assert_eq!(C::classify(false, false), C::ExactNonSelector);
        assert_eq!(C::classify(true, false), C::WildcardNonSelector);
        assert_eq!(C::classify(false, true), C::ExactSelector);
        assert_eq!(C::classify(true, true), C::WildcardSelector);
    }

    #[test]
    fn add_and_remove_track_known_expressions() {
        let mut reg = SubscriptionRegistrar::new();
        let (a, b) = (key(), key());
        let cat = TopicExpressionCategory::ExactNonSelector;
        reg.add_consumer(&pat("ts/a"), cat, a.clone());
        reg.add_consumer(&pat("ts/a"), cat, b.clone());
        assert!(reg.is_known_expression("ts/a", cat));
        assert!(!reg.is_known_expression("ts/a", TopicExpressionCategory::ExactSelector));
        assert_eq!(reg.len(), 2);

        reg.remove_consumer("ts/a", cat, &a).unwrap();
        assert!(reg.is_known_expression("ts/a", cat));
        reg.remove_consumer("ts/a", cat, &b).unwrap();
        assert!(!reg.is_known_expression("ts/a", cat));
        assert!(reg.is_empty());
    }

    #[test]
    fn removing_unknown_consumer_is_inconsistency() {
        let mut reg = SubscriptionRegistrar::new();
        let cat = TopicExpressionCategory::ExactNonSelector;
        let err = reg.remove_consumer("ts/a", cat, &key()).unwrap_err();
        assert!(err.is_inconsistency());

        reg.add_consumer(&pat("ts/a"), cat, key());
        let err = reg.remove_consumer("ts/a", cat, &key()).unwrap_err();
        assert!(err.is_inconsistency());
    }

    #[test]
    fn exact_monitor_candidates() {
        let mut reg = SubscriptionRegistrar::new();
        let (exact, wild, other) = (key(), key(), key());
        reg.add_consumer(&pat("ts/a/b"), TopicExpressionCategory::ExactNonSelector, exact.clone());
        reg.add_consumer(&pat("ts/a/*"), TopicExpressionCategory::WildcardSelector, wild.clone());
        reg.add_consumer(&pat("ts/x/*"), TopicExpressionCategory::WildcardNonSelector, other);

        let found = reg.find_candidates(&pat("ts/a/b"), false);
        assert_eq!(found.len(), 2);
        assert!(found.contains(&exact));
        assert!(found.contains(&wild));

        let found = reg.find_candidates(&pat("ts/a/b"), true);
        assert_eq!(found, vec![exact]);
    }

    #[test]
    fn wildcard_monitor_candidates_use_stem_overlap() {
        let mut reg = SubscriptionRegistrar::new();
        let (deeper, shallower, disjoint, exact) = (key(), key(), key(), key());
        let wild = TopicExpressionCategory::WildcardNonSelector;
        reg.add_consumer(&pat("ts/a/b//c"), wild, deeper.clone());
        reg.add_consumer(&pat("ts//."), wild, shallower.clone());
        reg.add_consumer(&pat("ts/z/*"), TopicExpressionCategory::WildcardNonSelector, disjoint);
        reg.add_consumer(&pat("ts/a/q"), TopicExpressionCategory::ExactNonSelector, exact.clone());

        let found = reg.find_candidates(&pat("ts/a//."), false);
        assert_eq!(found.len(), 3);
        assert!(found.contains(&deeper));
        assert!(found.contains(&shallower));
        assert!(found.contains(&exact));
    }
}
