//! In-process match space.
//!
//! Exact expressions are keyed by their full text. Wildcarded expressions are
//! bucketed by stem; since stems always end on a level boundary, a search only
//! visits the buckets keyed by the published topic's own level prefixes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{lock_err, KyroError, KyroResult};
use crate::message::MessageKey;
use crate::search::SearchResults;
use crate::selector::EvalCache;
use crate::target::{MatchTarget, TargetType};
use crate::topic::{TopicPattern, SEPARATOR};

use super::{Conjunction, MatchSpace};

#[derive(Debug)]
struct Entry {
    conjunction: Arc<Conjunction>,
    target: MatchTarget,
}

#[derive(Debug)]
struct Node {
    pattern: TopicPattern,
    entries: Vec<Entry>,
}

impl Node {
    fn new(pattern: TopicPattern) -> Self {
        Self {
            pattern,
            entries: Vec::new(),
        }
    }

    fn remove(&mut self, conjunction: &Arc<Conjunction>, target: &MatchTarget) -> bool {
        let id = target.id();
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.conjunction, conjunction) && e.target.id() == id)
        else {
            return false;
        };
        self.entries.swap_remove(pos);
        true
    }

    // Evaluates this node's entries and hands matches to the results once.
    fn accumulate(&self, msg: &dyn MessageKey, cache: &mut EvalCache, results: &mut SearchResults) {
        let mut by_type: [Vec<&MatchTarget>; TargetType::COUNT] = Default::default();
        for entry in &self.entries {
            if entry.conjunction.tests_pass(msg, cache) {
                by_type[entry.target.target_type().index()].push(&entry.target);
            }
        }
        for ty in TargetType::ALL {
            let hits = &by_type[ty.index()];
            if !hits.is_empty() {
                results.accumulate(ty, hits);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Index {
    exact: HashMap<String, Node>,
    wildcard: HashMap<String, HashMap<String, Node>>,
    len: usize,
}

/// Default [`MatchSpace`], guarded by a read-write lock.
#[derive(Debug, Default)]
pub struct InMemoryMatchSpace {
    index: RwLock<Index>,
}

impl InMemoryMatchSpace {
    /// Creates an empty match space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

// "", "a", "a/b", "a/b/c" for "a/b/c".
fn level_prefixes(topic: &str) -> impl Iterator<Item = &str> {
    std::iter::once("")
        .chain(topic.match_indices(SEPARATOR).map(move |(i, _)| &topic[..i]))
        .chain(std::iter::once(topic))
}

impl MatchSpace for InMemoryMatchSpace {
    fn add_target(&self, conjunction: Arc<Conjunction>, target: MatchTarget) -> KyroResult<()> {
        let mut index = self.index.write().map_err(|_| lock_err("match space"))?;
        let pattern = conjunction.topic.clone();
        let expression = pattern.expression().to_string();

        let node = if pattern.is_wildcarded() {
            index
                .wildcard
                .entry(pattern.stem().to_string())
                .or_default()
                .entry(expression)
                .or_insert_with(|| Node::new(pattern))
        } else {
            index
                .exact
                .entry(expression)
                .or_insert_with(|| Node::new(pattern))
        };
        node.entries.push(Entry { conjunction, target });
        index.len += 1;
        Ok(())
    }

    fn remove_target(
        &self,
        conjunction: &Arc<Conjunction>,
        target: &MatchTarget,
    ) -> KyroResult<()> {
        let mut index = self.index.write().map_err(|_| lock_err("match space"))?;
        let pattern = &conjunction.topic;
        let expression = pattern.expression();

        let removed = if pattern.is_wildcarded() {
            let stem = pattern.stem();
            let Some(bucket) = index.wildcard.get_mut(stem) else {
                return Err(KyroError::inconsistency(format!(
                    "no wildcard bucket for stem '{stem}' while removing {conjunction}"
                )));
            };
            let removed = match bucket.get_mut(expression) {
                Some(node) => {
                    let removed = node.remove(conjunction, target);
                    if node.entries.is_empty() {
                        bucket.remove(expression);
                    }
                    removed
                }
                None => false,
            };
            if bucket.is_empty() {
                index.wildcard.remove(stem);
            }
            removed
        } else {
            match index.exact.get_mut(expression) {
                Some(node) => {
                    let removed = node.remove(conjunction, target);
                    if node.entries.is_empty() {
                        index.exact.remove(expression);
                    }
                    removed
                }
                None => false,
            }
        };

        if !removed {
            return Err(KyroError::inconsistency(format!(
                "target {} not registered under {conjunction}",
                target.id()
            )));
        }
        index.len -= 1;
        debug!(expression, remaining = index.len, "match space entry removed");
        Ok(())
    }

    fn search(
        &self,
        topic: &str,
        msg: &dyn MessageKey,
        cache: &mut EvalCache,
        results: &mut SearchResults,
    ) -> KyroResult<()> {
        let index = self.index.read().map_err(|_| lock_err("match space"))?;

        if let Some(node) = index.exact.get(topic) {
            node.accumulate(msg, cache, results);
        }
        for prefix in level_prefixes(topic) {
            let Some(bucket) = index.wildcard.get(prefix) else {
                continue;
            };
            for node in bucket.values() {
                if node.pattern.matches(topic) {
                    node.accumulate(msg, cache, results);
                }
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.index.read().map_or(0, |index| index.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::search::SearchResults;
    use crate::security::InsecureBus;
    use crate::selector::{SelectorDomain, SelectorParser, SqlSelectorParser};
    use crate::target::{ConsumerDispatcher, ConsumerPoint};

    fn conj(expr: &str, selector: Option<&str>) -> Arc<Conjunction> {
        let tests = selector
            .map(|s| vec![SqlSelectorParser.parse(s, SelectorDomain::Jms).unwrap()])
            .unwrap_or_default();
        Arc::new(Conjunction {
            topic: TopicPattern::compile(expr).unwrap(),
            tests,
        })
    }

    fn search(space: &InMemoryMatchSpace, topic: &str, msg: &Message) -> SearchResults {
        let mut results = SearchResults::new(Arc::new(InsecureBus));
        space
            .search(topic, msg, &mut EvalCache::new(), &mut results)
            .unwrap();
        results
    }

    #[test]
    fn level_prefixes_cover_every_boundary() {
        let prefixes: Vec<&str> = level_prefixes("a/b/c").collect();
        assert_eq!(prefixes, vec!["", "a", "a/b", "a/b/c"]);
    }

    #[test]
    fn exact_and_wildcard_targets_are_found() {
        let space = InMemoryMatchSpace::new();
        let exact = ConsumerDispatcher::new("exact", "ts");
        let wild = ConsumerDispatcher::new("wild", "ts");
        space
            .add_target(conj("ts/a/b", None), MatchTarget::Subscription(exact.clone()))
            .unwrap();
        space
            .add_target(conj("ts/a//.", None), MatchTarget::Subscription(wild.clone()))
            .unwrap();

        let mut results = search(&space, "ts/a/b", &Message::new("a/b"));
        let view = results.results("ts/a/b");
        let names: Vec<&str> = view
            .subscriptions()
            .iter()
            .map(|cd| cd.subscription_name.as_str())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"exact"));
        assert!(names.contains(&"wild"));

        let mut results = search(&space, "ts/a/c", &Message::new("a/c"));
        assert_eq!(results.results("ts/a/c").subscriptions().len(), 1);
    }

    #[test]
    fn selector_tests_filter_entries() {
        let space = InMemoryMatchSpace::new();
        let cp = ConsumerPoint::new("cp");
        space
            .add_target(conj("ts/orders", Some("priority > 3")), MatchTarget::Consumer(cp))
            .unwrap();

        let hi = Message::new("orders").with_property("priority", 5);
        let lo = Message::new("orders").with_property("priority", 1);
        assert_eq!(search(&space, "ts/orders", &hi).results("ts/orders").consumers().len(), 1);
        assert!(search(&space, "ts/orders", &lo).results("ts/orders").consumers().is_empty());
    }

    #[test]
    fn remove_requires_the_same_conjunction() {
        let space = InMemoryMatchSpace::new();
        let target = MatchTarget::Consumer(ConsumerPoint::new("cp"));
        let c1 = conj("ts/a/*", None);
        space.add_target(Arc::clone(&c1), target.clone()).unwrap();
        assert_eq!(space.len(), 1);

        let other = conj("ts/a/*", None);
        assert!(space.remove_target(&other, &target).unwrap_err().is_inconsistency());

        space.remove_target(&c1, &target).unwrap();
        assert!(space.is_empty());
        assert!(space.remove_target(&c1, &target).unwrap_err().is_inconsistency());
    }
}
