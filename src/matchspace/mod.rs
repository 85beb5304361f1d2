//! The expression index.
//!
//! A match space stores (conjunction, target) pairs and, given a published
//! topic and message, feeds every matching target into a [`SearchResults`].
//! One registration may own several conjunctions; each is stored with its
//! own copy of the target and removed individually.

mod memory;

pub use memory::InMemoryMatchSpace;

use std::fmt;
use std::sync::Arc;

use crate::error::KyroResult;
use crate::message::MessageKey;
use crate::search::SearchResults;
use crate::selector::{eval, EvalCache, Selector};
use crate::target::MatchTarget;
use crate::topic::TopicPattern;

/// One AND-clause of a registration: a topic pattern plus simple tests.
#[derive(Debug, Clone)]
pub struct Conjunction {
    /// The compiled topic expression.
    pub topic: TopicPattern,
    /// Simple tests that must all be TRUE. Empty means topic only.
    pub tests: Vec<Selector>,
}

impl Conjunction {
    /// A conjunction with no selector tests.
    #[must_use]
    pub const fn topic_only(topic: TopicPattern) -> Self {
        Self {
            topic,
            tests: Vec::new(),
        }
    }

    /// Returns true if every test evaluates to TRUE for the message.
    ///
    /// The topic is assumed to match already.
    pub fn tests_pass(&self, msg: &dyn MessageKey, cache: &mut EvalCache) -> bool {
        self.tests.iter().all(|t| eval::matches(t, msg, cache))
    }
}

impl fmt::Display for Conjunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic)?;
        if self.tests.is_empty() {
            return Ok(());
        }
        let tests: Vec<String> = self.tests.iter().map(ToString::to_string).collect();
        write!(f, " [{}]", tests.join(" AND "))
    }
}

/// Storage and traversal for registered conjunctions.
pub trait MatchSpace: Send + Sync {
    /// Stores `target` under `conjunction`.
    fn add_target(&self, conjunction: Arc<Conjunction>, target: MatchTarget) -> KyroResult<()>;

    /// Removes the entry added with this exact conjunction and target.
    ///
    /// A missing entry is an internal inconsistency.
    fn remove_target(&self, conjunction: &Arc<Conjunction>, target: &MatchTarget) -> KyroResult<()>;

    /// Accumulates every target whose conjunction matches `topic` and `msg`.
    ///
    /// `topic` is a fully qualified, non-wildcarded topic. `cache` must be
    /// fresh for `msg`.
    fn search(
        &self,
        topic: &str,
        msg: &dyn MessageKey,
        cache: &mut EvalCache,
        results: &mut SearchResults,
    ) -> KyroResult<()>;

    /// Number of stored (conjunction, target) entries.
    fn len(&self) -> usize;

    /// Returns true if nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
