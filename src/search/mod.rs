//! Search result aggregation.
//!
//! Traversal hands raw hits to [`SearchResults`], which routes each batch to
//! the handler for its [`TargetType`]. Once traversal is done, the handlers
//! post-process their slots in table order (ACLs first), so a later handler
//! can filter using an earlier handler's finished result. Post-processing runs
//! lazily on the first [`SearchResults::results`] call and is cached per topic.

mod handlers;
mod pool;

pub use handlers::{
    AclHandler, ConsumerHandler, NeighbourHandler, ResultHandler, SignatureHandler,
    SubscriptionHandler, HANDLERS,
};
pub use pool::SearchResultsPool;

use std::fmt;
use std::sync::Arc;

use crate::acl::{AccumulatedAcl, TopicAcl};
use crate::security::AccessChecker;
use crate::target::{
    ApplicationSignature, ConsumerDispatcher, ConsumerPoint, MatchTarget, ProxySubscription,
    TargetType,
};

/// A typed result slot.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerResult {
    Acl {
        matched: Vec<TopicAcl>,
        accumulated: AccumulatedAcl,
    },
    Subscriptions(Vec<ConsumerDispatcher>),
    Consumers(Vec<ConsumerPoint>),
    Neighbours(Vec<ProxySubscription>),
    Signatures(Vec<ApplicationSignature>),
}

/// What post-processing knows about the search.
#[derive(Clone, Copy)]
pub struct PostProcessContext<'a> {
    /// Set only when the bus is secure; gates ACL filtering.
    pub topic_space: Option<&'a str>,
    /// The fully qualified published topic.
    pub topic: &'a str,
    /// Permission checks for neighbour filtering.
    pub access: &'a dyn AccessChecker,
}

impl fmt::Debug for PostProcessContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostProcessContext")
            .field("topic_space", &self.topic_space)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Per-search accumulator, reusable after [`SearchResults::reset`].
pub struct SearchResults {
    access: Arc<dyn AccessChecker>,
    slots: Vec<HandlerResult>,
    topic_space: Option<String>,
    processed_for: Option<String>,
}

impl fmt::Debug for SearchResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchResults")
            .field("slots", &self.slots)
            .field("topic_space", &self.topic_space)
            .field("processed_for", &self.processed_for)
            .finish_non_exhaustive()
    }
}

impl SearchResults {
    /// Creates empty results that consult `access` during post-processing.
    #[must_use]
    pub fn new(access: Arc<dyn AccessChecker>) -> Self {
        Self {
            access,
            slots: HANDLERS.iter().map(|h| h.init_result()).collect(),
            topic_space: None,
            processed_for: None,
        }
    }

    /// Clears every slot and the cached post-processing.
    pub fn reset(&mut self) {
        for (handler, slot) in HANDLERS.iter().zip(self.slots.iter_mut()) {
            handler.reset_result(slot);
        }
        self.topic_space = None;
        self.processed_for = None;
    }

    /// Attaches the topic space of a search on a secure bus.
    pub fn set_topic_space(&mut self, topic_space: impl Into<String>) {
        self.topic_space = Some(topic_space.into());
    }

    /// Feeds one traversal node's hits of a single type into its handler.
    pub fn accumulate(&mut self, target_type: TargetType, matches: &[&MatchTarget]) {
        let idx = target_type.index();
        HANDLERS[idx].accumulate(matches, &mut self.slots[idx]);
        self.processed_for = None;
    }

    /// Returns the post-processed results for `topic`.
    ///
    /// Post-processing runs once per topic; repeated calls return the cached
    /// slots.
    pub fn results(&mut self, topic: &str) -> ResultsView<'_> {
        if self.processed_for.as_deref() != Some(topic) {
            let ctx = PostProcessContext {
                topic_space: self.topic_space.as_deref(),
                topic,
                access: self.access.as_ref(),
            };
            for (idx, handler) in HANDLERS.iter().enumerate() {
                handler.post_process(&ctx, &mut self.slots, idx);
            }
            self.processed_for = Some(topic.to_string());
        }
        ResultsView { slots: &self.slots }
    }

    /// Returns true if no handler has accumulated anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| match slot {
            HandlerResult::Acl { matched, .. } => matched.is_empty(),
            HandlerResult::Subscriptions(v) => v.is_empty(),
            HandlerResult::Consumers(v) => v.is_empty(),
            HandlerResult::Neighbours(v) => v.is_empty(),
            HandlerResult::Signatures(v) => v.is_empty(),
        })
    }
}

/// Read-only typed view over post-processed slots.
#[derive(Debug, Clone, Copy)]
pub struct ResultsView<'a> {
    slots: &'a [HandlerResult],
}

impl<'a> ResultsView<'a> {
    /// The raw slot for a target type.
    #[must_use]
    pub fn slot(&self, target_type: TargetType) -> &'a HandlerResult {
        &self.slots[target_type.index()]
    }

    /// Matched ACL entries.
    #[must_use]
    pub fn acls(&self) -> &'a [TopicAcl] {
        match self.slot(TargetType::Acl) {
            HandlerResult::Acl { matched, .. } => matched,
            _ => &[],
        }
    }

    /// Grants accumulated from the matched ACLs.
    #[must_use]
    pub fn accumulated_acl(&self) -> Option<&'a AccumulatedAcl> {
        match self.slot(TargetType::Acl) {
            HandlerResult::Acl { accumulated, .. } => Some(accumulated),
            _ => None,
        }
    }

    /// Matched local subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> &'a [ConsumerDispatcher] {
        match self.slot(TargetType::Subscription) {
            HandlerResult::Subscriptions(v) => v,
            _ => &[],
        }
    }

    /// Matched consumer points.
    #[must_use]
    pub fn consumers(&self) -> &'a [ConsumerPoint] {
        match self.slot(TargetType::Consumer) {
            HandlerResult::Consumers(v) => v,
            _ => &[],
        }
    }

    /// Matched neighbour proxies that passed access control.
    #[must_use]
    pub fn neighbours(&self) -> &'a [ProxySubscription] {
        match self.slot(TargetType::Neighbour) {
            HandlerResult::Neighbours(v) => v,
            _ => &[],
        }
    }

    /// Matched application signatures.
    #[must_use]
    pub fn signatures(&self) -> &'a [ApplicationSignature] {
        match self.slot(TargetType::ApplicationSignature) {
            HandlerResult::Signatures(v) => v,
            _ => &[],
        }
    }
}
