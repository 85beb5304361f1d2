//! The matching engine.
//!
//! `MatchingEngine` ties the pieces together: it compiles topic expressions
//! and selectors, keeps the target registry, the consumer categorizer and the
//! monitor registry consistent under one lock, and feeds published topics
//! through the match space into [`SearchResults`].
//!
//! Parsing happens before the registry lock is taken, so a syntax error never
//! leaves partial state behind. Searches do not take the registry lock at all.

mod targets;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::acl::{AclId, TopicAcl};
use crate::config::MatchingConfig;
use crate::error::{lock_err, KyroError, KyroResult, RegistrationError, SyntaxError};
use crate::matchspace::{Conjunction, InMemoryMatchSpace, MatchSpace};
use crate::message::{DiscriminatorKey, MessageKey};
use crate::monitor::{
    CallbackDispatcher, ConnectionId, ConsumerMonitorRegistry, ConsumerSetChangeCallback,
    MonitorSnapshot,
};
use crate::search::{ResultsView, SearchResults, SearchResultsPool};
use crate::security::{AccessChecker, InsecureBus};
use crate::selector::{
    eval, to_conjunctions, EvalCache, PositionAssigner, Selector, SelectorDomain, SelectorParser,
    SqlSelectorParser, MAX_TREE_DEPTH,
};
use crate::target::{
    ApplicationSignature, ConsumerDispatcher, ConsumerPoint, ConsumerPointId, DispatcherId,
    MatchTarget, ProxySubscription, ProxySubscriptionId, RegistrationKey, SelectionCriteria,
    SignatureId,
};
use crate::topic::{self, TopicPattern};

use targets::{TargetRecord, TargetRegistry};

#[derive(Debug)]
struct Registry {
    targets: TargetRegistry,
    monitors: ConsumerMonitorRegistry,
}

// A registration compiled outside the lock.
struct Compiled {
    pattern: TopicPattern,
    conjunctions: Vec<Arc<Conjunction>>,
    has_selector: bool,
}

/// Topic and selector matching engine with consumer-set monitoring.
pub struct MatchingEngine {
    config: MatchingConfig,
    parser: Arc<dyn SelectorParser>,
    space: Arc<dyn MatchSpace>,
    access: Arc<dyn AccessChecker>,
    positions: PositionAssigner,
    registry: Mutex<Registry>,
    pool: SearchResultsPool,
}

impl std::fmt::Debug for MatchingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchingEngine")
            .field("config", &self.config)
            .field("entries", &self.space.len())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self::new(MatchingConfig::default())
    }
}

impl MatchingEngine {
    /// Create an engine on an insecure bus with the in-memory match space.
    #[must_use]
    pub fn new(config: MatchingConfig) -> Self {
        Self::with_access_checker(config, Arc::new(InsecureBus))
    }

    /// Create an engine with an explicit security collaborator.
    #[must_use]
    pub fn with_access_checker(config: MatchingConfig, access: Arc<dyn AccessChecker>) -> Self {
        Self::with_components(
            config,
            Arc::new(SqlSelectorParser),
            Arc::new(InMemoryMatchSpace::new()),
            access,
        )
    }

    /// Create an engine from explicit collaborators.
    #[must_use]
    pub fn with_components(
        config: MatchingConfig,
        parser: Arc<dyn SelectorParser>,
        space: Arc<dyn MatchSpace>,
        access: Arc<dyn AccessChecker>,
    ) -> Self {
        let config = config.clamped();
        let dispatcher =
            CallbackDispatcher::start(config.callback_workers, config.callback_queue_capacity);
        let pool = SearchResultsPool::new(Arc::clone(&access), config.search_results_pool_capacity);
        Self {
            parser,
            space,
            access,
            positions: PositionAssigner::new(),
            registry: Mutex::new(Registry {
                targets: TargetRegistry::default(),
                monitors: ConsumerMonitorRegistry::new(dispatcher),
            }),
            pool,
            config,
        }
    }

    /// The effective configuration.
    #[must_use]
    pub const fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// The security collaborator.
    #[must_use]
    pub fn access_checker(&self) -> &Arc<dyn AccessChecker> {
        &self.access
    }

    fn lock(&self) -> KyroResult<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| lock_err("matching registry"))
    }

    // The configured parser may be foreign, so tree depth is checked here too.
    fn parse_tree(&self, text: &str, domain: SelectorDomain) -> KyroResult<Selector> {
        let mut tree = self.parser.parse(text, domain)?;
        if tree.depth() > MAX_TREE_DEPTH {
            return Err(SyntaxError::InvalidSelector {
                selector: text.to_string(),
                offset: 0,
                reason: format!("tree deeper than {MAX_TREE_DEPTH} levels"),
            }
            .into());
        }
        tree.resolve(&self.positions);
        Ok(tree)
    }

    fn compile(&self, topic_space: &str, criteria: &SelectionCriteria) -> KyroResult<Compiled> {
        let expression =
            topic::build_add_topic_expression(topic_space, criteria.discriminator.as_deref())?;
        let pattern = TopicPattern::compile(&expression)?;

        let Some(text) = criteria.effective_selector() else {
            return Ok(Compiled {
                conjunctions: vec![Arc::new(Conjunction::topic_only(pattern.clone()))],
                pattern,
                has_selector: false,
            });
        };

        let tree = self.parse_tree(text, criteria.domain)?;
        let conjunctions = to_conjunctions(&tree, text, criteria.domain)?
            .into_iter()
            .map(|tests| {
                Arc::new(Conjunction {
                    topic: pattern.clone(),
                    tests,
                })
            })
            .collect();
        Ok(Compiled {
            pattern,
            conjunctions,
            has_selector: true,
        })
    }

    // ---------------------------------------------------------------------
    // Generic registration
    // ---------------------------------------------------------------------

    /// Registers `target` under `key` for the given topic and selector.
    ///
    /// Re-registering a live key fails with `DuplicateKey` and changes
    /// nothing.
    pub fn register_consumer(
        &self,
        key: RegistrationKey,
        topic_space: &str,
        criteria: &SelectionCriteria,
        target: MatchTarget,
    ) -> KyroResult<()> {
        let compiled = self.compile(topic_space, criteria)?;

        let mut registry = self.lock()?;
        if registry.targets.contains(&key) {
            return Err(RegistrationError::DuplicateKey { key: key.to_string() }.into());
        }

        let mut added: Vec<&Arc<Conjunction>> = Vec::with_capacity(compiled.conjunctions.len());
        for conjunction in &compiled.conjunctions {
            if let Err(err) = self.space.add_target(Arc::clone(conjunction), target.clone()) {
                for done in added {
                    if let Err(undo) = self.space.remove_target(done, &target) {
                        warn!(%key, error = %undo, "failed to roll back partial registration");
                    }
                }
                return Err(err);
            }
            added.push(conjunction);
        }

        if target.is_monitored_consumer() {
            registry
                .monitors
                .add_consumer(key.clone(), &compiled.pattern, compiled.has_selector)?;
        }

        debug!(
            %key,
            expression = compiled.pattern.expression(),
            conjunctions = compiled.conjunctions.len(),
            "registered match target"
        );
        registry.targets.put(TargetRecord {
            key,
            target,
            conjunctions: compiled.conjunctions,
            topic_space: topic_space.to_string(),
            pattern: compiled.pattern,
        })?;
        Ok(())
    }

    /// Removes the registration for `key` and returns its target.
    pub fn remove_consumer(&self, key: &RegistrationKey) -> KyroResult<MatchTarget> {
        let mut registry = self.lock()?;
        let record = registry.targets.remove_and_return(key)?;
        Self::unindex(self.space.as_ref(), &mut registry, &record)?;
        debug!(%key, expression = record.pattern.expression(), "removed match target");
        Ok(record.target)
    }

    fn unindex(
        space: &dyn MatchSpace,
        registry: &mut Registry,
        record: &TargetRecord,
    ) -> KyroResult<()> {
        for conjunction in &record.conjunctions {
            space.remove_target(conjunction, &record.target)?;
        }
        if record.target.is_monitored_consumer() {
            registry.monitors.remove_consumer(&record.key)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Typed registration
    // ---------------------------------------------------------------------

    /// Subscribes a local dispatcher. One dispatcher may hold several
    /// subscriptions with different criteria.
    pub fn add_consumer_dispatcher_match_target(
        &self,
        dispatcher: &ConsumerDispatcher,
        criteria: &SelectionCriteria,
    ) -> KyroResult<()> {
        let key = RegistrationKey::Subscription {
            dispatcher: dispatcher.id,
            criteria: criteria.clone(),
        };
        self.register_consumer(
            key,
            &dispatcher.topic_space,
            criteria,
            MatchTarget::Subscription(dispatcher.clone()),
        )
    }

    /// Creates a non-durable dispatcher on `topic_space` and subscribes it in
    /// one step.
    ///
    /// Nothing is created if registration fails.
    pub fn create_consumer_dispatcher_match_target(
        &self,
        subscription_name: impl Into<String>,
        topic_space: impl Into<String>,
        criteria: &SelectionCriteria,
    ) -> KyroResult<ConsumerDispatcher> {
        let dispatcher = ConsumerDispatcher::new(subscription_name, topic_space);
        self.add_consumer_dispatcher_match_target(&dispatcher, criteria)?;
        Ok(dispatcher)
    }

    /// Removes one subscription of a local dispatcher.
    pub fn remove_consumer_dispatcher_match_target(
        &self,
        dispatcher: DispatcherId,
        criteria: &SelectionCriteria,
    ) -> KyroResult<()> {
        self.remove_consumer(&RegistrationKey::Subscription {
            dispatcher,
            criteria: criteria.clone(),
        })
        .map(|_| ())
    }

    /// Attaches a consumer point to a destination.
    pub fn add_consumer_point_match_target(
        &self,
        consumer: &ConsumerPoint,
        topic_space: &str,
        criteria: &SelectionCriteria,
    ) -> KyroResult<()> {
        self.register_consumer(
            RegistrationKey::ConsumerPoint(consumer.id),
            topic_space,
            criteria,
            MatchTarget::Consumer(consumer.clone()),
        )
    }

    /// Detaches a consumer point.
    pub fn remove_consumer_point_match_target(&self, id: ConsumerPointId) -> KyroResult<()> {
        self.remove_consumer(&RegistrationKey::ConsumerPoint(id)).map(|_| ())
    }

    /// Consumer points that would receive `msg`.
    pub fn retrieve_matching_consumer_points(
        &self,
        topic_space: &str,
        msg: &dyn MessageKey,
    ) -> KyroResult<Vec<ConsumerPoint>> {
        self.with_results(topic_space, msg, |view| view.consumers().to_vec())
    }

    /// Registers a subscription held for a neighbouring bus.
    pub fn add_proxy_subscription_match_target(
        &self,
        proxy: &ProxySubscription,
        topic_space: &str,
        criteria: &SelectionCriteria,
    ) -> KyroResult<()> {
        self.register_consumer(
            RegistrationKey::ProxySubscription(proxy.id),
            topic_space,
            criteria,
            MatchTarget::Neighbour(proxy.clone()),
        )
    }

    /// Removes a neighbour's proxy subscription.
    pub fn remove_proxy_subscription_match_target(
        &self,
        id: ProxySubscriptionId,
    ) -> KyroResult<()> {
        self.remove_consumer(&RegistrationKey::ProxySubscription(id)).map(|_| ())
    }

    /// Neighbour proxies that would receive `msg`, after access control.
    pub fn retrieve_matching_output_handlers(
        &self,
        topic_space: &str,
        msg: &dyn MessageKey,
    ) -> KyroResult<Vec<ProxySubscription>> {
        self.with_results(topic_space, msg, |view| view.neighbours().to_vec())
    }

    /// Registers an ACL entry on its topic and everything below it.
    pub fn add_topic_acl(&self, acl: &TopicAcl) -> KyroResult<()> {
        let criteria = SelectionCriteria {
            discriminator: acl.registration_discriminator(),
            ..SelectionCriteria::default()
        };
        self.register_consumer(
            RegistrationKey::Acl(acl.id),
            &acl.topic_space,
            &criteria,
            MatchTarget::Acl(acl.clone()),
        )
    }

    /// Removes one ACL entry.
    pub fn remove_topic_acl(&self, id: AclId) -> KyroResult<()> {
        self.remove_consumer(&RegistrationKey::Acl(id)).map(|_| ())
    }

    /// ACL entries governing `discriminator` in `topic_space`.
    pub fn retrieve_matching_topic_acls(
        &self,
        topic_space: &str,
        discriminator: Option<&str>,
    ) -> KyroResult<Vec<TopicAcl>> {
        let key = DiscriminatorKey(discriminator.unwrap_or_default());
        self.with_results(topic_space, &key, |view| view.acls().to_vec())
    }

    /// Drops every ACL entry, typically before reloading them. Returns how
    /// many were removed.
    pub fn remove_all_topic_acls(&self) -> KyroResult<usize> {
        let mut registry = self.lock()?;
        let keys: Vec<RegistrationKey> = registry
            .targets
            .iter()
            .filter(|r| matches!(r.key, RegistrationKey::Acl(_)))
            .map(|r| r.key.clone())
            .collect();
        for key in &keys {
            let record = registry.targets.remove_and_return(key)?;
            Self::unindex(self.space.as_ref(), &mut registry, &record)?;
        }
        debug!(removed = keys.len(), "removed all topic ACLs");
        Ok(keys.len())
    }

    /// Registers an application signature.
    pub fn add_application_signature_match_target(
        &self,
        signature: &ApplicationSignature,
        topic_space: &str,
        criteria: &SelectionCriteria,
    ) -> KyroResult<()> {
        self.register_consumer(
            RegistrationKey::ApplicationSignature(signature.id),
            topic_space,
            criteria,
            MatchTarget::ApplicationSignature(signature.clone()),
        )
    }

    /// Removes an application signature.
    pub fn remove_application_signature_match_target(&self, id: SignatureId) -> KyroResult<()> {
        self.remove_consumer(&RegistrationKey::ApplicationSignature(id))
            .map(|_| ())
    }

    /// Application signatures matching `msg`.
    pub fn retrieve_matching_application_signatures(
        &self,
        topic_space: &str,
        msg: &dyn MessageKey,
    ) -> KyroResult<Vec<ApplicationSignature>> {
        self.with_results(topic_space, msg, |view| view.signatures().to_vec())
    }

    /// Every subscribed dispatcher, once each.
    pub fn all_subscription_targets(&self) -> KyroResult<Vec<ConsumerDispatcher>> {
        self.subscription_targets(|_| true)
    }

    /// Subscribed dispatchers in one topic space, once each.
    pub fn subscription_targets_for_topic_space(
        &self,
        topic_space: &str,
    ) -> KyroResult<Vec<ConsumerDispatcher>> {
        self.subscription_targets(|record| record.topic_space == topic_space)
    }

    fn subscription_targets(
        &self,
        keep: impl Fn(&TargetRecord) -> bool,
    ) -> KyroResult<Vec<ConsumerDispatcher>> {
        let registry = self.lock()?;
        let mut seen = HashSet::new();
        Ok(registry
            .targets
            .iter()
            .filter(|record| keep(record))
            .filter_map(|record| match &record.target {
                MatchTarget::Subscription(cd) if seen.insert(cd.id) => Some(cd.clone()),
                _ => None,
            })
            .collect())
    }

    /// Every registered neighbour proxy.
    pub fn all_proxy_subscription_targets(&self) -> KyroResult<Vec<ProxySubscription>> {
        let registry = self.lock()?;
        Ok(registry
            .targets
            .iter()
            .filter_map(|record| match &record.target {
                MatchTarget::Neighbour(ps) => Some(ps.clone()),
                _ => None,
            })
            .collect())
    }

    // ---------------------------------------------------------------------
    // Consumer-set monitors
    // ---------------------------------------------------------------------

    /// Registers `callback` to hear when consumers of the expression come and
    /// go. Returns whether consumers are present right now.
    pub fn register_consumer_set_monitor(
        &self,
        connection: ConnectionId,
        topic_space: &str,
        discriminator: Option<&str>,
        callback: Arc<dyn ConsumerSetChangeCallback>,
    ) -> KyroResult<bool> {
        let expression = topic::build_add_topic_expression(topic_space, discriminator)?;
        let pattern = TopicPattern::compile(&expression)?;

        let mut registry = self.lock()?;
        registry
            .monitors
            .register_monitor(connection, topic_space, discriminator, pattern, callback)
    }

    /// Removes `callback` for `connection`.
    ///
    /// Fails with `NotPossibleInCurrentConfiguration` if it was never
    /// registered.
    pub fn deregister_consumer_set_monitor(
        &self,
        connection: ConnectionId,
        callback: &Arc<dyn ConsumerSetChangeCallback>,
    ) -> KyroResult<()> {
        let mut registry = self.lock()?;
        registry.monitors.deregister_monitor(connection, callback)
    }

    /// Removes every monitor owned by a closing connection.
    pub fn remove_consumer_set_monitors(&self, connection: ConnectionId) -> KyroResult<()> {
        let mut registry = self.lock()?;
        registry.monitors.remove_all(connection)
    }

    /// Snapshots of the expressions `connection` monitors.
    pub fn monitored_expressions(
        &self,
        connection: ConnectionId,
    ) -> KyroResult<Vec<MonitorSnapshot>> {
        let registry = self.lock()?;
        Ok(registry.monitors.snapshots(connection))
    }

    /// Local and neighbour subscriptions without a selector that may match
    /// the expression.
    pub fn retrieve_non_selector_consumers(
        &self,
        topic_space: &str,
        discriminator: Option<&str>,
    ) -> KyroResult<(Vec<ConsumerDispatcher>, Vec<ProxySubscription>)> {
        let expression = topic::build_add_topic_expression(topic_space, discriminator)?;
        let pattern = TopicPattern::compile(&expression)?;

        let registry = self.lock()?;
        let mut local = Vec::new();
        let mut remote = Vec::new();
        for key in registry.monitors.non_selector_consumers(&pattern) {
            let Some(record) = registry.targets.get(&key) else {
                return Err(KyroError::inconsistency(format!(
                    "categorized consumer {key} has no target record"
                )));
            };
            match &record.target {
                MatchTarget::Subscription(cd) => local.push(cd.clone()),
                MatchTarget::Neighbour(ps) => remote.push(ps.clone()),
                other => {
                    return Err(KyroError::inconsistency(format!(
                        "{key} categorized as a consumer but targets {:?}",
                        other.target_type()
                    )))
                }
            }
        }
        Ok((local, remote))
    }

    // ---------------------------------------------------------------------
    // Search
    // ---------------------------------------------------------------------

    /// Finds every target matching `msg` published in `topic_space`.
    ///
    /// `results` is reset first. Returns the fully qualified topic, which is
    /// what [`SearchResults::results`] expects.
    ///
    /// On a secure bus the traversal is repeated if the ACLs were refreshed
    /// while it ran, up to `max_search_retries` times.
    pub fn search(
        &self,
        topic_space: &str,
        msg: &dyn MessageKey,
        results: &mut SearchResults,
    ) -> KyroResult<String> {
        let topic = topic::build_send_topic_expression(topic_space, msg.discriminator());
        topic::check_event_topic_syntax(&topic)?;

        let mut cache = EvalCache::new();
        if !self.access.is_bus_secure() {
            results.reset();
            self.space.search(&topic, msg, &mut cache, results)?;
            return Ok(topic);
        }

        let retries = self.config.max_search_retries;
        for attempt in 1..=retries {
            let version = self.access.acl_refresh_version();
            results.reset();
            results.set_topic_space(topic_space);
            cache.reset();
            self.space.search(&topic, msg, &mut cache, results)?;
            if self.access.acl_refresh_version() == version {
                return Ok(topic);
            }
            debug!(topic, attempt, "ACLs refreshed during search; retrying");
        }
        warn!(topic, retries, "ACLs kept changing during search; returning last traversal");
        Ok(topic)
    }

    fn with_results<T>(
        &self,
        topic_space: &str,
        msg: &dyn MessageKey,
        extract: impl FnOnce(ResultsView<'_>) -> T,
    ) -> KyroResult<T> {
        let mut results = self.pool.acquire();
        let outcome = self
            .search(topic_space, msg, &mut results)
            .map(|topic| extract(results.results(&topic)));
        self.pool.release(results);
        outcome
    }

    /// Takes a reset [`SearchResults`] from the pool.
    pub fn acquire_search_results(&self) -> SearchResults {
        self.pool.acquire()
    }

    /// Returns a [`SearchResults`] to the pool.
    pub fn release_search_results(&self, results: SearchResults) {
        self.pool.release(results);
    }

    // ---------------------------------------------------------------------
    // Parsing and evaluation
    // ---------------------------------------------------------------------

    /// Validates and compiles a topic expression.
    pub fn parse_discriminator(&self, discriminator: &str) -> KyroResult<TopicPattern> {
        Ok(TopicPattern::compile(discriminator)?)
    }

    /// Parses a selector with the engine's parser.
    pub fn parse_selector(&self, selector: &str, domain: SelectorDomain) -> KyroResult<Selector> {
        self.parse_tree(selector, domain)
    }

    /// Evaluates a parsed discriminator and selector against one message.
    ///
    /// Either side may be absent. An UNKNOWN selector result does not match,
    /// and neither does a hand-built tree deeper than [`MAX_TREE_DEPTH`].
    #[must_use]
    pub fn evaluate_message(
        &self,
        selector: Option<&Selector>,
        discriminator: Option<&TopicPattern>,
        msg: &dyn MessageKey,
    ) -> bool {
        if let Some(pattern) = discriminator {
            if !pattern.matches(msg.discriminator().unwrap_or_default()) {
                return false;
            }
        }
        match selector {
            None => true,
            Some(sel) if sel.depth() > MAX_TREE_DEPTH => {
                warn!(depth = sel.depth(), "selector too deep to evaluate");
                false
            }
            Some(sel) => eval::matches(sel, msg, &mut EvalCache::new()),
        }
    }

    /// Returns true if the discriminator contains wildcards.
    #[must_use]
    pub fn is_wildcarded(&self, discriminator: Option<&str>) -> bool {
        topic::is_wildcarded(discriminator)
    }

    /// Returns true if `full_topic` matches the expression `wildcard_topic`.
    pub fn evaluate_discriminator(
        &self,
        full_topic: &str,
        wildcard_topic: &str,
    ) -> KyroResult<bool> {
        let pattern = TopicPattern::compile(wildcard_topic)?;
        self.evaluate_discriminator_with(full_topic, &pattern)
    }

    /// Like [`Self::evaluate_discriminator`], reusing a pattern compiled
    /// earlier with [`Self::parse_discriminator`].
    pub fn evaluate_discriminator_with(
        &self,
        full_topic: &str,
        pattern: &TopicPattern,
    ) -> KyroResult<bool> {
        topic::check_event_topic_syntax(full_topic)?;
        Ok(pattern.matches(full_topic))
    }

    /// The fully qualified prefix preceding the first wildcard.
    #[must_use]
    pub fn retrieve_non_wildcard_stem(&self, topic: &str) -> String {
        topic::retrieve_non_wildcard_stem(topic)
    }

    /// Number of live registrations.
    pub fn registration_count(&self) -> KyroResult<usize> {
        Ok(self.lock()?.targets.len())
    }
}
