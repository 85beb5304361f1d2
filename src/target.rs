//! Match targets and registration keys.
//!
//! A match target is whatever a registration delivers to when a message
//! matches: a local subscription's dispatcher, a consumer point, a proxy
//! subscription on behalf of a neighbouring bus, an ACL entry, or an
//! application signature. The set is closed; search result handlers are
//! dispatched by [`TargetType`] in a fixed order.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::acl::{AclId, TopicAcl};
use crate::selector::SelectorDomain;

/// Unique identifier for a consumer dispatcher.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatcherId(Uuid);

impl DispatcherId {
    /// Create a new random dispatcher id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DispatcherId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a consumer point.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerPointId(Uuid);

impl ConsumerPointId {
    /// Create a new random consumer point id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConsumerPointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a proxy subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxySubscriptionId(Uuid);

impl ProxySubscriptionId {
    /// Create a new random proxy subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ProxySubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProxySubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an application signature.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureId(Uuid);

impl SignatureId {
    /// Create a new random signature id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SignatureId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SignatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatcher for a local subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerDispatcher {
    pub id: DispatcherId,
    pub subscription_name: String,
    pub topic_space: String,
    pub durable: bool,
}

impl ConsumerDispatcher {
    /// Creates a non-durable dispatcher.
    #[must_use]
    pub fn new(subscription_name: impl Into<String>, topic_space: impl Into<String>) -> Self {
        Self {
            id: DispatcherId::new(),
            subscription_name: subscription_name.into(),
            topic_space: topic_space.into(),
            durable: false,
        }
    }

    /// Marks the dispatcher durable.
    #[must_use]
    pub const fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

/// A point-to-point consumer attached to a destination.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerPoint {
    pub id: ConsumerPointId,
    pub name: String,
}

impl ConsumerPoint {
    /// Creates a consumer point.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ConsumerPointId::new(),
            name: name.into(),
        }
    }
}

/// A subscription held on behalf of a neighbouring bus.
///
/// A proxy from a foreign secured bus carries the subscribing user's identity;
/// searches on a secure bus drop it unless that user may subscribe.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySubscription {
    pub id: ProxySubscriptionId,
    pub neighbour: String,
    pub foreign_secured: bool,
    pub me_sub_user_id: Option<String>,
}

impl ProxySubscription {
    /// Creates a proxy for a neighbour on an unsecured (or local) bus.
    #[must_use]
    pub fn new(neighbour: impl Into<String>) -> Self {
        Self {
            id: ProxySubscriptionId::new(),
            neighbour: neighbour.into(),
            foreign_secured: false,
            me_sub_user_id: None,
        }
    }

    /// Creates a proxy from a foreign secured bus subscribing as `user_id`.
    #[must_use]
    pub fn foreign_secured(neighbour: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            id: ProxySubscriptionId::new(),
            neighbour: neighbour.into(),
            foreign_secured: true,
            me_sub_user_id: user_id,
        }
    }
}

/// An application signature registered for message classification.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSignature {
    pub id: SignatureId,
    pub name: String,
}

impl ApplicationSignature {
    /// Creates an application signature.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: SignatureId::new(),
            name: name.into(),
        }
    }
}

/// Result slot for each kind of target.
///
/// The discriminant is the handler table index. Post-processing runs in this
/// order and later slots may read earlier ones.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetType {
    Acl = 0,
    Subscription = 1,
    Consumer = 2,
    Neighbour = 3,
    ApplicationSignature = 4,
}

impl TargetType {
    /// Number of target types.
    pub const COUNT: usize = 5;

    /// All target types in post-processing order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Acl,
        Self::Subscription,
        Self::Consumer,
        Self::Neighbour,
        Self::ApplicationSignature,
    ];

    /// Slot index in the handler table.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// A registered target.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchTarget {
    Acl(TopicAcl),
    Subscription(ConsumerDispatcher),
    Consumer(ConsumerPoint),
    Neighbour(ProxySubscription),
    ApplicationSignature(ApplicationSignature),
}

impl MatchTarget {
    /// The result slot this target accumulates into.
    #[must_use]
    pub const fn target_type(&self) -> TargetType {
        match self {
            Self::Acl(_) => TargetType::Acl,
            Self::Subscription(_) => TargetType::Subscription,
            Self::Consumer(_) => TargetType::Consumer,
            Self::Neighbour(_) => TargetType::Neighbour,
            Self::ApplicationSignature(_) => TargetType::ApplicationSignature,
        }
    }

    /// The payload's identity.
    #[must_use]
    pub fn id(&self) -> Uuid {
        match self {
            Self::Acl(acl) => acl.id.as_uuid(),
            Self::Subscription(cd) => cd.id.0,
            Self::Consumer(cp) => cp.id.0,
            Self::Neighbour(ps) => ps.id.0,
            Self::ApplicationSignature(sig) => sig.id.0,
        }
    }

    /// Returns true if consumer-set monitors track this target.
    ///
    /// Only local subscriptions and neighbour proxies count as consumers of a
    /// topic for monitoring purposes.
    #[must_use]
    pub const fn is_monitored_consumer(&self) -> bool {
        matches!(self, Self::Subscription(_) | Self::Neighbour(_))
    }
}

/// Topic and selector supplied with a registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SelectionCriteria {
    /// Topic relative to the topic space. `None` selects the whole space.
    pub discriminator: Option<String>,
    /// Selector over message properties. Blank means none.
    pub selector: Option<String>,
    /// Language `selector` is written in.
    pub domain: SelectorDomain,
}

impl SelectionCriteria {
    /// Criteria for a topic with no selector.
    #[must_use]
    pub fn topic(discriminator: impl Into<String>) -> Self {
        Self {
            discriminator: Some(discriminator.into()),
            ..Self::default()
        }
    }

    /// Criteria covering the whole topic space.
    #[must_use]
    pub fn whole_space() -> Self {
        Self::default()
    }

    /// Adds a selector.
    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>, domain: SelectorDomain) -> Self {
        self.selector = Some(selector.into());
        self.domain = domain;
        self
    }

    /// The selector text, if it is present and not blank.
    #[must_use]
    pub fn effective_selector(&self) -> Option<&str> {
        self.selector.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Identifies a registration for removal.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegistrationKey {
    /// A dispatcher may subscribe more than once with different criteria.
    Subscription {
        dispatcher: DispatcherId,
        criteria: SelectionCriteria,
    },
    ConsumerPoint(ConsumerPointId),
    ProxySubscription(ProxySubscriptionId),
    Acl(AclId),
    ApplicationSignature(SignatureId),
}

impl fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscription {
                dispatcher,
                criteria,
            } => write!(
                f,
                "subscription {dispatcher} [{} | {}]",
                criteria.discriminator.as_deref().unwrap_or("<all>"),
                criteria.selector.as_deref().unwrap_or("")
            ),
            Self::ConsumerPoint(id) => write!(f, "consumer point {id}"),
            Self::ProxySubscription(id) => write!(f, "proxy subscription {id}"),
            Self::Acl(id) => write!(f, "acl {id}"),
            Self::ApplicationSignature(id) => write!(f, "application signature {id}"),
        }
    }
}
