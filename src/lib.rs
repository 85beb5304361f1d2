//! # kyromatch - Topic matching for publish/subscribe buses
//!
//! kyromatch decides, for every published message, which registered parties
//! receive it. Registrations pair a topic expression (with `*` and `//`
//! wildcards) and an optional SQL-style selector with a target: a local
//! subscription, a consumer point, a neighbouring bus, an ACL entry or an
//! application signature.
//!
//! ## Core Concepts
//!
//! - **Topic space**: the namespace a topic lives in; expressions are rooted at it
//! - **Conjunction**: one AND-clause of a registration after DNF expansion
//! - **SearchResults**: per-search accumulator, post-processed per target type
//! - **Consumer-set monitor**: a callback told when an expression's consumers
//!   go from none to some, or back
//!
//! ## Usage
//!
//! ```
//! use kyromatch::{
//!     ConsumerPoint, MatchingConfig, MatchingEngine, Message, SelectionCriteria, SelectorDomain,
//! };
//!
//! let engine = MatchingEngine::new(MatchingConfig::default());
//! let consumer = ConsumerPoint::new("orders-eu");
//! let criteria = SelectionCriteria::topic("orders/*")
//!     .with_selector("region = 'emea'", SelectorDomain::Jms);
//! engine.add_consumer_point_match_target(&consumer, "shop", &criteria)?;
//!
//! let msg = Message::new("orders/new").with_property("region", "emea");
//! let matched = engine.retrieve_matching_consumer_points("shop", &msg)?;
//! assert_eq!(matched, vec![consumer]);
//! # Ok::<(), kyromatch::KyroError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod message;
pub mod target;
pub mod topic;
pub mod value;

// Selectors and access control
pub mod acl;
pub mod security;
pub mod selector;

// Matching
pub mod config;
pub mod engine;
pub mod matchspace;
pub mod monitor;
pub mod search;

// Re-export primary types at crate root for convenience
pub use acl::{AccumulatedAcl, AclId, AclOperation, GroupDirectory, Principal, TopicAcl};
pub use config::MatchingConfig;
pub use engine::MatchingEngine;
pub use error::{KyroError, KyroResult, RegistrationError, SyntaxError};
pub use matchspace::{Conjunction, InMemoryMatchSpace, MatchSpace};
pub use message::{DiscriminatorKey, Message, MessageKey};
pub use monitor::{ConnectionId, ConsumerSetChangeCallback, MonitorSnapshot};
pub use search::{ResultsView, SearchResults, SearchResultsPool};
pub use security::{AccessChecker, InsecureBus, StaticAccessChecker};
pub use selector::{Selector, SelectorDomain, SelectorParser, SqlSelectorParser};
pub use target::{
    ApplicationSignature, ConsumerDispatcher, ConsumerPoint, ConsumerPointId, DispatcherId,
    MatchTarget, ProxySubscription, ProxySubscriptionId, RegistrationKey, SelectionCriteria,
    SignatureId, TargetType,
};
pub use topic::TopicPattern;
pub use value::Value;
