//! Consumer-set monitoring.
//!
//! Clients register a callback on a topic expression and are told when the
//! set of consumers matching it becomes non-empty or empty. Registration and
//! consumer churn update the [`ConsumerMonitorRegistry`] synchronously; the
//! callbacks themselves run on the [`CallbackDispatcher`] worker pool.

/// Callback trait, connection ids and transition coalescing.
pub mod callback;
/// Worker pool delivering callbacks.
pub mod dispatcher;
/// Consumer categorization by topic expression.
pub mod registrar;
/// Monitored expressions and their consumers.
pub mod registry;

pub use callback::{ConnectionId, ConsumerSetChangeCallback, WrappedCallback};
pub use dispatcher::CallbackDispatcher;
pub use registrar::{SubscriptionRegistrar, TopicExpressionCategory};
pub use registry::{ConsumerMonitorRegistry, MonitorSnapshot};
