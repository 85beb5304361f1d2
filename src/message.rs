//! Messages as seen by the matcher.
//!
//! The matcher never inspects a message body. It needs the discriminator (the
//! published topic) and named properties for selector evaluation, which is all
//! `MessageKey` exposes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Read-only view of a message used during matching.
pub trait MessageKey: Send + Sync {
    /// The topic the message was published on, relative to its topic space.
    fn discriminator(&self) -> Option<&str>;

    /// Looks up a named property. `None` means the property is absent.
    fn property(&self, name: &str) -> Option<Value>;
}

/// A simple in-memory message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Topic relative to the topic space; `None` is the space root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    /// Named properties visible to selectors.
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

impl Message {
    /// Creates a message published on the given discriminator.
    #[must_use]
    pub fn new(discriminator: impl Into<String>) -> Self {
        Self {
            discriminator: Some(discriminator.into()),
            properties: HashMap::new(),
        }
    }

    /// Creates a message with no discriminator (published at the topic space root).
    #[must_use]
    pub fn at_root() -> Self {
        Self::default()
    }

    /// Sets a property, returning the message for chaining.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

impl MessageKey for Message {
    fn discriminator(&self) -> Option<&str> {
        self.discriminator.as_deref()
    }

    fn property(&self, name: &str) -> Option<Value> {
        self.properties.get(name).cloned()
    }
}

/// A property-less key carrying only a discriminator.
///
/// Used for topic-only evaluations such as monitor registration, where there
/// is no real message to match against.
#[derive(Debug, Clone, Copy)]
pub struct DiscriminatorKey<'a>(pub &'a str);

impl MessageKey for DiscriminatorKey<'_> {
    fn discriminator(&self) -> Option<&str> {
        Some(self.0)
    }

    fn property(&self, _name: &str) -> Option<Value> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_properties_round_trip() {
        let msg = Message::new("sport/football")
            .with_property("priority", 4)
            .with_property("region", "emea");
        assert_eq!(msg.discriminator(), Some("sport/football"));
        assert_eq!(msg.property("priority"), Some(Value::Int(4)));
        assert_eq!(msg.property("missing"), None);
    }

    #[test]
    fn discriminator_key_has_no_properties() {
        let key = DiscriminatorKey("a/b");
        assert_eq!(key.discriminator(), Some("a/b"));
        assert_eq!(key.property("anything"), None);
    }
}
