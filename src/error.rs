//! Error types for kyromatch.
//!
//! All errors are strongly typed using thiserror. Caller mistakes (bad topic or
//! selector syntax, unknown registrations) are kept apart from internal
//! inconsistencies, which indicate a bookkeeping bug and are never retried.

use thiserror::Error;

/// Syntax errors in topic expressions or selector strings.
///
/// These are always caller errors. They are raised before any registry state is
/// touched, so a failed registration leaves nothing behind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    /// A topic or topic expression is malformed.
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic {
        /// The rejected text.
        topic: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Topics are relative to their topic space and never start with `/`.
    #[error("Topic '{topic}' must not begin with a level separator")]
    LeadingSeparator {
        /// The rejected topic.
        topic: String,
    },

    /// A published topic contained `*` or `//`.
    #[error("Wildcards are not allowed in a published topic: '{topic}'")]
    WildcardInEventTopic {
        /// The published topic.
        topic: String,
    },

    /// The selector failed to parse, or nests too deeply.
    #[error("Invalid selector '{selector}' at offset {offset}: {reason}")]
    InvalidSelector {
        /// The selector text.
        selector: String,
        /// Byte offset of the offending token.
        offset: usize,
        /// What the parser expected.
        reason: String,
    },

    /// The selector is valid but splits into too many conjunctions.
    #[error("Selector '{selector}' expands to more than {max} conjunctions")]
    SelectorTooComplex {
        /// The selector text.
        selector: String,
        /// The conjunction bound.
        max: usize,
    },
}

/// Errors raised by the registration surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Removal of a key that is not registered.
    #[error("No registration found for key {key}")]
    NotFound {
        /// The registration key, rendered.
        key: String,
    },

    /// Registration of a key that is already live.
    #[error("A registration already exists for key {key}")]
    DuplicateKey {
        /// The registration key, rendered.
        key: String,
    },

    /// The request names state that does not exist, such as an unknown
    /// monitor callback.
    #[error("Operation not possible in the current configuration: {reason}")]
    NotPossibleInCurrentConfiguration {
        /// Why.
        reason: String,
    },
}

/// Top-level error type for kyromatch.
#[derive(Debug, Error)]
pub enum KyroError {
    /// Bad topic or selector syntax.
    #[error("Syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    /// Registration lookup failures.
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// A registry invariant was violated. This is a bug in registration
    /// bookkeeping, not bad input.
    #[error("Internal inconsistency: {message}")]
    InternalInconsistency {
        /// What was found out of step.
        message: String,
    },

    /// Unexpected failure, such as a poisoned lock.
    #[error("Internal error: {message}")]
    Internal {
        /// Details.
        message: String,
    },

    /// Configuration could not be loaded.
    #[error("Invalid configuration: {message}")]
    Config {
        /// Details.
        message: String,
    },
}

impl KyroError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an internal-inconsistency error and logs it with full context.
    #[must_use]
    pub fn inconsistency(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "matching registry inconsistency detected");
        Self::InternalInconsistency { message }
    }

    /// Returns true if this is a syntax error.
    #[must_use]
    pub const fn is_syntax(&self) -> bool {
        matches!(self, Self::Syntax(_))
    }

    /// Returns true if this is a registration error.
    #[must_use]
    pub const fn is_registration(&self) -> bool {
        matches!(self, Self::Registration(_))
    }

    /// Returns true if the registry bookkeeping is corrupt.
    #[must_use]
    pub const fn is_inconsistency(&self) -> bool {
        matches!(self, Self::InternalInconsistency { .. })
    }

    /// Returns true if the configuration could not be loaded.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the caller asked for something the current
    /// registrations cannot satisfy.
    #[must_use]
    pub const fn is_not_possible(&self) -> bool {
        matches!(
            self,
            Self::Registration(RegistrationError::NotPossibleInCurrentConfiguration { .. })
        )
    }

    /// Returns true if this error is retryable.
    ///
    /// Nothing raised by the matching engine is retryable: syntax and
    /// registration errors won't change on retry, and inconsistencies are fatal.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        false
    }
}

/// Result type alias for kyromatch operations.
pub type KyroResult<T> = Result<T, KyroError>;

pub(crate) fn lock_err(context: &'static str) -> KyroError {
    KyroError::internal(format!("poisoned lock: {context}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_leading_separator() {
        let err = SyntaxError::LeadingSeparator {
            topic: "/a/b".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("/a/b"));
        assert!(msg.contains("level separator"));
    }

    #[test]
    fn test_syntax_error_selector_offset() {
        let err = SyntaxError::InvalidSelector {
            selector: "a = ".to_string(),
            offset: 4,
            reason: "unexpected end of input".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("offset 4"));
        assert!(msg.contains("unexpected end"));
    }

    #[test]
    fn test_kyro_error_from_syntax() {
        let err: KyroError = SyntaxError::InvalidTopic {
            topic: "a//".to_string(),
            reason: "dangling".to_string(),
        }
        .into();
        assert!(err.is_syntax());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_kyro_error_not_possible() {
        let err: KyroError = RegistrationError::NotPossibleInCurrentConfiguration {
            reason: "callback not registered".to_string(),
        }
        .into();
        assert!(err.is_registration());
        assert!(err.is_not_possible());
    }

    #[test]
    fn test_kyro_error_inconsistency() {
        let err = KyroError::inconsistency("consumer missing from bucket");
        assert!(err.is_inconsistency());
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("consumer missing"));
    }

    #[test]
    fn test_lock_err() {
        let err = lock_err("registry");
        assert!(err.is_internal());
        assert!(format!("{err}").contains("registry"));
    }
}
