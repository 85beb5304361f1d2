//! Engine configuration.

use serde::Deserialize;

use crate::error::{KyroError, KyroResult};

/// Matching engine configuration.
///
/// Every field has a default, so a JSON document only needs the keys it
/// overrides:
///
/// ```
/// use kyromatch::MatchingConfig;
///
/// let cfg = MatchingConfig::from_json(r#"{ "callback_workers": 4 }"#).unwrap();
/// assert_eq!(cfg.callback_workers, 4);
/// assert_eq!(cfg.callback_queue_capacity, 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchingConfig {
    /// Threads delivering consumer-set-change callbacks.
    pub callback_workers: usize,
    /// Maximum queued callback deliveries before submissions are dropped.
    pub callback_queue_capacity: usize,
    /// Search traversals attempted before returning a possibly stale result
    /// when ACLs keep changing underneath.
    pub max_search_retries: usize,
    /// Reset `SearchResults` objects kept for reuse.
    pub search_results_pool_capacity: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            callback_workers: 2,
            callback_queue_capacity: 1024,
            max_search_retries: 16,
            search_results_pool_capacity: 32,
        }
    }
}

impl MatchingConfig {
    /// Parses a configuration from JSON. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> KyroResult<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| KyroError::Config {
            message: e.to_string(),
        })?;
        Ok(cfg.clamped())
    }

    /// Returns a copy with every size that must be positive raised to at least one.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            callback_workers: self.callback_workers.max(1),
            callback_queue_capacity: self.callback_queue_capacity.max(1),
            max_search_retries: self.max_search_retries.max(1),
            search_results_pool_capacity: self.search_results_pool_capacity,
        }
    }
}
