//! Recycling of `SearchResults` between searches.

use std::sync::{Arc, Mutex};

use crate::security::AccessChecker;

use super::SearchResults;

/// A bounded free-list of reset [`SearchResults`].
pub struct SearchResultsPool {
    access: Arc<dyn AccessChecker>,
    capacity: usize,
    free: Mutex<Vec<SearchResults>>,
}

impl std::fmt::Debug for SearchResultsPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchResultsPool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

impl SearchResultsPool {
    /// Creates a pool keeping at most `capacity` idle objects.
    #[must_use]
    pub fn new(access: Arc<dyn AccessChecker>, capacity: usize) -> Self {
        Self {
            access,
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Takes a reset object from the pool, or creates one.
    pub fn acquire(&self) -> SearchResults {
        let pooled = self.free.lock().ok().and_then(|mut free| free.pop());
        pooled.unwrap_or_else(|| SearchResults::new(Arc::clone(&self.access)))
    }

    /// Resets `results` and returns it to the pool unless the pool is full.
    pub fn release(&self, mut results: SearchResults) {
        results.reset();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.capacity {
                free.push(results);
            }
        }
    }

    /// Number of idle objects.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().map_or(0, |free| free.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::InsecureBus;
    use crate::target::{ConsumerPoint, MatchTarget, TargetType};

    #[test]
    fn released_results_come_back_reset() {
        let pool = SearchResultsPool::new(Arc::new(InsecureBus), 2);
        let mut r = pool.acquire();
        r.accumulate(TargetType::Consumer, &[&MatchTarget::Consumer(ConsumerPoint::new("cp"))]);
        pool.release(r);
        assert_eq!(pool.available(), 1);

        let r = pool.acquire();
        assert!(r.is_empty());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = SearchResultsPool::new(Arc::new(InsecureBus), 1);
        pool.release(pool.acquire());
        pool.release(SearchResults::new(Arc::new(InsecureBus)));
        assert_eq!(pool.available(), 1);

        let empty = SearchResultsPool::new(Arc::new(InsecureBus), 0);
        empty.release(empty.acquire());
        assert_eq!(empty.available(), 0);
    }
}
