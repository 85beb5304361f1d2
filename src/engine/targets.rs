//! Registration records keyed by [`RegistrationKey`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RegistrationError;
use crate::matchspace::Conjunction;
use crate::target::{MatchTarget, RegistrationKey};
use crate::topic::TopicPattern;

/// Everything needed to undo one registration.
#[derive(Debug)]
pub(crate) struct TargetRecord {
    pub key: RegistrationKey,
    pub target: MatchTarget,
    /// Exactly the conjunctions added to the match space for this target.
    pub conjunctions: Vec<Arc<Conjunction>>,
    pub topic_space: String,
    pub pattern: TopicPattern,
}

/// Live registrations. Guarded by the engine's registry lock.
#[derive(Debug, Default)]
pub(crate) struct TargetRegistry {
    records: HashMap<RegistrationKey, TargetRecord>,
}

impl TargetRegistry {
    pub fn contains(&self, key: &RegistrationKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn get(&self, key: &RegistrationKey) -> Option<&TargetRecord> {
        self.records.get(key)
    }

    pub fn put(&mut self, record: TargetRecord) -> Result<(), RegistrationError> {
        if self.records.contains_key(&record.key) {
            return Err(RegistrationError::DuplicateKey {
                key: record.key.to_string(),
            });
        }
        self.records.insert(record.key.clone(), record);
        Ok(())
    }

    pub fn remove_and_return(
        &mut self,
        key: &RegistrationKey,
    ) -> Result<TargetRecord, RegistrationError> {
        self.records
            .remove(key)
            .ok_or_else(|| RegistrationError::NotFound { key: key.to_string() })
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
