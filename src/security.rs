//! Bus security as seen by the matcher.
//!
//! The matcher does not own authentication or ACL administration. It asks an
//! [`AccessChecker`] whether the bus is secure, which ACL generation is
//! current, and whether a user may subscribe given the ACLs a search found.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::acl::{AccumulatedAcl, AclOperation, GroupDirectory};

/// Security collaborator consulted during search.
pub trait AccessChecker: Send + Sync {
    /// Returns true if the bus enforces access control.
    fn is_bus_secure(&self) -> bool;

    /// Monotonic ACL generation. Bumped whenever ACLs are reloaded.
    fn acl_refresh_version(&self) -> u64;

    /// Returns true if `user_id` may subscribe to `topic` in `topic_space`.
    fn check_subscribe_permission(
        &self,
        topic_space: &str,
        topic: &str,
        user_id: Option<&str>,
        acl: &AccumulatedAcl,
    ) -> bool;
}

/// A bus with security switched off. Everything is permitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsecureBus;

impl AccessChecker for InsecureBus {
    fn is_bus_secure(&self) -> bool {
        false
    }

    fn acl_refresh_version(&self) -> u64 {
        0
    }

    fn check_subscribe_permission(
        &self,
        _topic_space: &str,
        _topic: &str,
        _user_id: Option<&str>,
        _acl: &AccumulatedAcl,
    ) -> bool {
        true
    }
}

/// In-memory security settings with a static group directory.
#[derive(Debug, Default)]
pub struct StaticAccessChecker {
    secure: AtomicBool,
    version: AtomicU64,
    memberships: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticAccessChecker {
    /// Creates a checker with the given security setting.
    #[must_use]
    pub fn new(secure: bool) -> Self {
        Self {
            secure: AtomicBool::new(secure),
            ..Self::default()
        }
    }

    /// Turns bus security on or off.
    pub fn set_secure(&self, secure: bool) {
        self.secure.store(secure, Ordering::SeqCst);
    }

    /// Signals that ACLs were reloaded; in-flight searches will retry.
    pub fn refresh_acls(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Records that `member` (a user or a group) belongs to `group`.
    pub fn add_membership(&self, member: impl Into<String>, group: impl Into<String>) {
        let mut memberships = self
            .memberships
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        memberships.entry(member.into()).or_default().push(group.into());
    }
}

impl GroupDirectory for StaticAccessChecker {
    fn groups_of(&self, member: &str) -> Vec<String> {
        self.memberships
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(member)
            .cloned()
            .unwrap_or_default()
    }
}

impl AccessChecker for StaticAccessChecker {
    fn is_bus_secure(&self) -> bool {
        self.secure.load(Ordering::SeqCst)
    }

    fn acl_refresh_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn check_subscribe_permission(
        &self,
        _topic_space: &str,
        _topic: &str,
        user_id: Option<&str>,
        acl: &AccumulatedAcl,
    ) -> bool {
        if !self.is_bus_secure() {
            return true;
        }
        acl.check_permission(user_id, AclOperation::Subscribe, self)
    }
}
