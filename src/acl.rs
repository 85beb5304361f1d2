//! Topic access control.
//!
//! ACL entries are registered as match targets like any other. A search on a
//! topic returns every ACL on the topic's ancestors (an ACL on `a` covers `a`
//! and everything below it), which are then folded root-to-leaf into an
//! [`AccumulatedAcl`].
//!
//! An entry with no principal is an inheritance blocker: it discards whatever
//! was granted above it for that operation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::topic::{DESCENDANTS_SUFFIX, SEPARATOR};

/// Special group every principal belongs to, authenticated or not.
pub const EVERYONE: &str = "Everyone";
/// Special group every authenticated principal belongs to.
pub const ALL_AUTHENTICATED: &str = "AllAuthenticated";

/// Unique identifier for an ACL entry.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AclId(Uuid);

impl AclId {
    /// Create a new random ACL id.
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

impl Default for AclId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AclId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who an ACL entry grants to.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Principal {
    User(String),
    Group(String),
}

/// Operation an ACL entry governs.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclOperation {
    Publish,
    Subscribe,
}

/// An access-control entry on a topic.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicAcl {
    pub id: AclId,
    pub topic_space: String,
    /// Topic relative to the topic space; `None` is the topic space root.
    pub topic: Option<String>,
    /// `None` blocks inheritance from ancestor levels.
    pub principal: Option<Principal>,
    pub operation: AclOperation,
}

impl TopicAcl {
    /// Creates an ACL entry.
    #[must_use]
    pub fn new(
        topic_space: impl Into<String>,
        topic: Option<&str>,
        principal: Option<Principal>,
        operation: AclOperation,
    ) -> Self {
        Self {
            id: AclId::new(),
            topic_space: topic_space.into(),
            topic: topic.map(str::to_string),
            principal,
            operation,
        }
    }

    /// The discriminator this entry is registered under: its topic and
    /// everything below. A root entry covers the whole topic space.
    #[must_use]
    pub fn registration_discriminator(&self) -> Option<String> {
        self.topic.as_ref().map(|t| format!("{t}{DESCENDANTS_SUFFIX}"))
    }

    /// Depth of the entry's topic below the topic space root.
    #[must_use]
    pub fn level(&self) -> usize {
        self.topic
            .as_deref()
            .filter(|t| !t.is_empty())
            .map_or(0, |t| t.split(SEPARATOR).count())
    }
}

/// Resolves group membership for permission checks.
pub trait GroupDirectory {
    /// Groups that `member` (a user or a group) belongs to directly.
    fn groups_of(&self, member: &str) -> Vec<String>;
}

/// A directory in which nobody belongs to any group.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGroups;

impl GroupDirectory for NoGroups {
    fn groups_of(&self, _member: &str) -> Vec<String> {
        Vec::new()
    }
}

impl GroupDirectory for HashMap<String, Vec<String>> {
    fn groups_of(&self, member: &str) -> Vec<String> {
        self.get(member).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Grants {
    users: HashSet<String>,
    groups: HashSet<String>,
}

impl Grants {
    fn clear(&mut self) {
        self.users.clear();
        self.groups.clear();
    }

    fn grant(&mut self, principal: &Principal) {
        match principal {
            Principal::User(u) => {
                self.users.insert(u.clone());
            }
            Principal::Group(g) => {
                self.groups.insert(g.clone());
            }
        }
    }
}

/// Publish and subscribe grants accumulated down a topic's ancestry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccumulatedAcl {
    publish: Grants,
    subscribe: Grants,
}

impl AccumulatedAcl {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards all accumulated grants for reuse.
    pub fn reset(&mut self) {
        self.publish.clear();
        self.subscribe.clear();
    }

    /// Builds an accumulator from unordered matched ACLs, folding by level.
    #[must_use]
    pub fn from_matched(acls: &[TopicAcl]) -> Self {
        let mut acc = Self::new();
        acc.fold_matched(acls);
        acc
    }

    /// Folds unordered matched ACLs root-to-leaf into this accumulator.
    pub fn fold_matched(&mut self, acls: &[TopicAcl]) {
        let mut by_level: Vec<&TopicAcl> = acls.iter().collect();
        by_level.sort_by_key(|a| a.level());

        let mut start = 0;
        while start < by_level.len() {
            let level = by_level[start].level();
            let end = by_level[start..]
                .iter()
                .position(|a| a.level() != level)
                .map_or(by_level.len(), |p| start + p);
            let entries: Vec<TopicAcl> =
                by_level[start..end].iter().map(|a| (*a).clone()).collect();
            self.consolidate(&entries);
            start = end;
        }
    }

    /// Folds one topic level's entries into the accumulated grants.
    ///
    /// Must be called root first. A principal-less entry for an operation
    /// clears what was accumulated for that operation before this level's
    /// own grants are added.
    pub fn consolidate(&mut self, level_acls: &[TopicAcl]) {
        for op in [AclOperation::Publish, AclOperation::Subscribe] {
            let grants = match op {
                AclOperation::Publish => &mut self.publish,
                AclOperation::Subscribe => &mut self.subscribe,
            };
            let entries = level_acls.iter().filter(|a| a.operation == op);

            if entries.clone().any(|a| a.principal.is_none()) {
                grants.clear();
            }
            for principal in entries.filter_map(|a| a.principal.as_ref()) {
                grants.grant(principal);
            }
        }
    }

    /// Checks whether `user` may perform `op`.
    ///
    /// `None` is an unauthenticated principal. Checks run in order and the
    /// first hit wins: `Everyone`, authentication, direct user grant,
    /// `AllAuthenticated`, then group membership resolved transitively
    /// through `directory`.
    pub fn check_permission(
        &self,
        user: Option<&str>,
        op: AclOperation,
        directory: &dyn GroupDirectory,
    ) -> bool {
        let grants = match op {
            AclOperation::Publish => &self.publish,
            AclOperation::Subscribe => &self.subscribe,
        };

        if grants.groups.contains(EVERYONE) {
            return true;
        }
        let Some(user) = user else {
            return false;
        };
        if grants.users.contains(user) {
            return true;
        }
        if grants.groups.contains(ALL_AUTHENTICATED) {
            return true;
        }
        if grants.groups.is_empty() {
            return false;
        }

        // Groups may nest and may form cycles.
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = directory.groups_of(user).into();
        while let Some(group) = queue.pop_front() {
            if !seen.insert(group.clone()) {
                continue;
            }
            if grants.groups.contains(&group) {
                return true;
            }
            queue.extend(directory.groups_of(&group));
        }
        false
    }

    /// Returns true if nothing is granted for `op`.
    #[must_use]
    pub fn is_empty(&self, op: AclOperation) -> bool {
        let grants = match op {
            AclOperation::Publish => &self.publish,
            AclOperation::Subscribe => &self.subscribe,
        };
        grants.users.is_empty() && grants.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> Option<Principal> {
        Some(Principal::User(name.to_string()))
    }

    fn group(name: &str) -> Option<Principal> {
        Some(Principal::Group(name.to_string()))
    }

    fn acl(topic: Option<&str>, principal: Option<Principal>, op: AclOperation) -> TopicAcl {
        TopicAcl::new("ts", topic, principal, op)
    }

    #[test]
    fn inheritance_blocker_clears_ancestors_only() {
        let mut acc = AccumulatedAcl::new();
        acc.consolidate(&[acl(Some("a"), user("alice"), AclOperation::Publish)]);
        acc.consolidate(&[acl(Some("a/b"), None, AclOperation::Publish)]);
        acc.consolidate(&[acl(Some("a/b/c"), user("bob"), AclOperation::Publish)]);

        assert!(!acc.check_permission(Some("alice"), AclOperation::Publish, &NoGroups));
        assert!(acc.check_permission(Some("bob"), AclOperation::Publish, &NoGroups));
    }

    #[test]
    fn blocker_applies_per_operation() {
        let mut acc = AccumulatedAcl::new();
        acc.consolidate(&[
            acl(Some("a"), user("alice"), AclOperation::Publish),
            acl(Some("a"), user("alice"), AclOperation::Subscribe),
        ]);
        acc.consolidate(&[acl(Some("a/b"), None, AclOperation::Publish)]);

        assert!(!acc.check_permission(Some("alice"), AclOperation::Publish, &NoGroups));
        assert!(acc.check_permission(Some("alice"), AclOperation::Subscribe, &NoGroups));
    }

    #[test]
    fn blocker_keeps_same_level_grants() {
        let mut acc = AccumulatedAcl::new();
        acc.consolidate(&[acl(None, user("alice"), AclOperation::Subscribe)]);
        acc.consolidate(&[
            acl(Some("x"), None, AclOperation::Subscribe),
            acl(Some("x"), user("carol"), AclOperation::Subscribe),
        ]);
        assert!(!acc.check_permission(Some("alice"), AclOperation::Subscribe, &NoGroups));
        assert!(acc.check_permission(Some("carol"), AclOperation::Subscribe, &NoGroups));
    }

    #[test]
    fn everyone_allows_unauthenticated() {
        let mut acc = AccumulatedAcl::new();
        acc.consolidate(&[acl(None, group(EVERYONE), AclOperation::Subscribe)]);
        assert!(acc.check_permission(None, AclOperation::Subscribe, &NoGroups));
    }

    #[test]
    fn unauthenticated_is_denied_otherwise() {
        let mut acc = AccumulatedAcl::new();
        acc.consolidate(&[acl(None, group(ALL_AUTHENTICATED), AclOperation::Subscribe)]);
        assert!(!acc.check_permission(None, AclOperation::Subscribe, &NoGroups));
        assert!(acc.check_permission(Some("anyone"), AclOperation::Subscribe, &NoGroups));
    }

    #[test]
    fn nested_groups_resolve_with_cycles() {
        let mut dir: HashMap<String, Vec<String>> = HashMap::new();
        dir.insert("dave".into(), vec!["devs".into()]);
        dir.insert("devs".into(), vec!["staff".into()]);
        dir.insert("staff".into(), vec!["devs".into()]);

        let mut acc = AccumulatedAcl::new();
        acc.consolidate(&[acl(None, group("staff"), AclOperation::Publish)]);
        assert!(acc.check_permission(Some("dave"), AclOperation::Publish, &dir));

        let mut other = AccumulatedAcl::new();
        other.consolidate(&[acl(None, group("admins"), AclOperation::Publish)]);
        assert!(!other.check_permission(Some("dave"), AclOperation::Publish, &dir));
    }

    #[test]
    fn fold_matched_orders_by_level() {
        // Supplied leaf first; folding must still go root-to-leaf.
        let acls = vec![
            acl(Some("a/b/c"), user("bob"), AclOperation::Publish),
            acl(Some("a/b"), None, AclOperation::Publish),
            acl(Some("a"), user("alice"), AclOperation::Publish),
        ];
        let acc = AccumulatedAcl::from_matched(&acls);
        assert!(!acc.check_permission(Some("alice"), AclOperation::Publish, &NoGroups));
        assert!(acc.check_permission(Some("bob"), AclOperation::Publish, &NoGroups));
    }

    #[test]
    fn registration_discriminator_covers_descendants() {
        let a = acl(Some("a/b"), None, AclOperation::Publish);
        assert_eq!(a.registration_discriminator().as_deref(), Some("a/b//."));
        assert_eq!(a.level(), 2);
        let root = acl(None, None, AclOperation::Publish);
        assert_eq!(root.registration_discriminator(), None);
        assert_eq!(root.level(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut acc = AccumulatedAcl::new();
        acc.consolidate(&[acl(None, user("alice"), AclOperation::Publish)]);
        assert!(!acc.is_empty(AclOperation::Publish));
        acc.reset();
        assert!(acc.is_empty(AclOperation::Publish));
    }
}
