//! Access decisions over an [`AclPolicy`].
//!
//! Group membership is pluggable: each access-group type tag maps to a
//! [`MembershipChecker`] in a [`GroupRegistry`]. Supporting a new kind of
//! group means registering one more checker.

use crate::{
    errors::{StorageError, StorageResult},
    models::acl::{AccessGroup, AclPolicy, Permission},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};
use tracing::debug;

/// Answers "is this user a member of this group".
///
/// Implementations may hit the network; the evaluator calls them lazily.
#[async_trait]
pub trait MembershipChecker: Send + Sync {
    async fn is_member(&self, group_id: &str, user_id: &str) -> StorageResult<bool>;
}

/// Membership checkers keyed by access-group type tag.
#[derive(Clone, Default)]
pub struct GroupRegistry {
    checkers: HashMap<String, Arc<dyn MembershipChecker>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        group_type: impl Into<String>,
        checker: Arc<dyn MembershipChecker>,
    ) -> Self {
        self.checkers.insert(group_type.into(), checker);
        self
    }

    /// Unknown tags are a configuration problem, never a silent deny.
    pub fn checker_for(&self, group: &AccessGroup) -> StorageResult<Arc<dyn MembershipChecker>> {
        self.checkers.get(&group.group_type).cloned().ok_or_else(|| {
            StorageError::Configuration(format!(
                "no membership checker registered for access group type `{}`",
                group.group_type
            ))
        })
    }
}

/// Fixed group membership, loaded once at startup.
#[derive(Debug, Default, Clone)]
pub struct StaticMembership {
    groups: HashMap<String, HashSet<String>>,
}

impl StaticMembership {
    pub const GROUP_TYPE: &'static str = "static";

    pub fn new(groups: HashMap<String, HashSet<String>>) -> Self {
        Self { groups }
    }

    /// Load `{ "group-id": ["user-a", "user-b"] }` from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            StorageError::Configuration(format!("reading group file {}: {}", path.display(), err))
        })?;
        let groups = serde_json::from_str(&raw).map_err(|err| {
            StorageError::Configuration(format!("parsing group file {}: {}", path.display(), err))
        })?;
        Ok(Self::new(groups))
    }
}

#[async_trait]
impl MembershipChecker for StaticMembership {
    async fn is_member(&self, group_id: &str, user_id: &str) -> StorageResult<bool> {
        Ok(self
            .groups
            .get(group_id)
            .is_some_and(|members| members.contains(user_id)))
    }
}

/// Pure policy evaluation, apart from the membership lookups it delegates.
#[derive(Clone, Default)]
pub struct AccessEvaluator {
    registry: GroupRegistry,
}

impl AccessEvaluator {
    pub fn new(registry: GroupRegistry) -> Self {
        Self { registry }
    }

    /// Decide whether `user_id` may perform `requested` under `policy`.
    ///
    /// Rules are checked in stored order and evaluation stops at the first
    /// rule that allows; later rules are never looked up.
    pub async fn authorize(
        &self,
        user_id: Option<&str>,
        policy: &AclPolicy,
        requested: Permission,
    ) -> StorageResult<bool> {
        if policy.is_public() && requested == Permission::Read {
            return Ok(true);
        }

        let Some(user_id) = user_id else {
            return Ok(false);
        };

        if user_id == policy.owner {
            return Ok(true);
        }

        for rule in &policy.acl_rules {
            // Rules that cannot grant `requested` never trigger a membership lookup.
            if !rule.permission.satisfies(requested) {
                continue;
            }
            let checker = self.registry.checker_for(&rule.group)?;
            if checker.is_member(&rule.group.id, user_id).await? {
                debug!(
                    user = user_id,
                    group = %rule.group.id,
                    permission = ?rule.permission,
                    "access granted by acl rule"
                );
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::acl::{AclRule, Visibility};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMembership {
        inner: StaticMembership,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MembershipChecker for CountingMembership {
        async fn is_member(&self, group_id: &str, user_id: &str) -> StorageResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.is_member(group_id, user_id).await
        }
    }

    /// Builds membership from `(group, member)` pairs.
    fn groups(pairs: &[(&str, &str)]) -> StaticMembership {
        let mut map: HashMap<String, HashSet<String>> = HashMap::new();
        for (group, member) in pairs {
            map.entry(group.to_string())
                .or_default()
                .insert(member.to_string());
        }
        StaticMembership::new(map)
    }

    fn rule(group_type: &str, id: &str, permission: Permission) -> AclRule {
        AclRule {
            group: AccessGroup {
                group_type: group_type.into(),
                id: id.into(),
            },
            permission,
        }
    }

    fn evaluator_with(checker: Arc<dyn MembershipChecker>) -> AccessEvaluator {
        AccessEvaluator::new(GroupRegistry::new().register("X", checker))
    }

    fn private_policy(rules: Vec<AclRule>) -> AclPolicy {
        AclPolicy {
            owner: "u1".into(),
            visibility: Visibility::Private,
            acl_rules: rules,
        }
    }

    #[tokio::test]
    async fn read_rule_grants_read_only_to_members() {
        let evaluator = evaluator_with(Arc::new(groups(&[("g1", "u2")])));
        let policy = private_policy(vec![rule("X", "g1", Permission::Read)]);

        assert!(evaluator.authorize(Some("u2"), &policy, Permission::Read).await.unwrap());
        assert!(!evaluator.authorize(Some("u2"), &policy, Permission::Write).await.unwrap());
        assert!(!evaluator.authorize(Some("u3"), &policy, Permission::Read).await.unwrap());
    }

    #[tokio::test]
    async fn write_rule_satisfies_read() {
        let evaluator = evaluator_with(Arc::new(groups(&[("g1", "u2")])));
        let policy = private_policy(vec![rule("X", "g1", Permission::Write)]);

        assert!(evaluator.authorize(Some("u2"), &policy, Permission::Read).await.unwrap());
        assert!(evaluator.authorize(Some("u2"), &policy, Permission::Write).await.unwrap());
    }

    #[tokio::test]
    async fn public_policy_allows_anonymous_read_only() {
        let evaluator = AccessEvaluator::default();
        let policy = AclPolicy::new("u1", Visibility::Public);

        assert!(evaluator.authorize(None, &policy, Permission::Read).await.unwrap());
        assert!(!evaluator.authorize(None, &policy, Permission::Write).await.unwrap());
        assert!(!evaluator.authorize(Some("u9"), &policy, Permission::Write).await.unwrap());
    }

    #[tokio::test]
    async fn owner_has_full_access_without_rules() {
        let evaluator = AccessEvaluator::default();
        let policy = private_policy(vec![]);

        assert!(evaluator.authorize(Some("u1"), &policy, Permission::Write).await.unwrap());
        assert!(evaluator.authorize(Some("u1"), &policy, Permission::Read).await.unwrap());
        assert!(!evaluator.authorize(None, &policy, Permission::Read).await.unwrap());
    }

    #[tokio::test]
    async fn evaluation_stops_at_first_allowing_rule() {
        let counter = Arc::new(CountingMembership {
            inner: groups(&[("g1", "u2"), ("g2", "u2")]),
            calls: AtomicUsize::new(0),
        });
        let evaluator = evaluator_with(counter.clone());
        let policy = private_policy(vec![
            rule("X", "g1", Permission::Read),
            rule("X", "g2", Permission::Read),
            rule("X", "g3", Permission::Read),
        ]);

        assert!(evaluator.authorize(Some("u2"), &policy, Permission::Read).await.unwrap());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_rules_are_not_looked_up_for_write() {
        let counter = Arc::new(CountingMembership {
            inner: groups(&[("g1", "u2"), ("g2", "u2")]),
            calls: AtomicUsize::new(0),
        });
        let evaluator = evaluator_with(counter.clone());
        let policy = private_policy(vec![
            rule("X", "g1", Permission::Read),
            rule("X", "g2", Permission::Write),
        ]);

        assert!(evaluator.authorize(Some("u2"), &policy, Permission::Write).await.unwrap());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);

        let read_only = private_policy(vec![rule("X", "g1", Permission::Read)]);
        assert!(!evaluator.authorize(Some("u2"), &read_only, Permission::Write).await.unwrap());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn insufficient_first_match_keeps_looking() {
        let evaluator = evaluator_with(Arc::new(groups(&[("g1", "u2"), ("g2", "u2")])));
        let policy = private_policy(vec![
            rule("X", "g1", Permission::Read),
            rule("X", "g2", Permission::Write),
        ]);

        assert!(evaluator.authorize(Some("u2"), &policy, Permission::Write).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_group_type_is_configuration_error() {
        let evaluator = AccessEvaluator::default();
        let policy = private_policy(vec![rule("mystery", "g1", Permission::Read)]);

        let err = evaluator
            .authorize(Some("u2"), &policy, Permission::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));
    }

    #[tokio::test]
    async fn static_membership_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.json");
        std::fs::write(&path, r#"{"editors": ["alice", "bob"]}"#).unwrap();

        let membership = StaticMembership::load(&path).await.unwrap();
        assert!(membership.is_member("editors", "bob").await.unwrap());
        assert!(!membership.is_member("editors", "carol").await.unwrap());
        assert!(!membership.is_member("viewers", "alice").await.unwrap());
    }
}
