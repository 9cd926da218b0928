//! Reads and writes the ACL policy embedded in object metadata.

use crate::{
    backend::ObjectBackend,
    errors::{StorageError, StorageResult},
    models::{
        acl::AclPolicy,
        object::{MetadataReplace, ObjectMetadata, ObjectReference},
    },
};
use std::sync::Arc;
use tracing::{info, warn};

/// Custom metadata key holding the JSON-encoded [`AclPolicy`].
pub const ACL_POLICY_METADATA_KEY: &str = "custom:aclpolicy";

const MAX_WRITE_ATTEMPTS: usize = 3;

/// The stored policy as a caller observed it.
///
/// Passed back to [`AclPolicyStore::replace_policy`] so that a write only
/// lands if nobody changed the policy since the caller looked at it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicySnapshot {
    pub policy: Option<AclPolicy>,
    raw: Option<String>,
}

impl PolicySnapshot {
    pub fn from_metadata(reference: &ObjectReference, meta: &ObjectMetadata) -> Self {
        Self {
            policy: policy_from_metadata(reference, meta),
            raw: meta.custom_metadata.get(ACL_POLICY_METADATA_KEY).cloned(),
        }
    }

    fn matches(&self, meta: &ObjectMetadata) -> bool {
        self.raw.as_ref() == meta.custom_metadata.get(ACL_POLICY_METADATA_KEY)
    }
}

/// Policy storage on top of object metadata.
///
/// Writes are read-modify-write through a copy-in-place, guarded by the
/// version observed on read. When the guard trips because some other
/// metadata key moved, the write is retried. When the policy itself moved
/// away from the caller's snapshot, the write fails with `Conflict`.
#[derive(Clone)]
pub struct AclPolicyStore {
    backend: Arc<dyn ObjectBackend>,
}

impl AclPolicyStore {
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self { backend }
    }

    /// Returns `None` when the object has no policy or the stored value
    /// cannot be parsed.
    pub async fn get_policy(
        &self,
        reference: &ObjectReference,
    ) -> StorageResult<Option<AclPolicy>> {
        Ok(self.snapshot(reference).await?.policy)
    }

    pub async fn snapshot(&self, reference: &ObjectReference) -> StorageResult<PolicySnapshot> {
        let meta = self.backend.head(reference).await?;
        Ok(PolicySnapshot::from_metadata(reference, &meta))
    }

    /// Write `policy` over whatever is stored right now.
    pub async fn set_policy(
        &self,
        reference: &ObjectReference,
        policy: &AclPolicy,
    ) -> StorageResult<()> {
        let expected = self.snapshot(reference).await?;
        self.replace_policy(reference, policy, &expected).await
    }

    /// Write `policy` only if the stored policy still equals `expected`.
    pub async fn replace_policy(
        &self,
        reference: &ObjectReference,
        policy: &AclPolicy,
        expected: &PolicySnapshot,
    ) -> StorageResult<()> {
        let encoded = serde_json::to_string(policy)
            .map_err(|err| StorageError::InvalidInput(format!("unencodable policy: {}", err)))?;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.backend.head(reference).await?;
            if !expected.matches(&current) {
                warn!(object = %reference, "acl policy changed since it was read");
                return Err(StorageError::Conflict(reference.to_string()));
            }

            let mut custom_metadata = current.custom_metadata.clone();
            custom_metadata.insert(ACL_POLICY_METADATA_KEY.to_string(), encoded.clone());

            let update = MetadataReplace {
                headers: current.content_headers(),
                custom_metadata,
                if_version_match: current.version.clone(),
            };

            match self.backend.copy_in_place(reference, update).await {
                Ok(_) => {
                    info!(object = %reference, owner = %policy.owner, "acl policy written");
                    return Ok(());
                }
                Err(StorageError::PreconditionFailed(_)) => {
                    warn!(
                        object = %reference,
                        attempt,
                        "acl policy write raced with another update; re-checking"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Err(StorageError::Conflict(reference.to_string()))
    }
}

/// Extract the policy from already-fetched metadata.
pub fn policy_from_metadata(
    reference: &ObjectReference,
    meta: &ObjectMetadata,
) -> Option<AclPolicy> {
    let raw = meta.custom_metadata.get(ACL_POLICY_METADATA_KEY)?;
    match serde_json::from_str(raw) {
        Ok(policy) => Some(policy),
        Err(err) => {
            warn!(object = %reference, error = %err, "ignoring malformed acl policy");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::MemoryBackend,
        models::{
            acl::{AccessGroup, AclRule, Permission, Visibility},
            object::ContentHeaders,
        },
        services::stream_adapter::{BackendBody, ByteStream},
    };
    use async_trait::async_trait;
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    fn reference() -> ObjectReference {
        ObjectReference::new("bucket", ".private/uploads/one")
    }

    fn policy() -> AclPolicy {
        AclPolicy {
            owner: "u1".into(),
            visibility: Visibility::Private,
            acl_rules: vec![AclRule {
                group: AccessGroup {
                    group_type: "X".into(),
                    id: "g1".into(),
                },
                permission: Permission::Read,
            }],
        }
    }

    async fn seeded() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        let mut custom = BTreeMap::new();
        custom.insert("uploader".to_string(), "web".to_string());
        backend
            .insert(
                &reference(),
                "payload",
                ContentHeaders {
                    content_type: Some("image/jpeg".into()),
                    cache_control: Some("max-age=60".into()),
                    content_encoding: Some("identity".into()),
                    content_disposition: Some("inline".into()),
                },
                custom,
            )
            .await;
        backend
    }

    #[tokio::test]
    async fn set_then_get_round_trips_and_preserves_metadata() {
        let backend = seeded().await;
        let store = AclPolicyStore::new(backend.clone());

        store.set_policy(&reference(), &policy()).await.unwrap();
        assert_eq!(store.get_policy(&reference()).await.unwrap(), Some(policy()));

        let meta = backend.head(&reference()).await.unwrap();
        assert_eq!(meta.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(meta.cache_control.as_deref(), Some("max-age=60"));
        assert_eq!(meta.content_encoding.as_deref(), Some("identity"));
        assert_eq!(meta.content_disposition.as_deref(), Some("inline"));
        assert_eq!(meta.custom_metadata.get("uploader").map(String::as_str), Some("web"));
    }

    #[tokio::test]
    async fn set_policy_overwrites_previous_policy() {
        let backend = seeded().await;
        let store = AclPolicyStore::new(backend);
        store.set_policy(&reference(), &policy()).await.unwrap();

        let public = AclPolicy::new("u1", Visibility::Public);
        store.set_policy(&reference(), &public).await.unwrap();
        assert_eq!(store.get_policy(&reference()).await.unwrap(), Some(public));
    }

    #[tokio::test]
    async fn set_policy_on_missing_object_is_not_found() {
        let store = AclPolicyStore::new(Arc::new(MemoryBackend::new()));
        let err = store.set_policy(&reference(), &policy()).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn absent_policy_is_none() {
        let store = AclPolicyStore::new(seeded().await);
        assert_eq!(store.get_policy(&reference()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_policy_is_none() {
        let backend = Arc::new(MemoryBackend::new());
        let mut custom = BTreeMap::new();
        custom.insert(ACL_POLICY_METADATA_KEY.to_string(), "{not json".to_string());
        backend
            .insert(&reference(), "x", ContentHeaders::default(), custom)
            .await;

        let store = AclPolicyStore::new(backend);
        assert_eq!(store.get_policy(&reference()).await.unwrap(), None);
    }

    /// Simulates another writer landing between our HEAD and our copy.
    ///
    /// The rival either touches an unrelated key or, with `rival_policy`
    /// set, writes its own policy.
    struct RacingBackend {
        inner: MemoryBackend,
        races_left: AtomicUsize,
        rival_policy: Option<AclPolicy>,
    }

    #[async_trait]
    impl ObjectBackend for RacingBackend {
        async fn head(&self, reference: &ObjectReference) -> StorageResult<ObjectMetadata> {
            self.inner.head(reference).await
        }

        async fn get(
            &self,
            reference: &ObjectReference,
        ) -> StorageResult<(ObjectMetadata, BackendBody)> {
            self.inner.get(reference).await
        }

        async fn put(
            &self,
            reference: &ObjectReference,
            body: ByteStream,
            headers: ContentHeaders,
            custom_metadata: BTreeMap<String, String>,
        ) -> StorageResult<ObjectMetadata> {
            self.inner.put(reference, body, headers, custom_metadata).await
        }

        async fn copy_in_place(
            &self,
            reference: &ObjectReference,
            update: MetadataReplace,
        ) -> StorageResult<ObjectMetadata> {
            let race = self
                .races_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if race {
                let current = self.inner.head(reference).await?;
                let mut custom = current.custom_metadata.clone();
                match &self.rival_policy {
                    Some(rival) => custom.insert(
                        ACL_POLICY_METADATA_KEY.to_string(),
                        serde_json::to_string(rival).unwrap(),
                    ),
                    None => custom.insert("other-writer".to_string(), "yes".to_string()),
                };
                self.inner
                    .copy_in_place(
                        reference,
                        MetadataReplace {
                            headers: current.content_headers(),
                            custom_metadata: custom,
                            if_version_match: None,
                        },
                    )
                    .await?;
            }
            self.inner.copy_in_place(reference, update).await
        }

        async fn delete(&self, reference: &ObjectReference) -> StorageResult<()> {
            self.inner.delete(reference).await
        }

        async fn ping(&self) -> StorageResult<()> {
            Ok(())
        }
    }

    async fn racing(races: usize) -> Arc<RacingBackend> {
        racing_with(races, None).await
    }

    async fn racing_with(races: usize, rival_policy: Option<AclPolicy>) -> Arc<RacingBackend> {
        let inner = MemoryBackend::new();
        inner
            .insert(&reference(), "x", ContentHeaders::default(), BTreeMap::new())
            .await;
        Arc::new(RacingBackend {
            inner,
            races_left: AtomicUsize::new(races),
            rival_policy,
        })
    }

    #[tokio::test]
    async fn concurrent_update_is_retried_not_lost() {
        let backend = racing(1).await;
        let store = AclPolicyStore::new(backend.clone());

        store.set_policy(&reference(), &policy()).await.unwrap();

        let meta = backend.head(&reference()).await.unwrap();
        assert_eq!(meta.custom_metadata.get("other-writer").map(String::as_str), Some("yes"));
        assert_eq!(store.get_policy(&reference()).await.unwrap(), Some(policy()));
    }

    #[tokio::test]
    async fn persistent_contention_reports_conflict() {
        let backend = racing(MAX_WRITE_ATTEMPTS).await;
        let store = AclPolicyStore::new(backend);

        let err = store.set_policy(&reference(), &policy()).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn rival_policy_write_is_not_overwritten() {
        let rival = AclPolicy::new("bob", Visibility::Public);
        let backend = racing_with(1, Some(rival.clone())).await;
        let store = AclPolicyStore::new(backend);

        let err = store.set_policy(&reference(), &policy()).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(store.get_policy(&reference()).await.unwrap(), Some(rival));
    }

    #[tokio::test]
    async fn stale_snapshot_is_rejected() {
        let store = AclPolicyStore::new(seeded().await);
        let seen = store.snapshot(&reference()).await.unwrap();
        assert_eq!(seen.policy, None);

        let alice = AclPolicy::new("alice", Visibility::Private);
        store.replace_policy(&reference(), &alice, &seen).await.unwrap();

        let bob = AclPolicy::new("bob", Visibility::Public);
        let err = store.replace_policy(&reference(), &bob, &seen).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(store.get_policy(&reference()).await.unwrap(), Some(alice));
    }

    #[tokio::test]
    async fn concurrent_writers_from_same_snapshot_have_one_winner() {
        let store = AclPolicyStore::new(seeded().await);
        let alice = AclPolicy::new("alice", Visibility::Private);
        let bob = AclPolicy::new("bob", Visibility::Public);

        let alice_seen = store.snapshot(&reference()).await.unwrap();
        let bob_seen = store.snapshot(&reference()).await.unwrap();
        let alice_ref = reference();
        let bob_ref = reference();
        let (alice_result, bob_result) = tokio::join!(
            store.replace_policy(&alice_ref, &alice, &alice_seen),
            store.replace_policy(&bob_ref, &bob, &bob_seen),
        );

        let stored = store.get_policy(&reference()).await.unwrap();
        match (alice_result, bob_result) {
            (Ok(()), Err(StorageError::Conflict(_))) => assert_eq!(stored, Some(alice)),
            (Err(StorageError::Conflict(_)), Ok(())) => assert_eq!(stored, Some(bob)),
            other => panic!("expected exactly one winner, got {other:?}"),
        }
    }
}
