//! Group membership directory.
//!
//! Read path: cache first; on a miss (or an empty set) read the store and
//! repopulate the cache with an expiry.
//!
//! Write path: mutate the store first, then invalidate the cache entry. The
//! cached set is never updated in place, so a reader can only observe a stale
//! set in the window between the store write and the invalidation.
//!
//! A read-through fill is conditional on the cache generation seen before the
//! store load. A load that overlaps a write returns its (possibly stale) set to
//! that one caller but never caches it.

use crate::cache::MembershipCache;
use crate::error::{DirectoryError, Result};
use crate::model::{AddOutcome, Group};
use crate::store::GroupStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default expiry for cached member sets (1 hour).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Read-through membership directory over a durable store and a shared cache.
#[derive(Clone)]
pub struct GroupDirectory {
    store: Arc<dyn GroupStore>,
    cache: Arc<dyn MembershipCache>,
    cache_ttl: Duration,
}

impl GroupDirectory {
    pub fn new(store: Arc<dyn GroupStore>, cache: Arc<dyn MembershipCache>) -> Self {
        Self {
            store,
            cache,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// Set the expiry applied on read-through.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Members of a group.
    ///
    /// Cache errors are treated as misses. Store errors are returned; callers
    /// that must keep going use [`GroupDirectory::cached_members`].
    pub async fn members(&self, group_id: &str) -> Result<HashSet<String>> {
        match self.cache.get_members(group_id).await {
            Ok(Some(members)) => {
                debug!("Cache hit for group '{}' ({} members)", group_id, members.len());
                return Ok(members);
            }
            Ok(None) => {}
            Err(e) => warn!("Membership cache read failed for '{}': {:?}", group_id, e),
        }

        let generation = match self.cache.generation(group_id).await {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!("Membership cache generation read failed for '{}': {:?}", group_id, e);
                None
            }
        };

        let group = self
            .store
            .find_by_id(group_id)
            .await
            .map_err(Self::unavailable)?
            .ok_or_else(|| DirectoryError::GroupNotFound(group_id.to_string()))?;

        if let Some(generation) = generation.filter(|_| !group.member_ids.is_empty()) {
            match self
                .cache
                .put_members_if_current(group_id, &group.member_ids, self.cache_ttl, generation)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(
                    "Group '{}' changed during load, not caching this read",
                    group_id
                ),
                Err(e) => warn!("Failed to populate cache for '{}': {:?}", group_id, e),
            }
        }

        debug!(
            "Loaded group '{}' from store ({} members)",
            group_id,
            group.member_ids.len()
        );
        Ok(group.member_ids)
    }

    /// Members as currently cached, without touching the store.
    /// Any cache failure yields an empty set.
    pub async fn cached_members(&self, group_id: &str) -> HashSet<String> {
        match self.cache.get_members(group_id).await {
            Ok(members) => members.unwrap_or_default(),
            Err(e) => {
                warn!("Membership cache read failed for '{}': {:?}", group_id, e);
                HashSet::new()
            }
        }
    }

    /// Add a member. Returns `false` when the group is full.
    ///
    /// The capacity check runs against the store, never the cache.
    pub async fn add_member(&self, group_id: &str, subscriber_id: &str) -> Result<bool> {
        let outcome = self
            .store
            .add_member(group_id, subscriber_id)
            .await
            .map_err(Self::unavailable)?;

        match outcome {
            AddOutcome::Added => {
                self.invalidate(group_id).await;
                info!("Subscriber {} joined group '{}'", subscriber_id, group_id);
            }
            AddOutcome::AlreadyMember => {
                debug!("Subscriber {} already in group '{}'", subscriber_id, group_id);
            }
            AddOutcome::Full => {
                info!(
                    "Rejected {} from group '{}': group is full",
                    subscriber_id, group_id
                );
            }
        }

        Ok(outcome.accepted())
    }

    /// Remove a member. Returns whether the subscriber was a member.
    pub async fn remove_member(&self, group_id: &str, subscriber_id: &str) -> Result<bool> {
        let removed = self
            .store
            .remove_member(group_id, subscriber_id)
            .await
            .map_err(Self::unavailable)?;

        if removed {
            self.invalidate(group_id).await;
            info!("Subscriber {} left group '{}'", subscriber_id, group_id);
        }
        Ok(removed)
    }

    /// Whether the group exists. A live cache entry counts as existence.
    pub async fn exists(&self, group_id: &str) -> Result<bool> {
        if let Ok(Some(_)) = self.cache.get_members(group_id).await {
            return Ok(true);
        }
        self.store.exists(group_id).await.map_err(Self::unavailable)
    }

    /// Create a group in the store. The cache is filled lazily on first read.
    pub async fn create_group(&self, group: Group) -> Result<Group> {
        let group = self.store.create(group).await.map_err(Self::unavailable)?;
        info!("Group '{}' created", group.group_id);
        Ok(group)
    }

    /// Delete a group, then drop its cached member set.
    pub async fn delete_group(&self, group_id: &str) -> Result<bool> {
        let deleted = self.store.delete(group_id).await.map_err(Self::unavailable)?;
        self.invalidate(group_id).await;
        Ok(deleted)
    }

    /// Load the full group record from the store.
    pub async fn group(&self, group_id: &str) -> Result<Option<Group>> {
        self.store.find_by_id(group_id).await.map_err(Self::unavailable)
    }

    async fn invalidate(&self, group_id: &str) {
        if let Err(e) = self.cache.invalidate(group_id).await {
            // The entry still expires on its own; staleness is bounded by the TTL
            warn!("Failed to invalidate cache for '{}': {:?}", group_id, e);
        }
    }

    /// Transport-level store failures become `StoreUnavailable`; domain
    /// errors pass through.
    fn unavailable(err: DirectoryError) -> DirectoryError {
        match err {
            DirectoryError::Redis(e) => DirectoryError::StoreUnavailable(e.to_string()),
            DirectoryError::Json(e) => DirectoryError::StoreUnavailable(e.to_string()),
            other => other,
        }
    }
}

impl std::fmt::Debug for GroupDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupDirectory")
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryMembershipCache;
    use crate::store::MemoryGroupStore;
    use async_trait::async_trait;
    use std::time::Instant;
    use tokio::sync::Notify;

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn directory() -> (GroupDirectory, MemoryGroupStore, MemoryMembershipCache) {
        let store = MemoryGroupStore::new();
        let cache = MemoryMembershipCache::new();
        let directory = GroupDirectory::new(Arc::new(store.clone()), Arc::new(cache.clone()));
        (directory, store, cache)
    }

    /// Store that is always down.
    struct UnreachableStore;

    #[async_trait]
    impl GroupStore for UnreachableStore {
        async fn create(&self, _group: Group) -> Result<Group> {
            Err(DirectoryError::StoreUnavailable("connection refused".into()))
        }
        async fn find_by_id(&self, _group_id: &str) -> Result<Option<Group>> {
            Err(DirectoryError::StoreUnavailable("connection refused".into()))
        }
        async fn add_member(&self, _group_id: &str, _subscriber_id: &str) -> Result<AddOutcome> {
            Err(DirectoryError::StoreUnavailable("connection refused".into()))
        }
        async fn remove_member(&self, _group_id: &str, _subscriber_id: &str) -> Result<bool> {
            Err(DirectoryError::StoreUnavailable("connection refused".into()))
        }
        async fn delete(&self, _group_id: &str) -> Result<bool> {
            Err(DirectoryError::StoreUnavailable("connection refused".into()))
        }
        async fn exists(&self, _group_id: &str) -> Result<bool> {
            Err(DirectoryError::StoreUnavailable("connection refused".into()))
        }
    }

    /// Store whose loads pause after reading until released.
    struct GatedStore {
        inner: MemoryGroupStore,
        loaded: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl GroupStore for GatedStore {
        async fn create(&self, group: Group) -> Result<Group> {
            self.inner.create(group).await
        }
        async fn find_by_id(&self, group_id: &str) -> Result<Option<Group>> {
            let group = self.inner.find_by_id(group_id).await;
            self.loaded.notify_one();
            self.release.notified().await;
            group
        }
        async fn add_member(&self, group_id: &str, subscriber_id: &str) -> Result<AddOutcome> {
            self.inner.add_member(group_id, subscriber_id).await
        }
        async fn remove_member(&self, group_id: &str, subscriber_id: &str) -> Result<bool> {
            self.inner.remove_member(group_id, subscriber_id).await
        }
        async fn delete(&self, group_id: &str) -> Result<bool> {
            self.inner.delete(group_id).await
        }
        async fn exists(&self, group_id: &str) -> Result<bool> {
            self.inner.exists(group_id).await
        }
    }

    #[tokio::test]
    async fn test_read_through_populates_cache() {
        let (directory, _store, cache) = directory();
        directory
            .create_group(Group::new("G1", "general").with_members(["u1", "u2"]))
            .await
            .unwrap();

        assert!(!cache.contains("G1"));
        assert_eq!(directory.members("G1").await.unwrap(), set(&["u1", "u2"]));
        assert!(cache.contains("G1"));
    }

    #[tokio::test]
    async fn test_full_group_rejects_and_keeps_membership() {
        let (directory, _store, _cache) = directory();
        directory
            .create_group(
                Group::new("G1", "general")
                    .with_max_members(2)
                    .with_members(["u1", "u2"]),
            )
            .await
            .unwrap();

        assert!(!directory.add_member("G1", "u3").await.unwrap());
        assert_eq!(directory.members("G1").await.unwrap(), set(&["u1", "u2"]));
    }

    #[tokio::test]
    async fn test_capacity_checked_against_store_not_cache() {
        let (directory, store, cache) = directory();
        directory
            .create_group(Group::new("G1", "general").with_max_members(2).with_members(["u1"]))
            .await
            .unwrap();

        // Cache claims the group is already full; the store says otherwise
        cache
            .put_members("G1", &set(&["u1", "x", "y"]), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(directory.add_member("G1", "u2").await.unwrap());
        let group = store.find_by_id("G1").await.unwrap().unwrap();
        assert_eq!(group.member_ids, set(&["u1", "u2"]));
    }

    #[tokio::test]
    async fn test_write_invalidates_so_next_read_is_fresh() {
        let (directory, _store, cache) = directory();
        directory
            .create_group(Group::new("G1", "general").with_members(["u1"]))
            .await
            .unwrap();
        directory.members("G1").await.unwrap();
        assert!(cache.contains("G1"));

        let started = Instant::now();
        assert!(directory.add_member("G1", "u2").await.unwrap());
        assert!(!cache.contains("G1"));
        assert_eq!(directory.members("G1").await.unwrap(), set(&["u1", "u2"]));

        assert!(directory.remove_member("G1", "u1").await.unwrap());
        assert_eq!(directory.members("G1").await.unwrap(), set(&["u2"]));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_load_overlapping_a_write_is_not_cached() {
        let (writer, store, cache) = directory();
        writer
            .create_group(Group::new("G1", "general").with_members(["u1"]))
            .await
            .unwrap();

        let loaded = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let reader = GroupDirectory::new(
            Arc::new(GatedStore {
                inner: store,
                loaded: loaded.clone(),
                release: release.clone(),
            }),
            Arc::new(cache.clone()),
        );

        let read = tokio::spawn(async move { reader.members("G1").await });
        loaded.notified().await;

        // Lands between the reader's store load and its cache fill
        assert!(writer.add_member("G1", "u2").await.unwrap());
        release.notify_one();

        assert_eq!(read.await.unwrap().unwrap(), set(&["u1"]));
        assert!(!cache.contains("G1"));
        assert_eq!(writer.members("G1").await.unwrap(), set(&["u1", "u2"]));
        assert!(cache.contains("G1"));
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let (directory, _store, _cache) = directory();
        assert!(directory.members("nope").await.unwrap_err().is_not_found());
        assert!(directory.add_member("nope", "u1").await.unwrap_err().is_not_found());
        assert!(!directory.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_down_falls_back_to_cache() {
        let cache = MemoryMembershipCache::new();
        let directory = GroupDirectory::new(Arc::new(UnreachableStore), Arc::new(cache.clone()));

        let err = directory.members("G1").await.unwrap_err();
        assert!(matches!(err, DirectoryError::StoreUnavailable(_)));
        assert!(directory.cached_members("G1").await.is_empty());

        cache
            .put_members("G1", &set(&["u1"]), Duration::from_secs(60))
            .await
            .unwrap();
        // Cached set still served while the store is down
        assert_eq!(directory.members("G1").await.unwrap(), set(&["u1"]));
        assert!(directory.exists("G1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_group_drops_cache() {
        let (directory, _store, cache) = directory();
        directory
            .create_group(Group::new("G1", "general").with_members(["u1"]))
            .await
            .unwrap();
        directory.members("G1").await.unwrap();

        assert!(directory.delete_group("G1").await.unwrap());
        assert!(!cache.contains("G1"));
        assert!(!directory.exists("G1").await.unwrap());
    }
}
