//! Durable group store.
//!
//! The store is the source of truth for membership. The directory only
//! mutates membership through it, and the capacity check happens here so it
//! is evaluated against authoritative data.

use crate::error::{DirectoryError, Result};
use crate::model::{AddOutcome, Group};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Durable storage for groups.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Persist a new group. Fails with `GroupExists` if the id is taken.
    async fn create(&self, group: Group) -> Result<Group>;

    /// Load a group with its full member set.
    async fn find_by_id(&self, group_id: &str) -> Result<Option<Group>>;

    /// Atomically check capacity and add a member.
    async fn add_member(&self, group_id: &str, subscriber_id: &str) -> Result<AddOutcome>;

    /// Remove a member. Returns whether the subscriber was a member.
    async fn remove_member(&self, group_id: &str, subscriber_id: &str) -> Result<bool>;

    /// Delete a group. Returns whether it existed.
    async fn delete(&self, group_id: &str) -> Result<bool>;

    async fn exists(&self, group_id: &str) -> Result<bool>;
}

/// In-process group store.
///
/// Used in tests and single-process deployments. Mutations go through
/// DashMap entry guards, so the capacity check and insert are atomic per group.
#[derive(Debug, Clone, Default)]
pub struct MemoryGroupStore {
    groups: Arc<DashMap<String, Group>>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn create(&self, group: Group) -> Result<Group> {
        if group.group_id.is_empty() {
            return Err(DirectoryError::InvalidGroup("empty group id".to_string()));
        }
        match self.groups.entry(group.group_id.clone()) {
            Entry::Occupied(_) => Err(DirectoryError::GroupExists(group.group_id)),
            Entry::Vacant(slot) => {
                slot.insert(group.clone());
                Ok(group)
            }
        }
    }

    async fn find_by_id(&self, group_id: &str) -> Result<Option<Group>> {
        Ok(self.groups.get(group_id).map(|g| g.clone()))
    }

    async fn add_member(&self, group_id: &str, subscriber_id: &str) -> Result<AddOutcome> {
        let mut group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| DirectoryError::GroupNotFound(group_id.to_string()))?;
        Ok(group.try_add(subscriber_id))
    }

    async fn remove_member(&self, group_id: &str, subscriber_id: &str) -> Result<bool> {
        let mut group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| DirectoryError::GroupNotFound(group_id.to_string()))?;
        Ok(group.member_ids.remove(subscriber_id))
    }

    async fn delete(&self, group_id: &str) -> Result<bool> {
        Ok(self.groups.remove(group_id).is_some())
    }

    async fn exists(&self, group_id: &str) -> Result<bool> {
        Ok(self.groups.contains_key(group_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let store = MemoryGroupStore::new();
        store.create(Group::new("G1", "one")).await.unwrap();

        let err = store.create(Group::new("G1", "again")).await.unwrap_err();
        assert!(matches!(err, DirectoryError::GroupExists(id) if id == "G1"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_add_member_full_group() {
        let store = MemoryGroupStore::new();
        store
            .create(Group::new("G1", "one").with_max_members(2).with_members(["u1", "u2"]))
            .await
            .unwrap();

        assert_eq!(store.add_member("G1", "u3").await.unwrap(), AddOutcome::Full);
        let group = store.find_by_id("G1").await.unwrap().unwrap();
        assert_eq!(group.member_ids.len(), 2);
        assert!(!group.is_member("u3"));
    }

    #[tokio::test]
    async fn test_missing_group_errors() {
        let store = MemoryGroupStore::new();
        assert!(store.add_member("nope", "u1").await.unwrap_err().is_not_found());
        assert!(store.remove_member("nope", "u1").await.unwrap_err().is_not_found());
        assert!(!store.delete("nope").await.unwrap());
        assert!(!store.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_adds_never_exceed_cap() {
        let store = MemoryGroupStore::new();
        store
            .create(Group::new("G1", "one").with_max_members(10))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.add_member("G1", &format!("u{}", i)).await.unwrap()
            }));
        }

        let mut added = 0;
        for handle in handles {
            if handle.await.unwrap() == AddOutcome::Added {
                added += 1;
            }
        }

        assert_eq!(added, 10);
        let group = store.find_by_id("G1").await.unwrap().unwrap();
        assert_eq!(group.member_ids.len(), 10);
    }
}
