//! Shared membership cache.
//!
//! Key format: `group:members:{group_id}` -> set of subscriber ids, with an
//! expiry refreshed on every read-through. Writers never update a cached set;
//! they delete it and let the next reader repopulate from the store.
//!
//! Every invalidation also bumps `group:generation:{group_id}`. A reader notes
//! the generation before loading the store and only fills the cache if it is
//! unchanged, so a load that raced a write cannot park its stale set.

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Redis key prefix for cached member sets: group:members:{group_id}
pub const MEMBERS_KEY_PREFIX: &str = "group:members:";

/// Redis key prefix for invalidation counters: group:generation:{group_id}
pub const GENERATION_KEY_PREFIX: &str = "group:generation:";

/// Fill the member set only if the generation still matches ARGV[1].
/// Returns 1 when written, 0 when a writer got there first.
const PUT_IF_CURRENT_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[2]) or '0')
if current ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('DEL', KEYS[1])
redis.call('SADD', KEYS[1], unpack(ARGV, 3))
redis.call('EXPIRE', KEYS[1], ARGV[2])
return 1
"#;

/// Build the cache key for a group.
pub fn members_key(group_id: &str) -> String {
    format!("{}{}", MEMBERS_KEY_PREFIX, group_id)
}

fn generation_key(group_id: &str) -> String {
    format!("{}{}", GENERATION_KEY_PREFIX, group_id)
}

/// Cache of group member sets shared by every instance.
#[async_trait]
pub trait MembershipCache: Send + Sync {
    /// Cached members, or `None` on a miss. An empty set is reported as a miss.
    async fn get_members(&self, group_id: &str) -> Result<Option<HashSet<String>>>;

    /// Replace the cached set and (re)start its expiry.
    async fn put_members(&self, group_id: &str, members: &HashSet<String>, ttl: Duration)
        -> Result<()>;

    /// Current invalidation generation of a group; 0 if never invalidated.
    async fn generation(&self, group_id: &str) -> Result<u64>;

    /// Like [`MembershipCache::put_members`], but only if no invalidation
    /// happened since `generation` was read. Returns whether it wrote.
    async fn put_members_if_current(
        &self,
        group_id: &str,
        members: &HashSet<String>,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool>;

    /// Drop the cached set and bump the generation.
    async fn invalidate(&self, group_id: &str) -> Result<()>;
}

/// Membership cache on Redis sets.
#[derive(Clone)]
pub struct RedisMembershipCache {
    conn: MultiplexedConnection,
    put_if_current_script: redis::Script,
}

impl RedisMembershipCache {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            put_if_current_script: redis::Script::new(PUT_IF_CURRENT_SCRIPT),
        }
    }
}

#[async_trait]
impl MembershipCache for RedisMembershipCache {
    async fn get_members(&self, group_id: &str) -> Result<Option<HashSet<String>>> {
        let mut conn = self.conn.clone();
        let members: HashSet<String> = conn.smembers(members_key(group_id)).await?;
        Ok((!members.is_empty()).then_some(members))
    }

    async fn put_members(
        &self,
        group_id: &str,
        members: &HashSet<String>,
        ttl: Duration,
    ) -> Result<()> {
        if members.is_empty() {
            return self.invalidate(group_id).await;
        }

        let mut conn = self.conn.clone();
        let key = members_key(group_id);
        let values: Vec<&str> = members.iter().map(String::as_str).collect();

        let _: () = redis::pipe()
            .atomic()
            .del(&key)
            .ignore()
            .sadd(&key, values)
            .ignore()
            .expire(&key, ttl.as_secs().max(1) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn generation(&self, group_id: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let generation: Option<u64> = conn.get(generation_key(group_id)).await?;
        Ok(generation.unwrap_or(0))
    }

    async fn put_members_if_current(
        &self,
        group_id: &str,
        members: &HashSet<String>,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool> {
        if members.is_empty() {
            return Ok(false);
        }

        let mut conn = self.conn.clone();
        let values: Vec<&str> = members.iter().map(String::as_str).collect();
        let written: i64 = self
            .put_if_current_script
            .key(members_key(group_id))
            .key(generation_key(group_id))
            .arg(generation)
            .arg(ttl.as_secs().max(1))
            .arg(values)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn invalidate(&self, group_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(members_key(group_id))
            .ignore()
            .incr(generation_key(group_id), 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-process membership cache with per-entry expiry.
///
/// Clones share the same map, so several directories built over one cache
/// behave like instances sharing one Redis.
#[derive(Debug, Clone, Default)]
pub struct MemoryMembershipCache {
    entries: Arc<DashMap<String, (HashSet<String>, Instant)>>,
    // Locked before `entries` whenever both are touched
    generations: Arc<DashMap<String, u64>>,
}

impl MemoryMembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live entry exists for the group.
    pub fn contains(&self, group_id: &str) -> bool {
        self.entries
            .get(&members_key(group_id))
            .map(|entry| entry.1 > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl MembershipCache for MemoryMembershipCache {
    async fn get_members(&self, group_id: &str) -> Result<Option<HashSet<String>>> {
        let key = members_key(group_id);
        let now = Instant::now();

        let hit = self
            .entries
            .get(&key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());

        if hit.is_none() {
            self.entries.remove_if(&key, |_, entry| entry.1 <= now);
        }
        Ok(hit.filter(|members| !members.is_empty()))
    }

    async fn put_members(
        &self,
        group_id: &str,
        members: &HashSet<String>,
        ttl: Duration,
    ) -> Result<()> {
        let key = members_key(group_id);
        if members.is_empty() {
            self.entries.remove(&key);
        } else {
            self.entries
                .insert(key, (members.clone(), Instant::now() + ttl));
        }
        Ok(())
    }

    async fn generation(&self, group_id: &str) -> Result<u64> {
        Ok(self
            .generations
            .get(&members_key(group_id))
            .map(|g| *g)
            .unwrap_or(0))
    }

    async fn put_members_if_current(
        &self,
        group_id: &str,
        members: &HashSet<String>,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool> {
        let key = members_key(group_id);
        let current = self.generations.get(&key);
        if current.as_deref().copied().unwrap_or(0) != generation || members.is_empty() {
            return Ok(false);
        }
        self.entries
            .insert(key, (members.clone(), Instant::now() + ttl));
        drop(current);
        Ok(true)
    }

    async fn invalidate(&self, group_id: &str) -> Result<()> {
        let key = members_key(group_id);
        let mut generation = self.generations.entry(key.clone()).or_insert(0);
        *generation += 1;
        self.entries.remove(&key);
        drop(generation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_members_key() {
        assert_eq!(members_key("G1"), "group:members:G1");
    }

    #[tokio::test]
    async fn test_memory_cache_hit_and_invalidate() {
        let cache = MemoryMembershipCache::new();
        assert!(cache.get_members("G1").await.unwrap().is_none());

        cache
            .put_members("G1", &set(&["u1", "u2"]), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get_members("G1").await.unwrap(), Some(set(&["u1", "u2"])));

        cache.invalidate("G1").await.unwrap();
        assert!(cache.get_members("G1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache_expiry() {
        let cache = MemoryMembershipCache::new();
        cache
            .put_members("G1", &set(&["u1"]), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(cache.contains("G1"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!cache.contains("G1"));
        assert!(cache.get_members("G1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fill_rejected_after_invalidation() {
        let cache = MemoryMembershipCache::new();
        let seen = cache.generation("G1").await.unwrap();
        assert_eq!(seen, 0);

        cache.invalidate("G1").await.unwrap();
        let written = cache
            .put_members_if_current("G1", &set(&["u1"]), Duration::from_secs(60), seen)
            .await
            .unwrap();
        assert!(!written);
        assert!(!cache.contains("G1"));

        let current = cache.generation("G1").await.unwrap();
        assert_eq!(current, 1);
        let written = cache
            .put_members_if_current("G1", &set(&["u1", "u2"]), Duration::from_secs(60), current)
            .await
            .unwrap();
        assert!(written);
        assert_eq!(cache.get_members("G1").await.unwrap(), Some(set(&["u1", "u2"])));
    }

    #[tokio::test]
    async fn test_empty_set_is_a_miss() {
        let cache = MemoryMembershipCache::new();
        cache
            .put_members("G1", &HashSet::new(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get_members("G1").await.unwrap().is_none());
        assert!(!cache.contains("G1"));
    }
}
