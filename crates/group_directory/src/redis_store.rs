//! Redis-backed durable group store.
//!
//! Key layout:
//! - `group:record:{group_id}` - hash of group fields
//! - `group:roster:{group_id}` - set of member subscriber ids
//!
//! These keys are separate from the membership cache (`group:members:*`),
//! which is disposable and only ever repopulated from this store.

use crate::error::{DirectoryError, Result};
use crate::model::{AddOutcome, Group};
use crate::store::GroupStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Redis key prefix for group records: group:record:{group_id}
pub const RECORD_KEY_PREFIX: &str = "group:record:";

/// Redis key prefix for member rosters: group:roster:{group_id}
pub const ROSTER_KEY_PREFIX: &str = "group:roster:";

/// Capacity check and insert in one atomic step.
/// Returns -1 (no group), 0 (full), 1 (already member), 2 (added).
const ADD_MEMBER_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
  return 1
end
local max = tonumber(redis.call('HGET', KEYS[1], 'maxMembers') or '0')
if max > 0 and redis.call('SCARD', KEYS[2]) >= max then
  return 0
end
redis.call('SADD', KEYS[2], ARGV[1])
return 2
"#;

fn record_key(group_id: &str) -> String {
    format!("{}{}", RECORD_KEY_PREFIX, group_id)
}

fn roster_key(group_id: &str) -> String {
    format!("{}{}", ROSTER_KEY_PREFIX, group_id)
}

/// Durable group store on Redis.
#[derive(Clone)]
pub struct RedisGroupStore {
    conn: MultiplexedConnection,
    add_member_script: redis::Script,
}

impl RedisGroupStore {
    /// Create a store over an established multiplexed connection.
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            add_member_script: redis::Script::new(ADD_MEMBER_SCRIPT),
        }
    }

    /// Open a client and connect.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(conn))
    }

    fn record_fields(group: &Group) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("name", group.name.clone()),
            ("createdAt", group.created_at.to_rfc3339()),
            ("maxMembers", group.max_members.to_string()),
            ("isPrivate", group.is_private.to_string()),
        ];
        if let Some(description) = &group.description {
            fields.push(("description", description.clone()));
        }
        if let Some(created_by) = &group.created_by {
            fields.push(("createdBy", created_by.clone()));
        }
        fields
    }

    fn group_from_fields(
        group_id: &str,
        mut fields: HashMap<String, String>,
        members: HashSet<String>,
    ) -> Result<Group> {
        let corrupt = |field: &str| {
            DirectoryError::StoreUnavailable(format!(
                "group '{}' has a corrupt '{}' field",
                group_id, field
            ))
        };

        let created_at = fields
            .get("createdAt")
            .map(|s| DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .map_err(|_| corrupt("createdAt"))?
            .unwrap_or_else(Utc::now);
        let max_members = fields
            .get("maxMembers")
            .map(|s| s.parse::<usize>())
            .transpose()
            .map_err(|_| corrupt("maxMembers"))?
            .unwrap_or(0);
        let is_private = fields
            .get("isPrivate")
            .map(|s| s == "true")
            .unwrap_or(false);

        Ok(Group {
            group_id: group_id.to_string(),
            name: fields.remove("name").unwrap_or_default(),
            description: fields.remove("description"),
            created_by: fields.remove("createdBy"),
            created_at,
            member_ids: members,
            max_members,
            is_private,
        })
    }
}

#[async_trait]
impl GroupStore for RedisGroupStore {
    async fn create(&self, group: Group) -> Result<Group> {
        if group.group_id.is_empty() {
            return Err(DirectoryError::InvalidGroup("empty group id".to_string()));
        }

        let mut conn = self.conn.clone();
        let record = record_key(&group.group_id);

        // Claim the id first so concurrent creates cannot both succeed
        let claimed: bool = conn.hset_nx(&record, "groupId", &group.group_id).await?;
        if !claimed {
            return Err(DirectoryError::GroupExists(group.group_id));
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&record, &Self::record_fields(&group))
            .ignore();
        if !group.member_ids.is_empty() {
            let members: Vec<&str> = group.member_ids.iter().map(String::as_str).collect();
            pipe.sadd(roster_key(&group.group_id), members).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        info!(
            "Created group '{}' with {} members (max {})",
            group.group_id,
            group.member_ids.len(),
            group.max_members
        );
        Ok(group)
    }

    async fn find_by_id(&self, group_id: &str) -> Result<Option<Group>> {
        let mut conn = self.conn.clone();

        let fields: HashMap<String, String> = conn.hgetall(record_key(group_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let members: HashSet<String> = conn.smembers(roster_key(group_id)).await?;

        debug!("Loaded group '{}' ({} members) from store", group_id, members.len());
        Self::group_from_fields(group_id, fields, members).map(Some)
    }

    async fn add_member(&self, group_id: &str, subscriber_id: &str) -> Result<AddOutcome> {
        let mut conn = self.conn.clone();

        let code: i64 = self
            .add_member_script
            .key(record_key(group_id))
            .key(roster_key(group_id))
            .arg(subscriber_id)
            .invoke_async(&mut conn)
            .await?;

        match code {
            -1 => Err(DirectoryError::GroupNotFound(group_id.to_string())),
            0 => Ok(AddOutcome::Full),
            1 => Ok(AddOutcome::AlreadyMember),
            2 => Ok(AddOutcome::Added),
            other => Err(DirectoryError::StoreUnavailable(format!(
                "unexpected add-member result {}",
                other
            ))),
        }
    }

    async fn remove_member(&self, group_id: &str, subscriber_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();

        let exists: bool = conn.exists(record_key(group_id)).await?;
        if !exists {
            return Err(DirectoryError::GroupNotFound(group_id.to_string()));
        }
        let removed: i64 = conn.srem(roster_key(group_id), subscriber_id).await?;
        Ok(removed > 0)
    }

    async fn delete(&self, group_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();

        let deleted: i64 = conn
            .del(vec![record_key(group_id), roster_key(group_id)])
            .await?;
        if deleted > 0 {
            info!("Deleted group '{}'", group_id);
        }
        Ok(deleted > 0)
    }

    async fn exists(&self, group_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(record_key(group_id)).await?;
        Ok(exists)
    }
}
