//! Best-effort inbox for direct messages.
//!
//! Every DIRECT message is appended to `user:inbox:{target}` with a 24 hour
//! expiry, whether or not the target is online. Failures are logged by the
//! caller and never affect delivery.

use crate::error::Result;
use crate::message::{AddressingMode, DispatchedMessage, Message};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use std::time::Duration;

/// Redis key prefix for inbox lists: user:inbox:{subscriber_id}
pub const INBOX_KEY_PREFIX: &str = "user:inbox:";

/// Inbox entry expiry.
pub const INBOX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub fn inbox_key(subscriber_id: &str) -> String {
    format!("{}{}", INBOX_KEY_PREFIX, subscriber_id)
}

#[async_trait]
pub trait Inbox: Send + Sync {
    /// Keep a copy of a direct message for its target.
    /// Messages in other modes are ignored.
    async fn stash(&self, message: &DispatchedMessage) -> Result<()>;
}

/// Inbox on Redis lists.
#[derive(Clone)]
pub struct RedisInbox {
    conn: MultiplexedConnection,
    ttl: Duration,
}

impl RedisInbox {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            ttl: INBOX_TTL,
        }
    }
}

#[async_trait]
impl Inbox for RedisInbox {
    async fn stash(&self, message: &DispatchedMessage) -> Result<()> {
        if message.mode() != AddressingMode::Direct {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let key = inbox_key(&message.message().group_or_target_id);

        let _: () = redis::pipe()
            .rpush(&key, message.frame_text())
            .ignore()
            .expire(&key, self.ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-process inbox.
#[derive(Debug, Clone, Default)]
pub struct MemoryInbox {
    entries: Arc<DashMap<String, Vec<Message>>>,
}

impl MemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stashed messages for a subscriber, oldest first.
    pub fn messages(&self, subscriber_id: &str) -> Vec<Message> {
        self.entries
            .get(&inbox_key(subscriber_id))
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Inbox for MemoryInbox {
    async fn stash(&self, message: &DispatchedMessage) -> Result<()> {
        if message.mode() != AddressingMode::Direct {
            return Ok(());
        }
        self.entries
            .entry(inbox_key(&message.message().group_or_target_id))
            .or_default()
            .push(message.message().clone());
        Ok(())
    }
}
