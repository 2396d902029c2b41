//! Group record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default member cap for new groups.
pub const DEFAULT_MAX_MEMBERS: usize = 100;

/// Result of an add-member attempt against the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Subscriber was added.
    Added,
    /// Subscriber was already a member; nothing changed.
    AlreadyMember,
    /// Group is at capacity; nothing changed.
    Full,
}

impl AddOutcome {
    /// Whether the subscriber is a member after the attempt.
    pub fn accepted(self) -> bool {
        !matches!(self, AddOutcome::Full)
    }
}

/// A chat group as held by the durable store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub member_ids: HashSet<String>,
    /// Member cap; 0 means unlimited.
    pub max_members: usize,
    #[serde(default)]
    pub is_private: bool,
}

impl Group {
    /// Create an empty public group with the default member cap.
    pub fn new(group_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            name: name.into(),
            description: None,
            created_by: None,
            created_at: Utc::now(),
            member_ids: HashSet::new(),
            max_members: DEFAULT_MAX_MEMBERS,
            is_private: false,
        }
    }

    pub fn with_max_members(mut self, max_members: usize) -> Self {
        self.max_members = max_members;
        self
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.member_ids = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn private(mut self) -> Self {
        self.is_private = true;
        self
    }

    pub fn created_by(mut self, subscriber_id: impl Into<String>) -> Self {
        self.created_by = Some(subscriber_id.into());
        self
    }

    pub fn is_member(&self, subscriber_id: &str) -> bool {
        self.member_ids.contains(subscriber_id)
    }

    pub fn is_full(&self) -> bool {
        self.max_members > 0 && self.member_ids.len() >= self.max_members
    }

    /// Add a member, honouring the cap.
    pub fn try_add(&mut self, subscriber_id: &str) -> AddOutcome {
        if self.is_member(subscriber_id) {
            return AddOutcome::AlreadyMember;
        }
        if self.is_full() {
            return AddOutcome::Full;
        }
        self.member_ids.insert(subscriber_id.to_string());
        AddOutcome::Added
    }
}
