//! Chat message model.
//!
//! A [`Message`] is what a client sends. Once the router stamps it with the
//! origin instance and send time it becomes a [`DispatchedMessage`]: shared,
//! immutable and serialized exactly once. Only dispatched messages can be
//! delivered to sessions or published to the broker.

use crate::error::{GatewayError, Result};
use axum::extract::ws::{Message as WsMessage, Utf8Bytes};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// How a message is addressed.
///
/// Wire names follow the client protocol (`UNICAST`, `MULTICAST`,
/// `BROADCAST`); the mode names are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressingMode {
    /// One target subscriber.
    #[serde(rename = "UNICAST", alias = "DIRECT")]
    Direct,
    /// Every member of a group.
    #[serde(rename = "MULTICAST", alias = "GROUP")]
    Group,
    /// Every connected subscriber.
    #[serde(rename = "BROADCAST", alias = "GLOBAL")]
    Global,
}

impl AddressingMode {
    /// All modes, in table order.
    pub const ALL: [AddressingMode; 3] = [
        AddressingMode::Direct,
        AddressingMode::Group,
        AddressingMode::Global,
    ];

    /// Position in per-mode lookup tables.
    pub const fn index(self) -> usize {
        match self {
            AddressingMode::Direct => 0,
            AddressingMode::Group => 1,
            AddressingMode::Global => 2,
        }
    }
}

impl fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressingMode::Direct => write!(f, "DIRECT"),
            AddressingMode::Group => write!(f, "GROUP"),
            AddressingMode::Global => write!(f, "GLOBAL"),
        }
    }
}

/// Logical broker channel. One per addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Direct,
    Group,
    Global,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Direct, Channel::Group, Channel::Global];

    pub fn for_mode(mode: AddressingMode) -> Self {
        match mode {
            AddressingMode::Direct => Channel::Direct,
            AddressingMode::Group => Channel::Group,
            AddressingMode::Global => Channel::Global,
        }
    }

    pub fn mode(self) -> AddressingMode {
        match self {
            Channel::Direct => AddressingMode::Direct,
            Channel::Group => AddressingMode::Group,
            Channel::Global => AddressingMode::Global,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Direct => "direct",
            Channel::Group => "group",
            Channel::Global => "global",
        }
    }

    pub fn index(self) -> usize {
        self.mode().index()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message as sent by a client and delivered to recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Target subscriber (DIRECT) or group id (GROUP). Unused for GLOBAL.
    #[serde(rename = "roomId", default)]
    pub group_or_target_id: String,
    #[serde(rename = "senderId", default)]
    pub sender_id: String,
    #[serde(rename = "senderUsername", default)]
    pub sender_display_name: String,
    #[serde(rename = "content", default)]
    pub body: String,
    #[serde(rename = "type")]
    pub addressing_mode: AddressingMode,
    #[serde(rename = "timestamp", default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(rename = "serverId", default, skip_serializing_if = "Option::is_none")]
    pub origin_instance_id: Option<String>,
}

impl Message {
    /// Create an unstamped message.
    pub fn new(
        addressing_mode: AddressingMode,
        group_or_target_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let sender_id = sender_id.into();
        Self {
            group_or_target_id: group_or_target_id.into(),
            sender_display_name: sender_id.clone(),
            sender_id,
            body: body.into(),
            addressing_mode,
            sent_at: None,
            origin_instance_id: None,
        }
    }

    pub fn direct(
        target_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(AddressingMode::Direct, target_id, sender_id, body)
    }

    pub fn group(
        group_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(AddressingMode::Group, group_id, sender_id, body)
    }

    pub fn global(sender_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(AddressingMode::Global, "", sender_id, body)
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.sender_display_name = name.into();
        self
    }

    /// Reject messages whose addressing cannot be resolved.
    pub fn validate(&self) -> Result<()> {
        match self.addressing_mode {
            AddressingMode::Direct if self.group_or_target_id.is_empty() => Err(
                GatewayError::InvalidFrame("DIRECT message needs a target in roomId".into()),
            ),
            AddressingMode::Group if self.group_or_target_id.is_empty() => Err(
                GatewayError::InvalidFrame("GROUP message needs a group id in roomId".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Stamp origin and send time, freezing the message.
    ///
    /// `sent_at` is kept if the client supplied one; `origin_instance_id`
    /// is always overwritten.
    pub fn dispatch(mut self, instance_id: &str) -> Result<DispatchedMessage> {
        self.origin_instance_id = Some(instance_id.to_string());
        self.sent_at.get_or_insert_with(Utc::now);
        DispatchedMessage::seal(Uuid::new_v4().to_string(), self)
    }
}

struct Sealed {
    dispatch_id: String,
    message: Message,
    frame: Utf8Bytes,
}

/// A stamped, immutable message with its JSON frame pre-serialized.
///
/// Cheap to clone; all clones share one allocation.
#[derive(Clone)]
pub struct DispatchedMessage {
    inner: Arc<Sealed>,
}

impl DispatchedMessage {
    fn seal(dispatch_id: String, message: Message) -> Result<Self> {
        let frame = serde_json::to_string(&message)?;
        Ok(Self {
            inner: Arc::new(Sealed {
                dispatch_id,
                message,
                frame: frame.into(),
            }),
        })
    }

    /// Decode a message received from the broker.
    ///
    /// Anything that left an instance carries its origin, so a payload
    /// without one is rejected.
    pub fn from_wire(payload: &[u8]) -> Result<Self> {
        let message: Message = serde_json::from_slice(payload)?;
        match message.origin_instance_id.as_deref() {
            Some(origin) if !origin.is_empty() => {}
            _ => {
                return Err(GatewayError::InvalidFrame(
                    "broker payload without serverId".into(),
                ))
            }
        }
        Self::seal(Uuid::new_v4().to_string(), message)
    }

    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    /// Unique id of this dispatch, used as the broker idempotency key.
    pub fn dispatch_id(&self) -> &str {
        &self.inner.dispatch_id
    }

    pub fn mode(&self) -> AddressingMode {
        self.inner.message.addressing_mode
    }

    pub fn origin(&self) -> &str {
        self.inner.message.origin_instance_id.as_deref().unwrap_or_default()
    }

    /// The JSON delivery frame.
    pub fn frame_text(&self) -> &str {
        self.inner.frame.as_str()
    }

    /// The delivery frame as a WebSocket message.
    pub fn ws_frame(&self) -> WsMessage {
        WsMessage::Text(self.inner.frame.clone())
    }

    /// The delivery frame as a broker payload.
    pub fn payload(&self) -> Bytes {
        Bytes::copy_from_slice(self.inner.frame.as_str().as_bytes())
    }

    /// Key that selects the log partition: the target for DIRECT, the group
    /// for GROUP and the sender for GLOBAL.
    pub fn partition_key(&self) -> &str {
        let message = &self.inner.message;
        match message.addressing_mode {
            AddressingMode::Direct | AddressingMode::Group => &message.group_or_target_id,
            AddressingMode::Global => &message.sender_id,
        }
    }
}

impl fmt::Debug for DispatchedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchedMessage")
            .field("dispatch_id", &self.inner.dispatch_id)
            .field("message", &self.inner.message)
            .finish()
    }
}
