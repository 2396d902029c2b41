//! WebSocket protocol frames.
//!
//! Chat messages themselves use the [`Message`](crate::message::Message)
//! shape in both directions. This module holds the control frames around
//! them.

use serde::{Deserialize, Serialize};

/// Subscriber id reported for unidentified connections.
pub const GUEST_USER_ID: &str = "guest";

// ============================================================================
// Client → Server
// ============================================================================

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

impl ConnectParams {
    /// The subscriber id, if one was supplied and is not blank.
    pub fn subscriber_id(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Control frames a client may send instead of a chat message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControl {
    Ping,
}

// ============================================================================
// Server → Client
// ============================================================================

/// Control frame sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Sent once after the upgrade.
    Connected { server_id: String, user_id: String },
    /// Frame could not be processed. The connection stays open.
    Error { message: String, code: String },
    /// Message was routed; only local recipients are counted.
    Ack {
        server_id: String,
        local_deliveries: usize,
    },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connected_frame_shape() {
        let frame = ServerFrame::Connected {
            server_id: "node-a".into(),
            user_id: GUEST_USER_ID.into(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "connected", "serverId": "node-a", "userId": "guest"})
        );
    }

    #[test]
    fn test_ack_and_error_frames() {
        let ack = ServerFrame::Ack {
            server_id: "node-a".into(),
            local_deliveries: 2,
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type": "ack", "serverId": "node-a", "localDeliveries": 2})
        );

        let err = ServerFrame::Error {
            message: "bad".into(),
            code: "INVALID_MESSAGE".into(),
        };
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"type": "error", "message": "bad", "code": "INVALID_MESSAGE"})
        );
        assert_eq!(
            serde_json::to_value(&ServerFrame::Pong).unwrap(),
            json!({"type": "pong"})
        );
    }

    #[test]
    fn test_client_ping() {
        let ctl: ClientControl = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ctl, ClientControl::Ping));
        assert!(serde_json::from_str::<ClientControl>(r#"{"type":"UNICAST"}"#).is_err());
    }

    #[test]
    fn test_connect_params_blank_is_guest() {
        let blank = ConnectParams {
            user_id: Some("  ".into()),
        };
        assert!(blank.subscriber_id().is_none());
        assert!(ConnectParams::default().subscriber_id().is_none());

        let named = ConnectParams {
            user_id: Some("u1".into()),
        };
        assert_eq!(named.subscriber_id(), Some("u1"));
    }
}
