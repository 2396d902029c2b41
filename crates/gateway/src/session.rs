//! Per-instance session registry.
//!
//! Two lock-free maps:
//! - connection id -> session (handle plus the subscriber it is bound to)
//! - subscriber id -> connection id
//!
//! Lock order is always `sessions` then `subscribers`; nothing takes them the
//! other way around.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerFrame;
use axum::extract::ws::Message as WsMessage;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique connection identifier, scoped to one instance.
pub type ConnectionId = Uuid;

/// Default buffer size for per-connection outbound queues.
pub const SESSION_CHANNEL_BUFFER_SIZE: usize = 1000;

/// Send capability for one live connection.
pub struct SessionHandle {
    pub id: ConnectionId,
    /// Bounded queue drained by the connection's writer task.
    tx: mpsc::Sender<WsMessage>,
    pub connected_at: i64,
}

impl SessionHandle {
    pub fn new(tx: mpsc::Sender<WsMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            connected_at: Utc::now().timestamp_millis(),
        }
    }

    /// Queue a raw frame without waiting.
    /// Returns false if the queue is full or the connection is gone.
    pub fn deliver(&self, frame: WsMessage) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Queue a control frame.
    pub fn send(&self, frame: ServerFrame) -> Result<()> {
        let json = serde_json::to_string(&frame)?;
        self.tx
            .try_send(WsMessage::Text(json.into()))
            .map_err(|_| GatewayError::ChannelSend)
    }

    pub fn is_writable(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

struct Session {
    handle: Arc<SessionHandle>,
    subscriber_id: Option<String>,
}

/// Registry of the sessions accepted by this instance.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Session>,
    subscribers: DashMap<String, ConnectionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new, not yet identified session.
    pub fn register(&self, handle: Arc<SessionHandle>) -> ConnectionId {
        let id = handle.id;
        self.sessions.insert(
            id,
            Session {
                handle,
                subscriber_id: None,
            },
        );
        debug!("Session {} registered", id);
        id
    }

    /// Bind a subscriber to a registered connection.
    ///
    /// A later bind for the same subscriber replaces this one.
    pub fn bind(&self, subscriber_id: &str, connection_id: ConnectionId) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&connection_id)
            .ok_or_else(|| GatewayError::ClientNotFound(connection_id.to_string()))?;

        if let Some(old) = session.subscriber_id.replace(subscriber_id.to_string()) {
            if old != subscriber_id {
                self.subscribers
                    .remove_if(&old, |_, bound| *bound == connection_id);
            }
        }
        if let Some(previous) = self
            .subscribers
            .insert(subscriber_id.to_string(), connection_id)
        {
            if previous != connection_id {
                info!(
                    "Subscriber {} rebound from {} to {}",
                    subscriber_id, previous, connection_id
                );
            }
        }
        Ok(())
    }

    /// Remove a session and any subscriber binding still pointing at it.
    pub fn unregister(&self, connection_id: &ConnectionId) {
        let Some((_, session)) = self.sessions.remove(connection_id) else {
            return;
        };
        if let Some(subscriber_id) = session.subscriber_id {
            self.subscribers
                .remove_if(&subscriber_id, |_, bound| bound == connection_id);
        }
        debug!("Session {} unregistered", connection_id);
    }

    pub fn lookup_connection(&self, connection_id: &ConnectionId) -> Option<Arc<SessionHandle>> {
        self.sessions
            .get(connection_id)
            .map(|s| s.handle.clone())
    }

    /// Current connection of a subscriber on this instance.
    pub fn lookup_by_subscriber(&self, subscriber_id: &str) -> Option<Arc<SessionHandle>> {
        let connection_id = *self.subscribers.get(subscriber_id)?;
        self.lookup_connection(&connection_id)
    }

    /// Subscriber bound to a connection, if identified.
    pub fn subscriber_of(&self, connection_id: &ConnectionId) -> Option<String> {
        self.sessions
            .get(connection_id)
            .and_then(|s| s.subscriber_id.clone())
    }

    /// Snapshot of every live handle.
    pub fn all_handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|s| s.handle.clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of identified subscribers.
    pub fn bound_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (Arc<SessionHandle>, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(4);
        (Arc::new(SessionHandle::new(tx)), rx)
    }

    #[test]
    fn test_register_bind_lookup() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle();
        let id = registry.register(h);

        assert!(registry.lookup_by_subscriber("u1").is_none());
        registry.bind("u1", id).unwrap();

        assert_eq!(registry.lookup_by_subscriber("u1").unwrap().id, id);
        assert_eq!(registry.lookup_connection(&id).unwrap().id, id);
        assert_eq!(registry.subscriber_of(&id).as_deref(), Some("u1"));
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.bound_count(), 1);
    }

    #[test]
    fn test_bind_unknown_connection_fails() {
        let registry = SessionRegistry::new();
        let err = registry.bind("u1", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, GatewayError::ClientNotFound(_)));
        assert_eq!(registry.bound_count(), 0);
    }

    #[test]
    fn test_unregister_removes_binding() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle();
        let id = registry.register(h);
        registry.bind("u1", id).unwrap();

        registry.unregister(&id);
        assert!(registry.lookup_by_subscriber("u1").is_none());
        assert!(registry.lookup_connection(&id).is_none());
        assert_eq!(registry.bound_count(), 0);
        assert!(registry.all_handles().is_empty());
    }

    #[test]
    fn test_rebind_survives_old_connection_teardown() {
        let registry = SessionRegistry::new();
        let (old, _rx1) = handle();
        let (new, _rx2) = handle();
        let old_id = registry.register(old);
        let new_id = registry.register(new);

        registry.bind("u1", old_id).unwrap();
        registry.bind("u1", new_id).unwrap();
        registry.unregister(&old_id);

        assert_eq!(registry.lookup_by_subscriber("u1").unwrap().id, new_id);
    }

    #[test]
    fn test_deliver_fails_when_full_or_closed() {
        let (tx, rx) = mpsc::channel(1);
        let h = SessionHandle::new(tx);

        assert!(h.deliver(WsMessage::Text("a".into())));
        assert!(!h.deliver(WsMessage::Text("b".into())));

        drop(rx);
        assert!(!h.is_writable());
        assert!(!h.deliver(WsMessage::Text("c".into())));
    }

    #[tokio::test]
    async fn test_concurrent_register_unregister() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(1);
                let id = registry.register(Arc::new(SessionHandle::new(tx)));
                registry.bind(&format!("u{}", i), id).unwrap();
                if i % 2 == 0 {
                    registry.unregister(&id);
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(registry.session_count(), 16);
        assert_eq!(registry.bound_count(), 16);
    }
}
