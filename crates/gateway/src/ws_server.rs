//! WebSocket server handler using Axum.

use crate::error::{GatewayError, Result};
use crate::inbox::Inbox;
use crate::instance::ChatInstance;
use crate::message::{AddressingMode, Message};
use crate::protocol::{ClientControl, ConnectParams, ServerFrame, GUEST_USER_ID};
use crate::session::{ConnectionId, SessionHandle, SESSION_CHANNEL_BUFFER_SIZE};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Interval between server pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state.
pub struct AppState {
    pub instance: ChatInstance,
    pub inbox: Arc<dyn Inbox>,
    pub session_buffer: usize,
}

impl AppState {
    pub fn new(instance: ChatInstance, inbox: Arc<dyn Inbox>) -> Self {
        Self {
            instance,
            inbox,
            session_buffer: SESSION_CHANNEL_BUFFER_SIZE,
        }
    }

    pub fn with_session_buffer(mut self, size: usize) -> Self {
        self.session_buffer = size.max(1);
        self
    }
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/ws/chat", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.instance.registry();
    Json(json!({
        "status": "ok",
        "serverId": state.instance.instance_id(),
        "sessions": registry.session_count(),
        "subscribers": registry.bound_count(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(socket: WebSocket, params: ConnectParams, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(state.session_buffer);

    let registry = state.instance.registry().clone();
    let handle = Arc::new(SessionHandle::new(tx));
    let connection_id = registry.register(handle.clone());

    let subscriber_id = params.subscriber_id().map(str::to_string);
    if let Some(subscriber_id) = &subscriber_id {
        if let Err(e) = registry.bind(subscriber_id, connection_id) {
            warn!("Failed to bind {} to {}: {:?}", subscriber_id, connection_id, e);
        }
    }

    counter!("chat_gateway_connections_total").increment(1);
    gauge!("chat_gateway_active_connections").set(registry.session_count() as f64);

    info!(
        "Connection {} opened (subscriber: {})",
        connection_id,
        subscriber_id.as_deref().unwrap_or(GUEST_USER_ID)
    );

    let _ = handle.send(ServerFrame::Connected {
        server_id: state.instance.instance_id().to_string(),
        user_id: subscriber_id
            .clone()
            .unwrap_or_else(|| GUEST_USER_ID.to_string()),
    });

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &handle, msg).await {
                            warn!("Error handling frame from {}: {:?}", connection_id, e);
                            let _ = handle.send(ServerFrame::Error {
                                message: e.to_string(),
                                code: e.code().to_string(),
                            });
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", connection_id, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if !handle.is_writable() {
                    break;
                }
                handle.deliver(WsMessage::Ping(Default::default()));
            }
        }
    }

    // Unregister before anything else can target this connection
    registry.unregister(&connection_id);
    send_task.abort();

    counter!("chat_gateway_disconnections_total").increment(1);
    gauge!("chat_gateway_active_connections").set(registry.session_count() as f64);

    info!("Connection {} closed", connection_id);
}

async fn handle_message(
    state: &Arc<AppState>,
    handle: &Arc<SessionHandle>,
    msg: WsMessage,
) -> Result<()> {
    match msg {
        WsMessage::Text(text) => handle_text(state, handle, text.as_str()).await,
        WsMessage::Binary(data) => {
            let text = std::str::from_utf8(&data)
                .map_err(|_| GatewayError::InvalidFrame("binary frame is not UTF-8".into()))?;
            handle_text(state, handle, text).await
        }
        // Pings are answered by the WebSocket layer
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) => Ok(()),
    }
}

async fn handle_text(state: &Arc<AppState>, handle: &Arc<SessionHandle>, text: &str) -> Result<()> {
    if let Ok(ClientControl::Ping) = serde_json::from_str::<ClientControl>(text) {
        return handle.send(ServerFrame::Pong);
    }

    let message: Message = serde_json::from_str(text)?;
    let connection_id = handle.id;
    let message = identify_sender(state, connection_id, message);

    let outcome = state
        .instance
        .router()
        .route_from(connection_id, message)
        .await?;

    if outcome.message.mode() == AddressingMode::Direct {
        let inbox = state.inbox.clone();
        let stashed = outcome.message.clone();
        tokio::spawn(async move {
            if let Err(e) = inbox.stash(&stashed).await {
                warn!("Failed to stash {} in inbox: {:?}", stashed.dispatch_id(), e);
            }
        });
    }

    debug!(
        "Routed {} from {} ({} local)",
        outcome.message.dispatch_id(),
        connection_id,
        outcome.local_deliveries
    );

    handle.send(ServerFrame::Ack {
        server_id: state.instance.instance_id().to_string(),
        local_deliveries: outcome.local_deliveries,
    })
}

/// An identified connection always sends as its own subscriber.
fn identify_sender(state: &AppState, connection_id: ConnectionId, mut message: Message) -> Message {
    if let Some(subscriber_id) = state.instance.registry().subscriber_of(&connection_id) {
        if message.sender_display_name.is_empty() {
            message.sender_display_name = subscriber_id.clone();
        }
        message.sender_id = subscriber_id;
    }
    message
}
