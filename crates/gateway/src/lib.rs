//! Chat gateway with cross-instance message fan-out.
//!
//! This service:
//! - Accepts WebSocket connections and binds them to subscriber ids
//! - Routes DIRECT, GROUP and GLOBAL messages to local sessions
//! - Publishes every routed message to a partitioned log
//! - Consumes the log and re-delivers messages from other instances
//!
//! ## Architecture
//!
//! ```text
//! WebSocket frame
//!         ↓
//! DeliveryRouter ──▶ LocalFanout ──▶ SessionRegistry ──▶ local sessions
//!         ↓                ▲
//! BrokerBridge ──▶ log ──▶ consumers (self-filtered on serverId)
//! ```
//!
//! A message is delivered locally by the instance that received it, and by
//! every other instance through its consumer. Each instance drops the
//! records it published itself, so no session sees a message twice.

pub mod bridge;
pub mod config;
pub mod delivery;
pub mod discovery;
pub mod error;
pub mod inbox;
pub mod instance;
pub mod message;
pub mod protocol;
pub mod router;
pub mod session;
pub mod ws_server;

pub use bridge::{
    BridgeStatsSnapshot, BrokerBridge, LogTransport, MemoryLog, NatsTransport, PublishHandle,
};
pub use config::GatewayConfig;
pub use delivery::{LocalFanout, RecipientStrategy};
pub use discovery::{ServiceDiscovery, ServiceInfo};
pub use error::{GatewayError, Result};
pub use inbox::{Inbox, MemoryInbox, RedisInbox};
pub use instance::ChatInstance;
pub use message::{AddressingMode, Channel, DispatchedMessage, Message};
pub use protocol::{ClientControl, ConnectParams, ServerFrame};
pub use router::{DeliveryRouter, RouteOutcome};
pub use session::{ConnectionId, SessionHandle, SessionRegistry};
pub use ws_server::{create_router, AppState};
