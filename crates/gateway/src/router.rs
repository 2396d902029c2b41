//! Delivery router: local delivery first, then hand-off to the broker.

use crate::bridge::{BrokerBridge, PublishHandle};
use crate::delivery::LocalFanout;
use crate::error::Result;
use crate::message::{AddressingMode, Channel, DispatchedMessage, Message};
use crate::session::ConnectionId;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of routing one message.
#[derive(Debug)]
pub struct RouteOutcome {
    /// The stamped message as delivered and published.
    pub message: DispatchedMessage,
    /// Sessions on this instance the message was queued on.
    pub local_deliveries: usize,
    /// Resolves once the broker accepted (or gave up on) the message.
    pub publish: PublishHandle,
}

/// Routes client messages to local sessions and to the broker.
pub struct DeliveryRouter {
    instance_id: String,
    fanout: Arc<LocalFanout>,
    bridge: Arc<BrokerBridge>,
}

impl DeliveryRouter {
    pub fn new(
        instance_id: impl Into<String>,
        fanout: Arc<LocalFanout>,
        bridge: Arc<BrokerBridge>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            fanout,
            bridge,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Route a message that did not come from a local connection.
    pub async fn route(&self, message: Message) -> Result<RouteOutcome> {
        self.dispatch(message, None).await
    }

    /// Route a message sent on `origin`.
    ///
    /// GROUP and GLOBAL messages are not echoed back to `origin`. A DIRECT
    /// message addressed to the sender is still delivered.
    pub async fn route_from(&self, origin: ConnectionId, message: Message) -> Result<RouteOutcome> {
        let exclude = match message.addressing_mode {
            AddressingMode::Direct => None,
            AddressingMode::Group | AddressingMode::Global => Some(origin),
        };
        self.dispatch(message, exclude).await
    }

    async fn dispatch(
        &self,
        message: Message,
        exclude: Option<ConnectionId>,
    ) -> Result<RouteOutcome> {
        message.validate()?;
        let message = message.dispatch(&self.instance_id)?;
        let mode = message.mode();

        let local_deliveries = self.fanout.deliver(&message, exclude).await;

        // Local delivery already happened; a publish failure does not undo it
        let publish = self.bridge.publish(Channel::for_mode(mode), &message);

        counter!("chat_gateway_messages_routed_total", "mode" => mode.to_string()).increment(1);
        match mode {
            AddressingMode::Direct => debug!(
                "DIRECT {} -> {}: {} local delivery",
                message.message().sender_id,
                message.message().group_or_target_id,
                local_deliveries
            ),
            _ => info!(
                "{} from {} ({}): {} local deliveries",
                mode,
                message.message().sender_id,
                message.partition_key(),
                local_deliveries
            ),
        }

        Ok(RouteOutcome {
            message,
            local_deliveries,
            publish,
        })
    }
}

impl std::fmt::Debug for DeliveryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryRouter")
            .field("instance_id", &self.instance_id)
            .finish()
    }
}
