//! Local fan-out.
//!
//! Recipient resolution is a table of strategies indexed by addressing mode.
//! The router and the broker consumers share one [`LocalFanout`], so a message
//! resolves to the same local recipients whichever path it arrives on.

use crate::message::{AddressingMode, DispatchedMessage, Message};
use crate::session::{ConnectionId, SessionHandle, SessionRegistry};
use async_trait::async_trait;
use group_directory::GroupDirectory;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves the local sessions a message should reach.
#[async_trait]
pub trait RecipientStrategy: Send + Sync {
    fn mode(&self) -> AddressingMode;

    async fn resolve(&self, message: &Message, registry: &SessionRegistry)
        -> Vec<Arc<SessionHandle>>;
}

/// The target subscriber's session, if it lives here.
#[derive(Debug, Default)]
pub struct DirectStrategy;

#[async_trait]
impl RecipientStrategy for DirectStrategy {
    fn mode(&self) -> AddressingMode {
        AddressingMode::Direct
    }

    async fn resolve(
        &self,
        message: &Message,
        registry: &SessionRegistry,
    ) -> Vec<Arc<SessionHandle>> {
        registry
            .lookup_by_subscriber(&message.group_or_target_id)
            .into_iter()
            .collect()
    }
}

/// Sessions of group members connected here.
///
/// If the directory cannot answer, falls back to whatever the membership
/// cache holds (possibly nothing).
#[derive(Debug)]
pub struct GroupStrategy {
    directory: GroupDirectory,
}

impl GroupStrategy {
    pub fn new(directory: GroupDirectory) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl RecipientStrategy for GroupStrategy {
    fn mode(&self) -> AddressingMode {
        AddressingMode::Group
    }

    async fn resolve(
        &self,
        message: &Message,
        registry: &SessionRegistry,
    ) -> Vec<Arc<SessionHandle>> {
        let group_id = &message.group_or_target_id;
        let members = match self.directory.members(group_id).await {
            Ok(members) => members,
            Err(e) if e.is_not_found() => {
                debug!("Group '{}' does not exist, no recipients", group_id);
                return Vec::new();
            }
            Err(e) => {
                warn!(
                    "Directory unavailable for group '{}', using cached members: {:?}",
                    group_id, e
                );
                counter!("chat_gateway_directory_degraded_total").increment(1);
                self.directory.cached_members(group_id).await
            }
        };

        members
            .iter()
            .filter_map(|member| registry.lookup_by_subscriber(member))
            .collect()
    }
}

/// Every live session here.
#[derive(Debug, Default)]
pub struct GlobalStrategy;

#[async_trait]
impl RecipientStrategy for GlobalStrategy {
    fn mode(&self) -> AddressingMode {
        AddressingMode::Global
    }

    async fn resolve(
        &self,
        _message: &Message,
        registry: &SessionRegistry,
    ) -> Vec<Arc<SessionHandle>> {
        registry.all_handles()
    }
}

/// Delivers dispatched messages to local sessions.
pub struct LocalFanout {
    registry: Arc<SessionRegistry>,
    strategies: [Box<dyn RecipientStrategy>; 3],
}

impl LocalFanout {
    pub fn new(registry: Arc<SessionRegistry>, directory: GroupDirectory) -> Self {
        Self {
            registry,
            strategies: [
                Box::new(DirectStrategy),
                Box::new(GroupStrategy::new(directory)),
                Box::new(GlobalStrategy),
            ],
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn strategy(&self, mode: AddressingMode) -> &dyn RecipientStrategy {
        self.strategies[mode.index()].as_ref()
    }

    /// Deliver to every local recipient except `exclude`.
    /// Returns the number of sessions the frame was queued on.
    pub async fn deliver(
        &self,
        message: &DispatchedMessage,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let mode = message.mode();
        let recipients = self
            .strategy(mode)
            .resolve(message.message(), &self.registry)
            .await;

        let mut delivered = 0;
        for handle in recipients {
            if Some(handle.id) == exclude {
                continue;
            }
            if handle.is_writable() && handle.deliver(message.ws_frame()) {
                delivered += 1;
            } else {
                debug!("Session {} not writable, skipping", handle.id);
                counter!("chat_gateway_delivery_failures_total").increment(1);
            }
        }

        counter!("chat_gateway_local_deliveries_total", "mode" => mode.to_string())
            .increment(delivered as u64);
        delivered
    }
}

impl std::fmt::Debug for LocalFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFanout")
            .field("registry", &self.registry)
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.mode()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
