//! Assembly of one gateway instance.

use crate::bridge::{BridgeStatsSnapshot, BrokerBridge, LogTransport};
use crate::delivery::LocalFanout;
use crate::error::Result;
use crate::router::DeliveryRouter;
use crate::session::SessionRegistry;
use group_directory::GroupDirectory;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Registry, fan-out, bridge and router wired together for one instance id.
#[derive(Debug, Clone)]
pub struct ChatInstance {
    instance_id: String,
    registry: Arc<SessionRegistry>,
    directory: GroupDirectory,
    bridge: Arc<BrokerBridge>,
    router: Arc<DeliveryRouter>,
}

impl ChatInstance {
    pub fn new(
        instance_id: impl Into<String>,
        transport: Arc<dyn LogTransport>,
        directory: GroupDirectory,
    ) -> Self {
        let instance_id = instance_id.into();
        let registry = Arc::new(SessionRegistry::new());
        let fanout = Arc::new(LocalFanout::new(registry.clone(), directory.clone()));
        let bridge = Arc::new(BrokerBridge::new(
            instance_id.clone(),
            transport,
            fanout.clone(),
        ));
        let router = Arc::new(DeliveryRouter::new(
            instance_id.clone(),
            fanout,
            bridge.clone(),
        ));

        Self {
            instance_id,
            registry,
            directory,
            bridge,
            router,
        }
    }

    /// Start the broker consumers. Subscriptions are live on return.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        let handles = self.bridge.start(shutdown).await?;
        info!("Instance {} consuming {} channels", self.instance_id, handles.len());
        Ok(handles)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &GroupDirectory {
        &self.directory
    }

    pub fn router(&self) -> &Arc<DeliveryRouter> {
        &self.router
    }

    pub fn bridge_stats(&self) -> BridgeStatsSnapshot {
        self.bridge.stats()
    }
}
