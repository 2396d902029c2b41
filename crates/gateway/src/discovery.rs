//! Instance liveness advertisement over Redis.
//!
//! Key layout:
//! - `service:{instance_id}` - JSON [`ServiceInfo`], expires after 90s
//! - `services:active` - set of advertised instance ids
//!
//! An instance heartbeats every 30s; a record without a heartbeat for 60s is
//! considered stale even if its key has not expired yet.

use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const SERVICE_KEY_PREFIX: &str = "service:";
pub const ACTIVE_SERVICES_KEY: &str = "services:active";

/// Expiry of a service record.
pub const SERVICE_TTL: Duration = Duration::from_secs(90);

/// A record older than this is ignored by [`ServiceDiscovery::discover`].
pub const STALE_AFTER_SECS: i64 = 60;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

fn service_key(instance_id: &str) -> String {
    format!("{}{}", SERVICE_KEY_PREFIX, instance_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub service_id: String,
    pub host: String,
    pub port: u16,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub active: bool,
}

impl ServiceInfo {
    pub fn new(service_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let now = Utc::now();
        Self {
            service_id: service_id.into(),
            host: host.into(),
            port,
            registered_at: now,
            last_heartbeat: now,
            active: true,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > ChronoDuration::seconds(STALE_AFTER_SECS)
    }
}

/// Advertises this instance and lists the others.
#[derive(Clone)]
pub struct ServiceDiscovery {
    conn: MultiplexedConnection,
    info: ServiceInfo,
}

impl ServiceDiscovery {
    pub fn new(conn: MultiplexedConnection, info: ServiceInfo) -> Self {
        Self { conn, info }
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    async fn write(&self, info: &ServiceInfo) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(info)?;
        let _: () = redis::pipe()
            .set_ex(service_key(&info.service_id), json, SERVICE_TTL.as_secs())
            .ignore()
            .sadd(ACTIVE_SERVICES_KEY, &info.service_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn register(&self) -> Result<()> {
        self.write(&self.info).await?;
        info!(
            "Registered instance {} at {}:{}",
            self.info.service_id, self.info.host, self.info.port
        );
        Ok(())
    }

    /// Refresh the record. Re-registers if it has expired.
    pub async fn heartbeat(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let current: Option<String> = conn.get(service_key(&self.info.service_id)).await?;

        let Some(json) = current else {
            warn!(
                "Service record for {} missing, re-registering",
                self.info.service_id
            );
            return self.register().await;
        };

        let mut info: ServiceInfo = serde_json::from_str(&json)?;
        info.last_heartbeat = Utc::now();
        info.active = true;
        self.write(&info).await?;
        debug!("Heartbeat sent for {}", info.service_id);
        Ok(())
    }

    /// Every advertised instance that is active and not stale.
    pub async fn discover(&self) -> Result<Vec<ServiceInfo>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(ACTIVE_SERVICES_KEY).await?;
        let now = Utc::now();

        let mut live = Vec::with_capacity(ids.len());
        for id in ids {
            let json: Option<String> = conn.get(service_key(&id)).await?;
            match json.map(|j| serde_json::from_str::<ServiceInfo>(&j)) {
                Some(Ok(info)) if info.active && !info.is_stale(now) => live.push(info),
                Some(Ok(_)) => debug!("Skipping stale instance {}", id),
                Some(Err(e)) => warn!("Corrupt service record for {}: {:?}", id, e),
                None => {
                    let _: () = conn.srem(ACTIVE_SERVICES_KEY, &id).await?;
                    debug!("Pruned expired instance {}", id);
                }
            }
        }
        Ok(live)
    }

    pub async fn unregister(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .del(service_key(&self.info.service_id))
            .ignore()
            .srem(ACTIVE_SERVICES_KEY, &self.info.service_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        info!("Unregistered instance {}", self.info.service_id);
        Ok(())
    }

    /// Heartbeat on `interval` until `shutdown` flips.
    pub async fn run_heartbeat(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; registration already happened
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!("Heartbeat failed: {:?}", e);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ServiceDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDiscovery")
            .field("info", &self.info)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_window() {
        let mut info = ServiceInfo::new("node-a", "localhost", 8080);
        let now = Utc::now();
        assert!(!info.is_stale(now));

        info.last_heartbeat = now - ChronoDuration::seconds(59);
        assert!(!info.is_stale(now));

        info.last_heartbeat = now - ChronoDuration::seconds(61);
        assert!(info.is_stale(now));
    }

    #[test]
    fn test_service_info_json() {
        let info = ServiceInfo::new("node-a", "10.0.0.5", 8080);
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["serviceId"], "node-a");
        assert_eq!(value["port"], 8080);
        assert!(value["lastHeartbeat"].is_string());
        assert_eq!(service_key("node-a"), "service:node-a");
    }
}
