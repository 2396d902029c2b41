//! Broker bridge: local fan-out → cluster-wide fan-out.
//!
//! ```text
//! DeliveryRouter ──publish──▶ LogTransport (direct | group | global)
//!                                   │
//!        ┌──────────────────────────┼──────────────────────────┐
//!        ▼                          ▼                          ▼
//!   consumer (this instance)   consumer (instance B)     consumer (instance C)
//!        │ self-filter               │                          │
//!        ▼                          ▼                          ▼
//!     dropped                  LocalFanout                LocalFanout
//! ```
//!
//! The originating instance has already delivered locally, so its own
//! consumer drops records stamped with its instance id.

pub mod memory;
pub mod nats;
pub mod transport;

pub use memory::MemoryLog;
pub use nats::NatsTransport;
pub use transport::LogTransport;

use crate::delivery::LocalFanout;
use crate::error::{GatewayError, Result};
use crate::message::{Channel, DispatchedMessage};
use futures::StreamExt;
use metrics::counter;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Resolves with the outcome of an asynchronous publish.
///
/// Dropping it does not cancel the publish.
pub type PublishHandle = oneshot::Receiver<Result<()>>;

/// Number of ordered publish lanes per bridge.
pub const DEFAULT_PUBLISH_LANES: usize = 8;

struct PublishJob {
    channel: Channel,
    message: DispatchedMessage,
    done: oneshot::Sender<Result<()>>,
}

/// Bridge counters.
#[derive(Debug, Default)]
pub struct BridgeStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    received: AtomicU64,
    self_filtered: AtomicU64,
    delivered: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStatsSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub received: u64,
    pub self_filtered: u64,
    pub delivered: u64,
    pub malformed: u64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            self_filtered: self.self_filtered.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Publishes dispatched messages to the log and re-delivers records from
/// other instances to local sessions.
///
/// Publishes go through a fixed set of lanes. A lane is a FIFO queue drained
/// by one task, and every record with the same channel and partition key
/// lands on the same lane, so records from one sender to one target reach
/// the log in send order. A retrying append holds back the rest of its lane.
pub struct BrokerBridge {
    instance_id: String,
    transport: Arc<dyn LogTransport>,
    fanout: Arc<LocalFanout>,
    stats: Arc<BridgeStats>,
    lane_count: usize,
    lanes: OnceLock<Vec<mpsc::UnboundedSender<PublishJob>>>,
}

impl BrokerBridge {
    pub fn new(
        instance_id: impl Into<String>,
        transport: Arc<dyn LogTransport>,
        fanout: Arc<LocalFanout>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            transport,
            fanout,
            stats: Arc::new(BridgeStats::default()),
            lane_count: DEFAULT_PUBLISH_LANES,
            lanes: OnceLock::new(),
        }
    }

    /// Set the number of publish lanes. Takes effect before the first publish.
    pub fn with_publish_lanes(mut self, lanes: usize) -> Self {
        self.lane_count = lanes.max(1);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn stats(&self) -> BridgeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Append a message to its channel without blocking the caller.
    ///
    /// Failures are logged and counted here and also returned through the
    /// handle.
    pub fn publish(&self, channel: Channel, message: &DispatchedMessage) -> PublishHandle {
        let (done, handle) = oneshot::channel();
        let job = PublishJob {
            channel,
            message: message.clone(),
            done,
        };

        let lanes = self.lanes.get_or_init(|| self.spawn_lanes());
        let lane = lane_index(channel, message.partition_key(), lanes.len());
        if let Err(mpsc::error::SendError(job)) = lanes[lane].send(job) {
            self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
            error!("Publish lane {} is closed, dropping {}", lane, job.message.dispatch_id());
            let _ = job
                .done
                .send(Err(GatewayError::Internal("publish lane closed".into())));
        }
        handle
    }

    fn spawn_lanes(&self) -> Vec<mpsc::UnboundedSender<PublishJob>> {
        (0..self.lane_count)
            .map(|lane| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_lane(lane, rx, self.transport.clone(), self.stats.clone()));
                tx
            })
            .collect()
    }

    /// Subscribe to every channel and spawn one consumer task per channel.
    ///
    /// Subscriptions are in place when this returns. Consumers stop when
    /// `shutdown` flips to `true` or its sender is dropped.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(Channel::ALL.len());

        for channel in Channel::ALL {
            let mut records = self.transport.consume(channel, &self.instance_id).await?;
            let bridge = self.clone();
            let mut shutdown = shutdown.clone();

            handles.push(tokio::spawn(async move {
                info!(
                    "Consumer for '{}' running on instance {}",
                    channel, bridge.instance_id
                );
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::select! {
                        biased;

                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }

                        record = records.next() => {
                            match record {
                                Some(payload) => {
                                    bridge.handle_payload(channel, &payload).await;
                                }
                                None => {
                                    warn!("Log subscription for '{}' ended", channel);
                                    break;
                                }
                            }
                        }
                    }
                }
                info!("Consumer for '{}' stopped", channel);
            }));
        }

        Ok(handles)
    }

    /// Process one record from the log. Returns the number of local
    /// deliveries, or `None` if the record was dropped.
    ///
    /// `received` is counted once the record is fully handled.
    pub async fn handle_payload(&self, channel: Channel, payload: &[u8]) -> Option<usize> {
        let delivered = self.process(channel, payload).await;
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        counter!("chat_gateway_received_total", "channel" => channel.as_str()).increment(1);
        delivered
    }

    async fn process(&self, channel: Channel, payload: &[u8]) -> Option<usize> {
        let message = match DispatchedMessage::from_wire(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed record on '{}': {:?}", channel, e);
                self.count_malformed();
                return None;
            }
        };

        if message.origin() == self.instance_id {
            self.stats.self_filtered.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if message.mode() != channel.mode() {
            warn!(
                "Dropping {} message that arrived on '{}'",
                message.mode(),
                channel
            );
            self.count_malformed();
            return None;
        }

        let delivered = self.fanout.deliver(&message, None).await;
        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        debug!(
            "Delivered {} message from {} to {} local sessions",
            message.mode(),
            message.origin(),
            delivered
        );
        Some(delivered)
    }

    fn count_malformed(&self) {
        self.stats.malformed.fetch_add(1, Ordering::Relaxed);
        counter!("chat_gateway_malformed_records_total").increment(1);
    }
}

fn lane_index(channel: Channel, partition_key: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    channel.as_str().hash(&mut hasher);
    partition_key.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

/// Drain one lane, appending strictly in arrival order.
async fn run_lane(
    lane: usize,
    mut jobs: mpsc::UnboundedReceiver<PublishJob>,
    transport: Arc<dyn LogTransport>,
    stats: Arc<BridgeStats>,
) {
    while let Some(PublishJob {
        channel,
        message,
        done,
    }) = jobs.recv().await
    {
        let result = transport
            .append(
                channel,
                message.partition_key(),
                message.dispatch_id(),
                message.payload(),
            )
            .await;

        match &result {
            Ok(()) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
                counter!("chat_gateway_published_total", "channel" => channel.as_str())
                    .increment(1);
                debug!("Published {} to {} (lane {})", message.dispatch_id(), channel, lane);
            }
            Err(e) => {
                stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                counter!("chat_gateway_publish_failures_total", "channel" => channel.as_str())
                    .increment(1);
                error!(
                    "Failed to publish {} to {}: {:?}",
                    message.dispatch_id(),
                    channel,
                    e
                );
            }
        }
        // Caller may have dropped the handle
        let _ = done.send(result);
    }
    debug!("Publish lane {} stopped", lane);
}

impl std::fmt::Debug for BrokerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerBridge")
            .field("instance_id", &self.instance_id)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
