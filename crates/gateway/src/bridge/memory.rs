//! In-process log.
//!
//! Several instances built over clones of one [`MemoryLog`] form a cluster
//! inside a single process. Each channel is a broadcast channel, so every
//! subscriber sees every record appended after it subscribed. Consumer
//! groups are not tracked; one subscription per instance per channel gives
//! the same fan-out.
//!
//! Record ids are deduplicated within a sliding window, the same way the
//! broker's duplicate window works. Ids older than the window are forgotten.

use super::transport::LogTransport;
use crate::error::Result;
use crate::message::Channel;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use nats_client::DEFAULT_DUPLICATE_WINDOW;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Records buffered per channel before slow subscribers start lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Expired ids are swept once every this many accepted records.
const PRUNE_EVERY: u64 = 256;

struct Shared {
    channels: [broadcast::Sender<Bytes>; 3],
    seen: DashMap<(Channel, String), Instant>,
    dedup_window: Duration,
    appended: AtomicU64,
}

/// [`LogTransport`] kept entirely in memory.
#[derive(Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(capacity, DEFAULT_DUPLICATE_WINDOW)
    }

    /// How long a record id is remembered for deduplication.
    pub fn with_dedup_window(window: Duration) -> Self {
        Self::build(DEFAULT_CHANNEL_CAPACITY, window)
    }

    fn build(capacity: usize, dedup_window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                channels: [
                    broadcast::channel(capacity).0,
                    broadcast::channel(capacity).0,
                    broadcast::channel(capacity).0,
                ],
                seen: DashMap::new(),
                dedup_window,
                appended: AtomicU64::new(0),
            }),
        }
    }

    /// Number of distinct records accepted so far.
    pub fn appended(&self) -> u64 {
        self.shared.appended.load(Ordering::Relaxed)
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<Bytes> {
        &self.shared.channels[channel.index()]
    }

    /// Record the id; false if it was already seen inside the window.
    fn first_sighting(&self, channel: Channel, record_id: &str) -> bool {
        let now = Instant::now();
        let window = self.shared.dedup_window;
        match self.shared.seen.entry((channel, record_id.to_string())) {
            Entry::Occupied(seen) if now.duration_since(*seen.get()) < window => false,
            Entry::Occupied(mut seen) => {
                seen.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    fn prune(&self) {
        let now = Instant::now();
        let window = self.shared.dedup_window;
        let before = self.shared.seen.len();
        self.shared
            .seen
            .retain(|_, seen_at| now.duration_since(*seen_at) < window);
        debug!(
            "Pruned {} expired record ids",
            before.saturating_sub(self.shared.seen.len())
        );
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogTransport for MemoryLog {
    async fn append(
        &self,
        channel: Channel,
        partition_key: &str,
        record_id: &str,
        payload: Bytes,
    ) -> Result<()> {
        if !self.first_sighting(channel, record_id) {
            debug!("Duplicate record {} on {} ignored", record_id, channel);
            return Ok(());
        }
        let appended = self.shared.appended.fetch_add(1, Ordering::Relaxed) + 1;
        if appended % PRUNE_EVERY == 0 {
            self.prune();
        }

        // No subscribers means nobody is live to receive it
        let receivers = self.sender(channel).send(payload).unwrap_or(0);
        debug!(
            "Appended {} to {} (key {}, {} subscribers)",
            record_id, channel, partition_key, receivers
        );
        Ok(())
    }

    async fn consume(
        &self,
        channel: Channel,
        consumer_group: &str,
    ) -> Result<BoxStream<'static, Bytes>> {
        let rx = self.sender(channel).subscribe();
        let group = consumer_group.to_string();

        let records = stream::unfold((rx, group), move |(mut rx, group)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, (rx, group))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Consumer {} on {} lagged, skipped {} records", group, channel, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(records.boxed())
    }
}

impl std::fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLog")
            .field("appended", &self.appended())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_every_consumer_sees_every_record() {
        let log = MemoryLog::new();
        let mut a = log.consume(Channel::Group, "node-a").await.unwrap();
        let mut b = log.consume(Channel::Group, "node-b").await.unwrap();

        log.append(Channel::Group, "G1", "m1", Bytes::from_static(b"one"))
            .await
            .unwrap();
        log.append(Channel::Group, "G1", "m2", Bytes::from_static(b"two"))
            .await
            .unwrap();

        for consumer in [&mut a, &mut b] {
            assert_eq!(consumer.next().await.unwrap(), Bytes::from_static(b"one"));
            assert_eq!(consumer.next().await.unwrap(), Bytes::from_static(b"two"));
        }
    }

    #[tokio::test]
    async fn test_duplicate_record_id_stored_once() {
        let log = MemoryLog::new();
        let mut consumer = log.consume(Channel::Direct, "node-a").await.unwrap();

        for _ in 0..3 {
            log.append(Channel::Direct, "u2", "m1", Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        assert_eq!(log.appended(), 1);
        assert!(consumer.next().await.is_some());
        assert!(timeout(Duration::from_millis(50), consumer.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_record_id_accepted_again_after_window() {
        let log = MemoryLog::with_dedup_window(Duration::from_millis(30));
        log.append(Channel::Direct, "u2", "m1", Bytes::from_static(b"x"))
            .await
            .unwrap();
        log.append(Channel::Direct, "u2", "m1", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(log.appended(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        log.append(Channel::Direct, "u2", "m1", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(log.appended(), 2);
    }

    #[tokio::test]
    async fn test_expired_ids_are_swept() {
        let log = MemoryLog::with_dedup_window(Duration::from_millis(20));
        for i in 0..10 {
            log.append(Channel::Global, "u1", &format!("m{}", i), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        assert_eq!(log.shared.seen.len(), 10);

        tokio::time::sleep(Duration::from_millis(40)).await;
        log.prune();
        assert!(log.shared.seen.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_runs_during_appends() {
        let log = MemoryLog::with_dedup_window(Duration::ZERO);
        for i in 0..PRUNE_EVERY {
            log.append(Channel::Global, "u1", &format!("m{}", i), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        assert_eq!(log.appended(), PRUNE_EVERY);
        assert!(log.shared.seen.is_empty());
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let log = MemoryLog::new();
        let mut direct = log.consume(Channel::Direct, "node-a").await.unwrap();

        log.append(Channel::Global, "u1", "m1", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(50), direct.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_records() {
        let log = MemoryLog::new();
        log.append(Channel::Global, "u1", "m1", Bytes::from_static(b"early"))
            .await
            .unwrap();

        let mut late = log.consume(Channel::Global, "node-a").await.unwrap();
        log.append(Channel::Global, "u1", "m2", Bytes::from_static(b"late"))
            .await
            .unwrap();
        assert_eq!(late.next().await.unwrap(), Bytes::from_static(b"late"));
    }
}
