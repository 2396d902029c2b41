//! Partitioned log seam.

use crate::error::Result;
use crate::message::Channel;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// An append-only log with one logical channel per addressing mode.
///
/// Every consumer group sees every record appended after it subscribed.
/// Records sharing a partition key keep their append order.
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Append a record and wait until the log has durably accepted it.
    ///
    /// `record_id` identifies the record for duplicate suppression; appending
    /// the same id twice stores it once.
    async fn append(
        &self,
        channel: Channel,
        partition_key: &str,
        record_id: &str,
        payload: Bytes,
    ) -> Result<()>;

    /// Subscribe to a channel as `consumer_group`.
    async fn consume(&self, channel: Channel, consumer_group: &str)
        -> Result<BoxStream<'static, Bytes>>;
}
