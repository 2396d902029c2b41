//! JetStream-backed log.
//!
//! Subjects: `chat.{channel}.{partition_key}`. One stream captures all three
//! channels; each instance reads each channel through its own durable
//! consumer `{instance}-{channel}`.

use super::transport::LogTransport;
use crate::error::Result;
use crate::message::Channel;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use nats_client::{subject_token, NatsClient, StreamConfig};
use tracing::debug;

/// Subject prefix shared by every chat channel.
pub const SUBJECT_PREFIX: &str = "chat";

/// Default stream name.
pub const DEFAULT_STREAM_NAME: &str = "CHAT";

/// Stream definition covering every chat channel.
pub fn chat_stream_config(stream_name: &str, replicas: usize) -> StreamConfig {
    let channels: Vec<&str> = Channel::ALL.iter().map(|c| c.as_str()).collect();
    StreamConfig::for_channels(stream_name, SUBJECT_PREFIX, &channels).with_replicas(replicas)
}

/// Subject a record with this partition key is published on.
pub fn publish_subject(channel: Channel, partition_key: &str) -> String {
    format!(
        "{}.{}.{}",
        SUBJECT_PREFIX,
        channel.as_str(),
        subject_token(partition_key)
    )
}

/// Subject filter matching every partition of a channel.
pub fn channel_filter(channel: Channel) -> String {
    format!("{}.{}.>", SUBJECT_PREFIX, channel.as_str())
}

/// Durable consumer name for a consumer group on a channel.
pub fn durable_name(consumer_group: &str, channel: Channel) -> String {
    format!("{}-{}", subject_token(consumer_group), channel.as_str())
}

/// [`LogTransport`] over a JetStream stream.
#[derive(Clone)]
pub struct NatsTransport {
    client: NatsClient,
    stream_name: String,
}

impl NatsTransport {
    /// Create a transport over an existing stream.
    pub fn new(client: NatsClient, stream_name: impl Into<String>) -> Self {
        Self {
            client,
            stream_name: stream_name.into(),
        }
    }

    /// Create the stream if needed, then build the transport.
    pub async fn provision(client: NatsClient, stream_name: &str, replicas: usize) -> Result<Self> {
        client
            .ensure_stream_with_config(&chat_stream_config(stream_name, replicas))
            .await?;
        Ok(Self::new(client, stream_name))
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }
}

#[async_trait]
impl LogTransport for NatsTransport {
    async fn append(
        &self,
        channel: Channel,
        partition_key: &str,
        record_id: &str,
        payload: Bytes,
    ) -> Result<()> {
        let subject = publish_subject(channel, partition_key);
        let sequence = self
            .client
            .publish_idempotent(&subject, record_id, payload)
            .await?;
        debug!("Appended {} to {} (seq {})", record_id, subject, sequence);
        Ok(())
    }

    async fn consume(
        &self,
        channel: Channel,
        consumer_group: &str,
    ) -> Result<BoxStream<'static, Bytes>> {
        let payloads = self
            .client
            .durable_payloads(
                &self.stream_name,
                &durable_name(consumer_group, channel),
                &channel_filter(channel),
            )
            .await?;
        Ok(payloads)
    }
}

impl std::fmt::Debug for NatsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsTransport")
            .field("stream_name", &self.stream_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects() {
        assert_eq!(publish_subject(Channel::Direct, "u2"), "chat.direct.u2");
        assert_eq!(publish_subject(Channel::Group, "team.one"), "chat.group.team_one");
        assert_eq!(channel_filter(Channel::Global), "chat.global.>");
    }

    #[test]
    fn test_durable_name_per_instance_and_channel() {
        assert_eq!(durable_name("node-a", Channel::Group), "node-a-group");
        assert_eq!(durable_name("host.local", Channel::Direct), "host_local-direct");
    }

    #[test]
    fn test_stream_config_covers_all_channels() {
        let config = chat_stream_config(DEFAULT_STREAM_NAME, 3);
        assert_eq!(config.name, "CHAT");
        assert_eq!(config.replicas, 3);
        for channel in Channel::ALL {
            assert!(config.subjects.contains(&channel_filter(channel)));
        }
    }
}
