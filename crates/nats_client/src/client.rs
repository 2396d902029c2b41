//! NATS client with JetStream support for the chat fan-out log.
//!
//! Every gateway instance publishes to and consumes from one JetStream stream.
//! Each instance consumes through its own durable consumer, so every instance
//! sees every message (fan-out rather than load-balanced consumption).

use anyhow::{anyhow, Result};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy},
    stream::Stream,
};
use async_nats::{header, Client, HeaderMap};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default retention period for the chat stream (1 hour).
pub const DEFAULT_RETENTION_SECS: u64 = 3600;

/// Default max messages retained in the chat stream.
pub const DEFAULT_MAX_MESSAGES: i64 = 1_000_000;

/// Default max bytes retained in the chat stream (1GB).
pub const DEFAULT_MAX_BYTES: i64 = 1_073_741_824;

/// Window in which a repeated `Nats-Msg-Id` is treated as a duplicate publish.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// Maximum publish attempts before a failure is reported.
pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;

/// Idle time after which the server deletes a durable consumer nobody pulls
/// from, so consumers of instances that never come back are reaped.
pub const DEFAULT_CONSUMER_INACTIVE_THRESHOLD: Duration = Duration::from_secs(300);

/// Initial backoff between publish retries.
const PUBLISH_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for the chat stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subject patterns to capture.
    pub subjects: Vec<String>,
    /// Retention period in seconds.
    pub max_age_secs: u64,
    /// Maximum number of messages.
    pub max_messages: i64,
    /// Maximum bytes.
    pub max_bytes: i64,
    /// Number of replicas. A publish is acknowledged only once the
    /// replicated write is committed.
    pub replicas: usize,
    /// Duplicate suppression window for idempotent publishes.
    pub duplicate_window: Duration,
}

impl StreamConfig {
    /// Create a stream config capturing `{prefix}.{channel}.>` for every channel.
    ///
    /// ```ignore
    /// let config = StreamConfig::for_channels("CHAT", "chat", &["direct", "group", "global"]);
    /// assert_eq!(config.subjects[0], "chat.direct.>");
    /// ```
    pub fn for_channels(name: &str, prefix: &str, channels: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            subjects: channels
                .iter()
                .map(|channel| format!("{}.{}.>", prefix, channel))
                .collect(),
            max_age_secs: DEFAULT_RETENTION_SECS,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_bytes: DEFAULT_MAX_BYTES,
            replicas: 1,
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
        }
    }

    /// Set retention period in seconds.
    pub fn with_retention(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }

    /// Set the replica count.
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas.max(1);
        self
    }
}

/// Make an arbitrary identifier safe to use as a single subject token.
///
/// Subject tokens cannot contain `.`, `*`, `>` or whitespace; those are
/// replaced with `_`. Empty keys map to `_`.
pub fn subject_token(key: &str) -> String {
    if key.is_empty() {
        return "_".to_string();
    }
    key.chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// Pull consumer settings for one instance's view of a channel.
pub fn durable_config(durable_name: &str, filter_subject: &str) -> pull::Config {
    pull::Config {
        durable_name: Some(durable_name.to_string()),
        filter_subject: filter_subject.to_string(),
        deliver_policy: DeliverPolicy::New,
        ack_policy: AckPolicy::Explicit,
        inactive_threshold: DEFAULT_CONSUMER_INACTIVE_THRESHOLD,
        ..Default::default()
    }
}

/// Wrapper around the NATS client with JetStream context.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
    jetstream: jetstream::Context,
    publish_attempts: u32,
}

impl NatsClient {
    /// Connect to a NATS server and create a JetStream context.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            publish_attempts: DEFAULT_PUBLISH_ATTEMPTS,
        })
    }

    /// Override the bounded publish retry count.
    pub fn with_publish_attempts(mut self, attempts: u32) -> Self {
        self.publish_attempts = attempts.max(1);
        self
    }

    /// Create or get a stream with the given configuration.
    pub async fn ensure_stream_with_config(&self, config: &StreamConfig) -> Result<Stream> {
        info!(
            "Ensuring stream '{}' exists (subjects: {:?}, retention: {}s, replicas: {})",
            config.name, config.subjects, config.max_age_secs, config.replicas
        );

        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.name.clone(),
                subjects: config.subjects.clone(),
                retention: jetstream::stream::RetentionPolicy::Limits,
                max_messages: config.max_messages,
                max_bytes: config.max_bytes,
                max_age: Duration::from_secs(config.max_age_secs),
                storage: jetstream::stream::StorageType::File,
                num_replicas: config.replicas,
                duplicate_window: config.duplicate_window,
                ..Default::default()
            })
            .await?;

        info!("Stream '{}' ready", config.name);
        Ok(stream)
    }

    /// Publish to JetStream and wait for the stream acknowledgment.
    ///
    /// `message_id` is sent as `Nats-Msg-Id`, so retries inside the duplicate
    /// window are stored once. Retries are bounded with exponential backoff.
    pub async fn publish_idempotent(
        &self,
        subject: &str,
        message_id: &str,
        payload: Bytes,
    ) -> Result<u64> {
        let mut backoff = PUBLISH_RETRY_BACKOFF;
        let mut last_error = None;

        for attempt in 1..=self.publish_attempts {
            let mut headers = HeaderMap::new();
            headers.insert(header::NATS_MESSAGE_ID, message_id);

            let result = async {
                let ack = self
                    .jetstream
                    .publish_with_headers(subject.to_string(), headers, payload.clone())
                    .await?
                    .await?;
                Ok::<_, anyhow::Error>(ack)
            }
            .await;

            match result {
                Ok(ack) => {
                    if ack.duplicate {
                        debug!("Publish {} on {} was a duplicate", message_id, subject);
                    }
                    return Ok(ack.sequence);
                }
                Err(e) => {
                    warn!(
                        "Publish attempt {}/{} to {} failed: {:?}",
                        attempt, self.publish_attempts, subject, e
                    );
                    last_error = Some(e);
                    if attempt < self.publish_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("publish to {} failed", subject)))
    }

    /// Open a durable pull consumer and return its payloads as a stream.
    ///
    /// The consumer only sees messages published after it was first created
    /// (deliver policy "new"). Each message is acknowledged as it is pulled.
    pub async fn durable_payloads(
        &self,
        stream_name: &str,
        durable_name: &str,
        filter_subject: &str,
    ) -> Result<BoxStream<'static, Bytes>> {
        info!(
            "Opening durable consumer '{}' on stream '{}' (filter: {})",
            durable_name, stream_name, filter_subject
        );

        let stream = self.jetstream.get_stream(stream_name).await?;
        let consumer = stream
            .get_or_create_consumer(durable_name, durable_config(durable_name, filter_subject))
            .await?;

        let durable = durable_name.to_string();
        let messages = consumer.messages().await?;

        let payloads = messages.filter_map(move |result| {
            let durable = durable.clone();
            async move {
                match result {
                    Ok(msg) => {
                        if let Err(e) = msg.ack().await {
                            warn!("Failed to ack message on '{}': {:?}", durable, e);
                        }
                        Some(msg.payload.clone())
                    }
                    Err(e) => {
                        warn!("Consumer '{}' error: {:?}", durable, e);
                        None
                    }
                }
            }
        });

        Ok(payloads.boxed())
    }

    /// Get the underlying core client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Get the underlying JetStream context.
    pub fn context(&self) -> &jetstream::Context {
        &self.jetstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_for_channels() {
        let config = StreamConfig::for_channels("CHAT", "chat", &["direct", "group", "global"]);
        assert_eq!(config.name, "CHAT");
        assert_eq!(
            config.subjects,
            vec!["chat.direct.>", "chat.group.>", "chat.global.>"]
        );
        assert_eq!(config.replicas, 1);
        assert_eq!(config.with_replicas(0).replicas, 1);
    }

    #[test]
    fn test_durable_config_expires_when_idle() {
        let config = durable_config("node-a-group", "chat.group.>");
        assert_eq!(config.durable_name.as_deref(), Some("node-a-group"));
        assert_eq!(config.filter_subject, "chat.group.>");
        assert_eq!(config.inactive_threshold, DEFAULT_CONSUMER_INACTIVE_THRESHOLD);
        assert!(matches!(config.deliver_policy, DeliverPolicy::New));
        assert!(matches!(config.ack_policy, AckPolicy::Explicit));
    }

    #[test]
    fn test_subject_token() {
        assert_eq!(subject_token("+919876543210"), "+919876543210");
        assert_eq!(subject_token("room.one"), "room_one");
        assert_eq!(subject_token("a b*c>"), "a_b_c_");
        assert_eq!(subject_token(""), "_");
    }
}
