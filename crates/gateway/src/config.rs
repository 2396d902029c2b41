//! Environment configuration.

use crate::error::{GatewayError, Result};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Gateway settings read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub instance_id: String,
    pub http_port: u16,
    pub metrics_port: u16,
    pub nats_url: String,
    pub redis_url: String,
    pub stream_name: String,
    pub stream_replicas: usize,
    pub membership_cache_ttl: Duration,
    pub session_buffer: usize,
    pub heartbeat_interval: Duration,
    pub advertise_host: String,
}

impl GatewayConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&env::vars().collect())
    }

    /// Build from an explicit variable map. Missing variables take defaults.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let instance_id = get("INSTANCE_ID")
            .map(str::to_string)
            .unwrap_or_else(|| format!("gateway-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
        let advertise_host = get("ADVERTISE_HOST")
            .or_else(|| get("HOSTNAME"))
            .unwrap_or("localhost")
            .to_string();

        Ok(Self {
            instance_id,
            http_port: parse(vars, "HTTP_PORT", 8080)?,
            metrics_port: parse(vars, "METRICS_PORT", 9090)?,
            nats_url: get("NATS_URL").unwrap_or("nats://localhost:4222").to_string(),
            redis_url: get("REDIS_URL").unwrap_or("redis://localhost:6379").to_string(),
            stream_name: get("CHAT_STREAM").unwrap_or("CHAT").to_string(),
            stream_replicas: parse::<usize>(vars, "STREAM_REPLICAS", 1)?.max(1),
            membership_cache_ttl: Duration::from_secs(parse(vars, "MEMBERSHIP_CACHE_TTL_SECS", 3600)?),
            session_buffer: parse::<usize>(vars, "SESSION_BUFFER", 1000)?.max(1),
            heartbeat_interval: Duration::from_secs(parse::<u64>(vars, "HEARTBEAT_INTERVAL_SECS", 30)?.max(1)),
            advertise_host,
        })
    }
}

fn parse<T: FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T> {
    match vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| GatewayError::Config(format!("{} must be a number, got '{}'", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_vars(&HashMap::new()).unwrap();
        assert!(config.instance_id.starts_with("gateway-"));
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.stream_name, "CHAT");
        assert_eq!(config.stream_replicas, 1);
        assert_eq!(config.membership_cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.session_buffer, 1000);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.advertise_host, "localhost");
    }

    #[test]
    fn test_overrides() {
        let config = GatewayConfig::from_vars(&vars(&[
            ("INSTANCE_ID", "node-a"),
            ("HTTP_PORT", "9000"),
            ("STREAM_REPLICAS", "3"),
            ("HOSTNAME", "pod-1"),
            ("MEMBERSHIP_CACHE_TTL_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.instance_id, "node-a");
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.stream_replicas, 3);
        assert_eq!(config.advertise_host, "pod-1");
        assert_eq!(config.membership_cache_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_bad_number_is_config_error() {
        let err = GatewayConfig::from_vars(&vars(&[("HTTP_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
