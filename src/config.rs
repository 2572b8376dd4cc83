//! Combined configuration of a streaming deployment.

use crate::channel::ChannelConfig;
use crate::client::ClientConfig;
use crate::error::{Result, StreamError};
use crate::subscriptions::SubscriptionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Server and client settings, loadable from one JSON document.
///
/// Every section and field is optional; missing values take their defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub channel: ChannelConfig,
    pub subscription: SubscriptionConfig,
    pub client: ClientConfig,
}

impl StreamConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: StreamConfig = serde_json::from_str(json)
            .map_err(|e| StreamError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.channel.validate()?;
        self.subscription.validate()?;
        self.client.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Transport;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = StreamConfig::from_json_str("{}").unwrap();
        assert_eq!(config, StreamConfig::default());
        assert_eq!(config.channel.high_water_mark, 16 * 1024);
        assert_eq!(config.subscription.max_buffered, 1000);
    }

    #[test]
    fn test_partial_sections() {
        let config = StreamConfig::from_json_str(
            r#"{
                "channel": { "high_water_mark": 64 },
                "client": { "transport": "websocket", "reconnect_timeout_ms": 5000 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.channel.high_water_mark, 64);
        assert_eq!(config.channel.poll_interval_ms, 200);
        assert_eq!(config.client.transport, Transport::WebSocket);
        assert_eq!(config.client.reconnect_timeout_ms, Some(5000));
    }

    #[test]
    fn test_zero_high_water_mark_rejected() {
        let err = StreamConfig::from_json_str(r#"{"channel":{"high_water_mark":0}}"#).unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfig(_)));
    }

    #[test]
    fn test_malformed_document_rejected() {
        assert!(matches!(
            StreamConfig::from_json_str("{\"channel\": 3}"),
            Err(StreamError::InvalidConfig(_))
        ));
    }
}
