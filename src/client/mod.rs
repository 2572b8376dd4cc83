//! Resilient stream consumer.
//!
//! The client side of the pipeline: a [`StreamConsumer`] fetches the
//! [`StreamDescription`](crate::serializers::StreamDescription) of a stream,
//! opens it over chunked HTTP or WebSocket, decodes records incrementally and
//! hands them to a [`StreamListener`]. Lost connections are re-established
//! under a [`ReconnectPolicy`] bounded by attempt count and total time.

mod consumer;
mod decoder;
mod policy;
mod transport;

pub use consumer::StreamConsumer;
pub use decoder::RecordDecoder;
pub use policy::{ReconnectDecision, ReconnectPolicy};
pub use transport::{Connector, HttpConnector, Incoming, StreamConnection, WebSocketConnector};

use crate::error::{Result, StreamError};
use crate::types::ResultRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a streaming session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopReason {
    /// The server ended the stream normally.
    Completed,
    /// The connection was lost and no reconnect attempt is left.
    MaxRetriesExceeded,
    /// The connection was lost and the reconnect timeout elapsed.
    TimeoutExceeded,
    /// `stop_stream` was called.
    ExplicitStop,
    /// A failure that is not worth retrying (authentication, bad stream).
    Error,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Completed => "completed",
            StopReason::MaxRetriesExceeded => "max retries exceeded",
            StopReason::TimeoutExceeded => "timeout exceeded",
            StopReason::ExplicitStop => "explicit stop",
            StopReason::Error => "error",
        };
        f.write_str(s)
    }
}

/// Receives the output of a streaming session.
pub trait StreamListener: Send + Sync {
    /// One fully decoded record.
    fn record_received(&self, record: ResultRecord);

    /// The session ended. Called exactly once per session; nothing follows.
    fn stopped(&self, reason: StopReason, cause: Option<&StreamError>);
}

/// Stream transport used by the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Long-lived GET with a chunked response body.
    #[default]
    Http,
    /// One item per binary frame.
    WebSocket,
}

/// Configuration for the stream consumer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub transport: Transport,

    /// Endpoint streaming the records (`http://` or `ws://`).
    pub stream_url: String,

    /// Endpoint serving the stream description as JSON.
    pub description_url: String,

    /// Bound on opening a connection, up to the response head or the
    /// completed WebSocket handshake.
    /// Default: 60s
    pub connect_timeout_ms: u64,

    /// Reconnect attempts after a lost connection (None = unlimited,
    /// 0 = never reconnect).
    pub max_reconnect_attempts: Option<u32>,

    /// Delay before each reconnect attempt.
    /// Default: 1s
    pub reconnect_delay_ms: u64,

    /// Give up reconnecting once an outage lasts this long (None = never).
    pub reconnect_timeout_ms: Option<u64>,

    /// How long a read may block before the session checks for a stop.
    /// Default: 250ms
    pub read_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Http,
            stream_url: String::new(),
            description_url: String::new(),
            connect_timeout_ms: 60_000,
            max_reconnect_attempts: None,
            reconnect_delay_ms: 1000,
            reconnect_timeout_ms: None,
            read_timeout_ms: 250,
        }
    }
}

impl ClientConfig {
    pub fn new(transport: Transport, stream_url: impl Into<String>, description_url: impl Into<String>) -> Self {
        Self {
            transport,
            stream_url: stream_url.into(),
            description_url: description_url.into(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reconnect_timeout(&self) -> Option<Duration> {
        self.reconnect_timeout_ms.map(Duration::from_millis)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "client timeouts must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Check that the endpoints needed to stream are set.
    pub(crate) fn validate_endpoints(&self) -> Result<()> {
        if self.stream_url.is_empty() {
            return Err(StreamError::InvalidConfig("client.stream_url is not set".into()));
        }
        if self.description_url.is_empty() {
            return Err(StreamError::InvalidConfig(
                "client.description_url is not set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_json() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"transport":"websocket","stream_url":"ws://localhost/s","max_reconnect_attempts":0}"#,
        )
        .unwrap();

        assert_eq!(config.transport, Transport::WebSocket);
        assert_eq!(config.max_reconnect_attempts, Some(0));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.connect_timeout(), Duration::from_secs(60));
        assert!(config.reconnect_timeout().is_none());
    }

    #[test]
    fn test_endpoints_required() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.validate_endpoints().is_err());
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::MaxRetriesExceeded.to_string(), "max retries exceeded");
    }
}
