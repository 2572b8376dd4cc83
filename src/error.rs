//! Error types for the streaming pipeline.

use thiserror::Error;

/// Main error type for streaming operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A bug in the pipeline itself: delivery after completion, a duplicate
    /// item, a write on a channel that is not ready.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Output channel is closed")]
    ChannelClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Server returned {0} response code")]
    HttpStatus(u16),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Stream description not retrieved")]
    DescriptionMissing,

    #[error("Item source failed: {0}")]
    Source(String),
}

impl StreamError {
    /// Errors that indicate a bug in the pipeline. These are never retried.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, StreamError::ProtocolViolation(_))
    }

    /// Authentication/authorization failures stop a client session at once.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, StreamError::HttpStatus(401) | StreamError::HttpStatus(403))
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        StreamError::ProtocolViolation(msg.into())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            StreamError::Serialization(e.to_string())
        } else {
            StreamError::Deserialization(e.to_string())
        }
    }
}

impl From<quick_xml::Error> for StreamError {
    fn from(e: quick_xml::Error) -> Self {
        StreamError::Xml(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for StreamError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        StreamError::Xml(e.to_string())
    }
}

impl From<tungstenite::Error> for StreamError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Io(io) => StreamError::Io(io),
            tungstenite::Error::Http(response) => StreamError::HttpStatus(response.status().as_u16()),
            other => StreamError::WebSocket(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => StreamError::HttpStatus(status.as_u16()),
            None => StreamError::Http(e.to_string()),
        }
    }
}

/// Result type for streaming operations.
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_classification() {
        assert!(StreamError::HttpStatus(401).is_auth_failure());
        assert!(StreamError::HttpStatus(403).is_auth_failure());
        assert!(!StreamError::HttpStatus(503).is_auth_failure());
        assert!(!StreamError::ChannelClosed.is_auth_failure());
    }

    #[test]
    fn test_protocol_violation_classification() {
        assert!(StreamError::violation("twice").is_protocol_violation());
        assert!(!StreamError::Decode("bad".into()).is_protocol_violation());
    }

    #[test]
    fn test_json_syntax_error_maps_to_deserialization() {
        let err: StreamError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, StreamError::Deserialization(_)));
    }
}
