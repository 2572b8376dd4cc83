//! # Sensor Stream
//!
//! Backpressure-aware streaming of sensor data to remote clients, and a
//! resilient client that consumes such streams.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: Pull-based flow control between an item producer and
//!   a serializer; nothing is delivered that was not requested
//! - **Output channels**: Chunked HTTP and WebSocket sinks that report when
//!   they cannot take more bytes and call back once they can
//! - **Serializers**: JSON, XML and delimited-text encoders driven by one
//!   state machine that pauses on a full channel
//! - **Stream consumer**: Client that decodes records incrementally and
//!   reconnects within configured bounds
//!
//! ## Example
//!
//! ```ignore
//! use sensorstream::{ChannelConfig, ChunkedHttpChannel, StreamRequest, StreamSession,
//!     SubscriptionConfig, WireFormat};
//!
//! write_chunked_response_head(&mut socket, WireFormat::Json.content_type())?;
//! let channel = ChunkedHttpChannel::new(socket, &ChannelConfig::default())?;
//!
//! let request = StreamRequest::new(WireFormat::Json, schema);
//! let session = StreamSession::start(records.into_iter(), &request, channel,
//!     &SubscriptionConfig::default())?;
//! session.wait(Duration::from_secs(60));
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod serializers;
pub mod session;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use channel::{
    write_chunked_response_head, ChannelConfig, ChunkedHttpChannel, Framing, OutputChannel,
    ReadyCallback, WebSocketChannel,
};
pub use client::{
    ClientConfig, Connector, HttpConnector, Incoming, ReconnectDecision, ReconnectPolicy,
    RecordDecoder, StopReason, StreamConnection, StreamConsumer, StreamListener, Transport,
    WebSocketConnector,
};
pub use config::StreamConfig;
pub use error::{Result, StreamError};
pub use serializers::{
    encode_all, FormatEncoder, Projection, SerializerState, StreamDescription, StreamRequest,
    StreamSerializer, WireFormat, XML_NAMESPACE,
};
pub use session::{ItemSource, StreamSession};
pub use subscriptions::{
    DropReason, IdleReaper, Subscriber, Subscription, SubscriptionConfig, SubscriptionFilter,
    SubscriptionId, SubscriptionManager,
};
pub use types::*;
