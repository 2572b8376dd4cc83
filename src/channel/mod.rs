//! Non-blocking output channels with write-readiness signalling.
//!
//! A channel decouples "the serializer produced bytes" from "the transport
//! can take them". Writers check [`OutputChannel::is_ready`] after each
//! write; once the channel reports not-ready they stop pulling items and
//! register [`OutputChannel::on_ready_again`] to resume later. No thread is
//! ever parked waiting on the network.
//!
//! Two transports are provided:
//! - [`ChunkedHttpChannel`]: an HTTP response body in chunked transfer
//!   encoding, with readiness sampled on a timer
//! - [`WebSocketChannel`]: one binary frame per write, with readiness driven
//!   by the writer thread as frames leave the socket

mod http;
mod readiness;
mod websocket;

pub use http::{write_chunked_response_head, ChunkedHttpChannel};
pub use websocket::WebSocketChannel;

pub(crate) use readiness::Readiness;

use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One-shot callback fired when a channel can take writes again.
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

/// How item boundaries are expressed on a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One continuous body: items are wrapped in a prologue/epilogue pair
    /// and separated by the format's own delimiters.
    Wrapped,
    /// Each write is one transport frame holding exactly one item.
    PerItem,
}

/// Byte sink with a ready/not-ready state.
pub trait OutputChannel: Send + Sync {
    /// Item framing imposed by the transport.
    fn framing(&self) -> Framing;

    /// Append bytes. Only valid while [`is_ready`](Self::is_ready) is true;
    /// a write on a channel that is not ready is a protocol violation.
    fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Current readiness. Flips to false once the unacknowledged bytes reach
    /// the high-water mark.
    fn is_ready(&self) -> bool;

    /// Register a callback fired once when the channel becomes ready again
    /// (or is closed underneath the writer). Fires immediately if the
    /// channel already became ready. A new registration replaces an
    /// unfired one.
    fn on_ready_again(&self, callback: ReadyCallback);

    /// Flush and release the transport, ending the stream normally. Idempotent.
    fn close(&self) -> Result<()>;

    /// Release the transport without the normal end-of-stream marker so the
    /// peer sees a truncated stream.
    fn abort(&self) {
        let _ = self.close();
    }

    fn is_closed(&self) -> bool;

    /// Payload bytes accepted so far.
    fn bytes_written(&self) -> u64;
}

/// Configuration for output channels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Unacknowledged bytes before a channel reports not-ready.
    /// Default: 16KB
    pub high_water_mark: usize,

    /// Readiness poll period of the chunked HTTP channel.
    /// Default: 200ms
    pub poll_interval_ms: u64,

    /// How often an idle WebSocket writer looks for inbound frames.
    /// Default: 50ms
    pub idle_poll_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 16 * 1024,
            poll_interval_ms: 200,
            idle_poll_ms: 50,
        }
    }
}

impl ChannelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.high_water_mark == 0 {
            return Err(StreamError::InvalidConfig(
                "channel.high_water_mark must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 || self.idle_poll_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "channel poll intervals must be positive".into(),
            ));
        }
        Ok(())
    }
}
