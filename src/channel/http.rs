//! Chunked-transfer HTTP response channel.
//!
//! The underlying connection only tells us when a flush returns, so drain
//! is approximated: a per-channel timer flushes the buffered writer every
//! poll interval and then counts every byte written so far as drained. This
//! is not TCP-level backpressure; a peer that stops reading is only noticed
//! once the kernel socket buffer is full and the flush blocks or fails.

use crate::error::{Result, StreamError};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

use super::{ChannelConfig, Framing, OutputChannel, ReadyCallback, Readiness};

/// Size of the buffer between chunk framing and the connection.
const WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Chunk that terminates a chunked body.
const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Write the status line and headers of a streamed `200 OK` response.
pub fn write_chunked_response_head<W: Write>(writer: &mut W, content_type: &str) -> Result<()> {
    write!(
        writer,
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nTransfer-Encoding: chunked\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        content_type
    )?;
    writer.flush()?;
    Ok(())
}

type BoxedWriter = BufWriter<Box<dyn Write + Send>>;

/// HTTP response body written in chunked transfer encoding.
///
/// Each [`write`](OutputChannel::write) becomes one HTTP chunk. The response
/// head must already be committed (see [`write_chunked_response_head`]).
pub struct ChunkedHttpChannel {
    /// None once closed or broken.
    writer: Mutex<Option<BoxedWriter>>,
    readiness: Readiness,
    closed: AtomicBool,
    bytes_written: AtomicU64,
    /// Dropping the sender stops the poll thread.
    shutdown: Mutex<Option<Sender<()>>>,
}

impl ChunkedHttpChannel {
    /// Wrap a connection and start the readiness poll thread.
    pub fn new<W: Write + Send + 'static>(writer: W, config: &ChannelConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let boxed: Box<dyn Write + Send> = Box::new(writer);
        let channel = Arc::new(Self {
            writer: Mutex::new(Some(BufWriter::with_capacity(WRITE_BUFFER_SIZE, boxed))),
            readiness: Readiness::new(config.high_water_mark),
            closed: AtomicBool::new(false),
            bytes_written: AtomicU64::new(0),
            shutdown: Mutex::new(Some(shutdown_tx)),
        });

        let weak = Arc::downgrade(&channel);
        let interval = config.poll_interval();
        thread::Builder::new()
            .name("sensorstream-http-poll".into())
            .spawn(move || Self::poll_loop(weak, shutdown_rx, interval))?;

        Ok(channel)
    }

    /// Unacknowledged bytes since the last drain tick.
    pub fn pending_bytes(&self) -> usize {
        self.readiness.pending()
    }

    fn poll_loop(channel: Weak<Self>, shutdown: Receiver<()>, interval: Duration) {
        let ticker = tick(interval);
        loop {
            select! {
                recv(shutdown) -> _ => break,
                recv(ticker) -> _ => {
                    let Some(channel) = channel.upgrade() else { break };
                    channel.drain_tick();
                }
            }
        }
        trace!("http poll thread stopped");
    }

    /// Flush what was buffered and report the channel drained.
    fn drain_tick(&self) {
        if self.is_closed() {
            return;
        }

        let flushed = match self.writer.lock().as_mut() {
            Some(writer) => writer.flush(),
            None => return,
        };

        match flushed {
            Ok(()) => self.readiness.reset(),
            Err(e) => self.mark_broken(&e),
        }
    }

    /// The peer went away: drop the connection and wake a waiting writer so
    /// it can observe the closed channel.
    fn mark_broken(&self, err: &std::io::Error) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(error = %err, "client disconnected during streaming");
        self.writer.lock().take();
        self.shutdown.lock().take();
        self.readiness.fire();
    }

    fn write_chunk(writer: &mut BoxedWriter, bytes: &[u8]) -> std::io::Result<()> {
        write!(writer, "{:X}\r\n", bytes.len())?;
        writer.write_all(bytes)?;
        writer.write_all(b"\r\n")
    }
}

impl OutputChannel for ChunkedHttpChannel {
    fn framing(&self) -> Framing {
        Framing::Wrapped
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(StreamError::ChannelClosed);
        }
        if !self.readiness.is_ready() {
            return Err(StreamError::violation("write while channel not ready"));
        }
        // An empty chunk would end the body.
        if bytes.is_empty() {
            return Ok(());
        }

        let result = {
            let mut guard = self.writer.lock();
            let Some(writer) = guard.as_mut() else {
                return Err(StreamError::ChannelClosed);
            };
            Self::write_chunk(writer, bytes)
        };

        match result {
            Ok(()) => {
                self.readiness.record_write(bytes.len());
                self.bytes_written.fetch_add(bytes.len() as u64, Ordering::AcqRel);
                Ok(())
            }
            Err(e) => {
                self.mark_broken(&e);
                Err(StreamError::Io(e))
            }
        }
    }

    fn is_ready(&self) -> bool {
        !self.is_closed() && self.readiness.is_ready()
    }

    fn on_ready_again(&self, callback: ReadyCallback) {
        if self.is_closed() {
            callback();
            return;
        }
        self.readiness.register(callback);
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.lock().take();
        let writer = self.writer.lock().take();
        let result = match writer {
            Some(mut writer) => writer.write_all(LAST_CHUNK).and_then(|_| writer.flush()),
            None => Ok(()),
        };
        self.readiness.fire();

        debug!(bytes = self.bytes_written(), "http stream closed");
        result.map_err(StreamError::from)
    }

    fn abort(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.lock().take();
        if let Some(mut writer) = self.writer.lock().take() {
            let _ = writer.flush();
        }
        self.readiness.fire();
        debug!(bytes = self.bytes_written(), "http stream aborted");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }
}
