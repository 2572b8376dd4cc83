//! WebSocket output channel.
//!
//! Writes are queued to a dedicated writer thread which owns the socket.
//! Readiness is event driven: the pending byte count shrinks as each frame
//! leaves the socket, so the ready callback fires as soon as the backlog
//! falls under the high-water mark. Between frames the writer thread reads
//! the socket to answer pings and notice a client close.

use crate::error::{Result, StreamError};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::{Message, WebSocket};

use super::{ChannelConfig, Framing, OutputChannel, ReadyCallback, Readiness};

/// Socket read timeout while looking for inbound frames.
const INBOUND_POLL: Duration = Duration::from_millis(5);

/// How long a graceful close waits for the peer's close reply.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

enum Outbound {
    Frame(Vec<u8>),
    Close,
    Abort,
}

/// State shared with the writer thread.
struct Shared {
    readiness: Readiness,
    closed: AtomicBool,
}

impl Shared {
    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.readiness.fire();
        }
    }
}

/// Output-only WebSocket endpoint: one binary frame per write.
pub struct WebSocketChannel {
    outbound: Sender<Outbound>,
    shared: Arc<Shared>,
    bytes_written: AtomicU64,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketChannel {
    /// Take over an accepted WebSocket and start its writer thread.
    pub fn spawn(socket: WebSocket<TcpStream>, config: &ChannelConfig) -> Result<Arc<Self>> {
        config.validate()?;
        socket.get_ref().set_read_timeout(Some(INBOUND_POLL))?;

        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared {
            readiness: Readiness::new(config.high_water_mark),
            closed: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let idle_poll = config.idle_poll();
        let handle = thread::Builder::new()
            .name("sensorstream-ws-writer".into())
            .spawn(move || writer_loop(socket, rx, thread_shared, idle_poll))?;

        Ok(Arc::new(Self {
            outbound: tx,
            shared,
            bytes_written: AtomicU64::new(0),
            writer: Mutex::new(Some(handle)),
        }))
    }

    /// Wait for the writer thread to release the socket.
    pub fn join(&self) {
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }

    /// Bytes queued or in flight.
    pub fn pending_bytes(&self) -> usize {
        self.shared.readiness.pending()
    }

    fn send(&self, command: Outbound) -> Result<()> {
        self.outbound
            .send(command)
            .map_err(|_| StreamError::ChannelClosed)
    }
}

impl OutputChannel for WebSocketChannel {
    fn framing(&self) -> Framing {
        Framing::PerItem
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(StreamError::ChannelClosed);
        }
        if !self.shared.readiness.is_ready() {
            return Err(StreamError::violation("write while channel not ready"));
        }

        self.shared.readiness.record_write(bytes.len());
        self.bytes_written.fetch_add(bytes.len() as u64, Ordering::AcqRel);
        self.send(Outbound::Frame(bytes.to_vec()))
    }

    fn is_ready(&self) -> bool {
        !self.is_closed() && self.shared.readiness.is_ready()
    }

    fn on_ready_again(&self, callback: ReadyCallback) {
        if self.is_closed() {
            callback();
            return;
        }
        self.shared.readiness.register(callback);
    }

    fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.readiness.fire();
        debug!(bytes = self.bytes_written(), "websocket stream closed");
        // Frames already queued go out before the close frame.
        self.send(Outbound::Close)
    }

    fn abort(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.readiness.fire();
        debug!(bytes = self.bytes_written(), "websocket stream aborted");
        let _ = self.send(Outbound::Abort);
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }
}

fn writer_loop(
    mut socket: WebSocket<TcpStream>,
    outbound: Receiver<Outbound>,
    shared: Arc<Shared>,
    idle_poll: Duration,
) {
    loop {
        select! {
            recv(outbound) -> command => match command {
                Ok(Outbound::Frame(frame)) => {
                    let n = frame.len();
                    if let Err(e) = socket.send(Message::Binary(frame)) {
                        debug!(error = %e, "client disconnected during streaming");
                        shared.mark_closed();
                        break;
                    }
                    shared.readiness.release(n);
                }
                Ok(Outbound::Close) => {
                    close_gracefully(&mut socket, CloseCode::Normal);
                    break;
                }
                // Abort, or the channel itself was dropped.
                Ok(Outbound::Abort) | Err(_) => break,
            },
            default(idle_poll) => {
                if !poll_inbound(&mut socket, &shared) {
                    break;
                }
            }
        }
    }

    trace!("websocket writer stopped");
}

/// Read whatever the peer sent. Returns false once the socket is finished.
fn poll_inbound(socket: &mut WebSocket<TcpStream>, shared: &Shared) -> bool {
    match socket.read() {
        Ok(Message::Text(_)) | Ok(Message::Binary(_)) => {
            warn!("client sent data on an output-only stream, closing");
            shared.mark_closed();
            close_gracefully(socket, CloseCode::Unsupported);
            false
        }
        Ok(Message::Close(_)) => {
            debug!("client closed the stream");
            shared.mark_closed();
            // Flush the close reply queued by the protocol layer.
            let _ = socket.flush();
            false
        }
        Ok(_) => true,
        Err(tungstenite::Error::Io(e))
            if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
        {
            true
        }
        Err(e) => {
            debug!(error = %e, "websocket read failed");
            shared.mark_closed();
            false
        }
    }
}

fn close_gracefully(socket: &mut WebSocket<TcpStream>, code: CloseCode) {
    let frame = CloseFrame {
        code,
        reason: "".into(),
    };
    if let Err(e) = socket.close(Some(frame)) {
        trace!(error = %e, "close frame not sent");
        return;
    }

    let deadline = Instant::now() + CLOSE_TIMEOUT;
    while Instant::now() < deadline {
        match socket.read() {
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                let _ = socket.flush();
            }
            Err(_) => break,
        }
    }
}
