use super::decoder::RecordDecoder;
use super::policy::{ReconnectDecision, ReconnectPolicy};
use super::transport::{Connector, HttpConnector, Incoming, StreamConnection, WebSocketConnector};
use super::{ClientConfig, StopReason, StreamListener, Transport};
use crate::error::{Result, StreamError};
use crate::serializers::StreamDescription;
use crate::types::ResultRecord;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Serializes listener calls of a session so nothing follows `stopped`.
///
/// Reentrant: a listener may stop the consumer from inside a callback.
struct StopGate {
    delivery: ReentrantMutex<()>,
    fired: AtomicBool,
    listener: Arc<dyn StreamListener>,
}

impl StopGate {
    fn new(listener: Arc<dyn StreamListener>) -> Self {
        Self {
            delivery: ReentrantMutex::new(()),
            fired: AtomicBool::new(false),
            listener,
        }
    }

    /// Hand a record to the listener. Returns false once stopped.
    fn deliver(&self, record: ResultRecord) -> bool {
        let _guard = self.delivery.lock();
        if self.is_stopped() {
            return false;
        }
        self.listener.record_received(record);
        true
    }

    /// Returns false if the session had already stopped.
    fn stop(&self, reason: StopReason, cause: Option<&StreamError>) -> bool {
        let _guard = self.delivery.lock();
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        match cause {
            Some(e) => info!(%reason, error = %e, "stream stopped"),
            None => info!(%reason, "stream stopped"),
        }
        self.listener.stopped(reason, cause);
        true
    }

    fn is_stopped(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

struct ActiveSession {
    gate: Arc<StopGate>,
    /// Dropping the sender wakes a worker sleeping between attempts.
    _stop: Sender<()>,
}

/// Consumes a remote stream and hands decoded records to a listener,
/// reconnecting after connection losses within the configured bounds.
pub struct StreamConsumer {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    description: Mutex<Option<StreamDescription>>,
    session: Mutex<Option<ActiveSession>>,
    attempts: Arc<AtomicU32>,
}

impl StreamConsumer {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let connector: Arc<dyn Connector> = match config.transport {
            Transport::Http => Arc::new(HttpConnector::new(&config)?),
            Transport::WebSocket => Arc::new(WebSocketConnector::new(&config)?),
        };
        Ok(Self::with_connector(config, connector))
    }

    /// Use a custom transport.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            description: Mutex::new(None),
            session: Mutex::new(None),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fetch and remember the description of the stream. Required before
    /// [`start_stream`](Self::start_stream).
    pub fn retrieve_stream_description(&self) -> Result<StreamDescription> {
        let description = self.connector.fetch_description()?;
        *self.description.lock() = Some(description.clone());
        Ok(description)
    }

    pub fn stream_description(&self) -> Option<StreamDescription> {
        self.description.lock().clone()
    }

    /// Start streaming on a background thread.
    ///
    /// `listener` receives every decoded record and exactly one `stopped`
    /// call. Fails if the description was not retrieved or a session is
    /// still running.
    pub fn start_stream(&self, listener: Arc<dyn StreamListener>) -> Result<()> {
        let description = self
            .description
            .lock()
            .clone()
            .ok_or(StreamError::DescriptionMissing)?;

        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| !s.gate.is_stopped()) {
            return Err(StreamError::InvalidState("stream already started".into()));
        }

        let gate = Arc::new(StopGate::new(listener));
        let (stop_tx, stop_rx) = bounded::<()>(0);
        self.attempts.store(0, Ordering::Release);

        let worker = Worker {
            connector: self.connector.clone(),
            description,
            gate: gate.clone(),
            stop: stop_rx,
            policy: ReconnectPolicy::from_config(&self.config),
            attempts: self.attempts.clone(),
        };
        thread::Builder::new()
            .name("sensorstream-consumer".into())
            .spawn(move || worker.run())?;

        *session = Some(ActiveSession { gate, _stop: stop_tx });
        Ok(())
    }

    /// Stop the current session. The listener is told `ExplicitStop` before
    /// this returns, unless the session had already stopped; no record is
    /// delivered afterwards.
    pub fn stop_stream(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.gate.stop(StopReason::ExplicitStop, None);
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| !s.gate.is_stopped())
    }

    /// Reconnect attempts made by the current (or last) session.
    pub fn streaming_retry_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

enum SessionEnd {
    Stopped,
    Lost(StreamError),
}

struct Worker {
    connector: Arc<dyn Connector>,
    description: StreamDescription,
    gate: Arc<StopGate>,
    stop: Receiver<()>,
    policy: ReconnectPolicy,
    attempts: Arc<AtomicU32>,
}

impl Worker {
    fn run(mut self) {
        loop {
            if self.gate.is_stopped() {
                break;
            }

            let err = match self.connector.connect() {
                Ok(mut connection) => {
                    self.policy.on_connected();
                    match self.stream(connection.as_mut()) {
                        SessionEnd::Stopped => break,
                        SessionEnd::Lost(e) => e,
                    }
                }
                Err(e) => e,
            };

            if self.gate.is_stopped() {
                break;
            }
            if err.is_auth_failure() || err.is_protocol_violation() {
                self.gate.stop(StopReason::Error, Some(&err));
                break;
            }

            match self.policy.on_disconnect(Instant::now()) {
                ReconnectDecision::Stop(reason) => {
                    self.gate.stop(reason, Some(&err));
                    break;
                }
                ReconnectDecision::Retry { attempt, delay } => {
                    self.attempts.store(attempt, Ordering::Release);
                    warn!(attempt, error = %err, "stream connection lost, reconnecting");
                    if !self.sleep(delay) {
                        break;
                    }
                }
            }
        }
        debug!("consumer worker finished");
    }

    /// Read one connection until it ends. Records are only delivered while
    /// the session is running.
    fn stream(&self, connection: &mut dyn StreamConnection) -> SessionEnd {
        let mut decoder = RecordDecoder::new(&self.description, self.connector.framing());

        loop {
            if self.gate.is_stopped() {
                return SessionEnd::Stopped;
            }

            match connection.next() {
                Ok(Incoming::Data(bytes)) => match decoder.feed(&bytes) {
                    Ok(records) => {
                        for record in records {
                            if !self.gate.deliver(record) {
                                return SessionEnd::Stopped;
                            }
                        }
                    }
                    Err(e) => return SessionEnd::Lost(e),
                },
                Ok(Incoming::Idle) => {}
                Ok(Incoming::End) => {
                    return match decoder.finish() {
                        Ok(true) => {
                            self.gate.stop(StopReason::Completed, None);
                            SessionEnd::Stopped
                        }
                        Ok(false) => SessionEnd::Lost(StreamError::Decode(
                            "stream ended before its end marker".into(),
                        )),
                        Err(e) => SessionEnd::Lost(e),
                    };
                }
                Err(e) => return SessionEnd::Lost(e),
            }
        }
    }

    /// Wait before the next attempt. Returns false if the session was
    /// stopped meanwhile.
    fn sleep(&self, delay: Duration) -> bool {
        select! {
            recv(self.stop) -> _ => false,
            default(delay) => !self.gate.is_stopped(),
        }
    }
}
