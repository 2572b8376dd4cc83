//! Readiness-driven serializer state machine.

use crate::channel::OutputChannel;
use crate::error::{Result, StreamError};
use crate::subscriptions::{ensure_live, Subscriber, Subscription};
use crate::types::DomainItem;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

use super::{write_nonempty, FormatEncoder, Projection, StreamRequest};

// Pump states.
const IDLE: u8 = 0;
const PUMPING: u8 = 1;
const AGAIN: u8 = 2;

/// Lifecycle of a [`StreamSerializer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerializerState {
    Created,
    /// Bound to a channel and request.
    Initialized,
    /// Holding a subscription, no item requested yet.
    Subscribed,
    /// One item requested.
    Streaming,
    /// Paused until the channel is ready again.
    AwaitingCapacity,
    Done,
}

/// What the pump does next.
enum Step {
    Write(Vec<u8>),
    Finish(Vec<u8>),
    Request(Arc<Subscription<DomainItem>>),
    Idle,
}

struct Inner {
    state: SerializerState,
    channel: Option<Arc<dyn OutputChannel>>,
    encoder: Option<Box<dyn FormatEncoder>>,
    projection: Option<Projection>,
    subscription: Option<Arc<Subscription<DomainItem>>>,
    /// Sequence number of the last delivered item.
    last_seq: u64,
    prologue_written: bool,
    /// Encoded items not yet written.
    held: VecDeque<Vec<u8>>,
    /// A `request(1)` is outstanding.
    in_flight: bool,
    complete_pending: bool,
    /// The client went away; late signals are expected and ignored.
    abandoned: bool,
    error: Option<String>,
}

/// Subscriber that encodes items and writes them to an output channel.
///
/// Items are pulled one at a time. After each write the serializer asks the
/// channel whether it is still ready: if so it requests the next item right
/// away, otherwise it registers a ready callback and stops pulling until the
/// callback fires. No thread ever blocks on the channel.
///
/// Writes are serialized by a small pump loop, so a ready callback firing on
/// the channel's thread and a delivery on the producer's thread never write
/// concurrently.
pub struct StreamSerializer {
    me: Weak<Self>,
    inner: Mutex<Inner>,
    done_signal: Condvar,
    pump_state: AtomicU8,
}

impl StreamSerializer {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            inner: Mutex::new(Inner {
                state: SerializerState::Created,
                channel: None,
                encoder: None,
                projection: None,
                subscription: None,
                last_seq: 0,
                prologue_written: false,
                held: VecDeque::new(),
                in_flight: false,
                complete_pending: false,
                abandoned: false,
                error: None,
            }),
            done_signal: Condvar::new(),
            pump_state: AtomicU8::new(IDLE),
        })
    }

    /// Bind to a channel and a request. The prologue is written as soon as
    /// the channel is ready.
    pub fn init(&self, channel: Arc<dyn OutputChannel>, request: &StreamRequest) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != SerializerState::Created {
                return Err(StreamError::InvalidState(format!(
                    "init in state {:?}",
                    inner.state
                )));
            }

            let projection = request.projection()?;
            let encoder = request
                .format
                .encoder(channel.framing(), &projection.schema, request.separator);

            debug!(
                format = %request.format,
                framing = ?channel.framing(),
                fields = projection.schema.len(),
                "serializer initialized"
            );
            inner.encoder = Some(encoder);
            inner.projection = Some(projection);
            inner.channel = Some(channel);
            inner.state = SerializerState::Initialized;
        }

        self.pump();
        Ok(())
    }

    pub fn state(&self) -> SerializerState {
        self.inner.lock().state
    }

    /// True once the stream ended, normally or not.
    pub fn is_done(&self) -> bool {
        self.state() == SerializerState::Done
    }

    /// The failure that ended the stream, if any.
    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    /// Items received from the subscription so far.
    pub fn items_received(&self) -> u64 {
        self.inner.lock().last_seq
    }

    /// Stop streaming: cancel the subscription and truncate the output.
    pub fn cancel(&self) {
        let channel = self.inner.lock().channel.clone();
        self.abandon("cancelled by server");
        if let Some(channel) = channel {
            channel.abort();
        }
    }

    /// Block until done or the timeout elapses. Returns whether done.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.state != SerializerState::Done {
            if self.done_signal.wait_until(&mut inner, deadline).timed_out() {
                return inner.state == SerializerState::Done;
            }
        }
        true
    }

    // --- Pump ---

    fn pump(&self) {
        loop {
            match self
                .pump_state
                .compare_exchange(IDLE, PUMPING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(PUMPING) => {
                    if self
                        .pump_state
                        .compare_exchange(PUMPING, AGAIN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                Err(_) => return,
            }
        }

        loop {
            self.pump_once();
            if self
                .pump_state
                .compare_exchange(PUMPING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            self.pump_state.store(PUMPING, Ordering::Release);
        }
    }

    fn pump_once(&self) {
        loop {
            let Some(channel) = self.live_channel() else {
                return;
            };

            if channel.is_closed() {
                self.abandon("output channel closed by client");
                return;
            }

            if !channel.is_ready() {
                self.await_capacity(&channel);
                return;
            }

            let step = match self.next_step() {
                Ok(step) => step,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };

            match step {
                Step::Write(bytes) => {
                    if let Err(e) = write_nonempty(channel.as_ref(), &bytes) {
                        self.write_failed(e);
                        return;
                    }
                }
                Step::Finish(epilogue) => {
                    let result = write_nonempty(channel.as_ref(), &epilogue).and_then(|_| channel.close());
                    match result {
                        Ok(()) => self.finish(None),
                        Err(e) => self.write_failed(e),
                    }
                    return;
                }
                Step::Request(subscription) => {
                    subscription.request(1);
                    return;
                }
                Step::Idle => return,
            }
        }
    }

    fn live_channel(&self) -> Option<Arc<dyn OutputChannel>> {
        let inner = self.inner.lock();
        if inner.state == SerializerState::Done {
            return None;
        }
        inner.channel.clone()
    }

    fn next_step(&self) -> Result<Step> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let Some(encoder) = inner.encoder.as_mut() else {
            return Ok(Step::Idle);
        };

        if !inner.prologue_written {
            let mut out = Vec::new();
            encoder.write_prologue(&mut out)?;
            inner.prologue_written = true;
            return Ok(Step::Write(out));
        }

        if let Some(bytes) = inner.held.pop_front() {
            return Ok(Step::Write(bytes));
        }

        if inner.complete_pending {
            let mut out = Vec::new();
            encoder.write_epilogue(&mut out)?;
            return Ok(Step::Finish(out));
        }

        if inner.in_flight {
            return Ok(Step::Idle);
        }
        match inner.subscription.clone() {
            Some(subscription) => {
                inner.in_flight = true;
                inner.state = SerializerState::Streaming;
                Ok(Step::Request(subscription))
            }
            None => Ok(Step::Idle),
        }
    }

    fn await_capacity(&self, channel: &Arc<dyn OutputChannel>) {
        {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                SerializerState::Subscribed | SerializerState::Streaming
            ) {
                inner.state = SerializerState::AwaitingCapacity;
            }
        }
        trace!("waiting for output capacity");

        let me = self.me.clone();
        channel.on_ready_again(Box::new(move || {
            if let Some(serializer) = me.upgrade() {
                serializer.pump();
            }
        }));
    }

    // --- Termination ---

    fn write_failed(&self, err: StreamError) {
        match err {
            StreamError::ChannelClosed | StreamError::Io(_) => {
                self.abandon(&err.to_string());
            }
            other => self.fail(other),
        }
    }

    /// The client is gone: stop pulling, not an error.
    fn abandon(&self, reason: &str) {
        let subscription = {
            let mut inner = self.inner.lock();
            if inner.state == SerializerState::Done {
                return;
            }
            inner.abandoned = true;
            inner.held.clear();
            inner.subscription.take()
        };

        debug!(reason, "client disconnected, cancelling subscription");
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        self.finish(None);
    }

    /// Internal failure: cancel upstream and truncate the stream.
    fn fail(&self, err: StreamError) {
        let (subscription, channel) = {
            let mut inner = self.inner.lock();
            if inner.state == SerializerState::Done {
                return;
            }
            (inner.subscription.take(), inner.channel.clone())
        };

        if err.is_protocol_violation() {
            error!(error = %err, "serializer failed");
        } else {
            warn!(error = %err, "serializer failed");
        }
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        if let Some(channel) = channel {
            channel.abort();
        }
        self.finish(Some(err.to_string()));
    }

    fn finish(&self, error: Option<String>) {
        let mut inner = self.inner.lock();
        if inner.state == SerializerState::Done {
            return;
        }
        inner.state = SerializerState::Done;
        inner.subscription = None;
        inner.held.clear();
        if error.is_some() {
            inner.error = error;
        }
        debug!(items = inner.last_seq, "serializer done");
        self.done_signal.notify_all();
    }
}

impl Subscriber<DomainItem> for StreamSerializer {
    fn on_subscribe(&self, subscription: Arc<Subscription<DomainItem>>) {
        let accepted = {
            let mut inner = self.inner.lock();
            if inner.state == SerializerState::Initialized {
                inner.subscription = Some(subscription.clone());
                inner.state = SerializerState::Subscribed;
                true
            } else {
                false
            }
        };

        if !accepted {
            subscription.cancel();
            self.fail(StreamError::violation("subscribed before init or twice"));
            return;
        }
        self.pump();
    }

    fn on_next(&self, seq: u64, item: DomainItem) -> Result<()> {
        let out_of_order = {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            if inner.abandoned {
                return Ok(());
            }
            ensure_live(inner.state == SerializerState::Done, "item")?;

            if seq != inner.last_seq + 1 {
                Some(format!("item {} delivered after item {}", seq, inner.last_seq))
            } else {
                inner.last_seq = seq;
                inner.in_flight = false;

                let (Some(encoder), Some(projection)) = (inner.encoder.as_mut(), inner.projection.as_ref()) else {
                    return Err(StreamError::violation("item delivered before init"));
                };
                let mut out = Vec::new();
                encoder.write_item(&projection.apply(&item), &mut out)?;
                inner.held.push_back(out);
                None
            }
        };

        // Duplicate or skipped deliveries end the stream.
        if let Some(message) = out_of_order {
            self.fail(StreamError::violation(message.clone()));
            return Err(StreamError::violation(message));
        }

        self.pump();
        Ok(())
    }

    fn on_complete(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.abandoned {
                return;
            }
            if let Err(e) = ensure_live(inner.state == SerializerState::Done, "completion") {
                error!(error = %e, "unexpected completion");
                return;
            }
            inner.complete_pending = true;
            inner.subscription = None;
        }
        self.pump();
    }

    fn on_error(&self, error: StreamError) {
        let channel = {
            let mut inner = self.inner.lock();
            if inner.state == SerializerState::Done {
                return;
            }
            inner.subscription = None;
            inner.channel.clone()
        };

        if error.is_protocol_violation() {
            error!(error = %error, "stream terminated");
        } else {
            warn!(error = %error, "stream terminated");
        }
        // Headers are committed, so the only way to signal the failure is a
        // truncated stream.
        if let Some(channel) = channel {
            channel.abort();
        }
        self.finish(Some(error.to_string()));
    }
}

impl fmt::Debug for StreamSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StreamSerializer")
            .field("state", &inner.state)
            .field("last_seq", &inner.last_seq)
            .field("held", &inner.held.len())
            .finish()
    }
}
