//! Flow-controlled link between one producer and one subscriber.

use crate::error::{Result, StreamError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

use super::types::{Subscriber, SubscriptionId};

/// Counter for generating subscription IDs.
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Demand value meaning "no limit".
pub const UNBOUNDED: u64 = u64::MAX;

/// Items pushed but not yet delivered, in push order.
struct Queue<T> {
    items: VecDeque<(u64, T)>,
    next_seq: u64,
}

/// Mediates flow control between a producer and exactly one subscriber.
///
/// The producer calls [`push`](Self::push) / [`complete`](Self::complete)
/// from any thread; the subscriber calls [`request`](Self::request) and
/// [`cancel`](Self::cancel). Items are delivered synchronously to the
/// subscriber, never more than requested, in push order. At most one thread
/// runs the delivery loop at a time; a call that finds the loop busy leaves
/// its work to the running loop and returns.
pub struct Subscription<T> {
    id: SubscriptionId,
    requested: AtomicU64,
    /// Work-in-progress counter serializing the delivery loop.
    wip: AtomicUsize,
    queue: Mutex<Queue<T>>,
    push_complete: AtomicBool,
    done: AtomicBool,
    delivered: AtomicU64,
    /// Dropped on termination so the subscriber/subscription cycle is broken.
    subscriber: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    capacity_lock: Mutex<()>,
    capacity: Condvar,
}

impl<T: Send + 'static> Subscription<T> {
    /// Create a subscription for `subscriber` and hand it over through
    /// `on_subscribe`.
    pub fn subscribe(subscriber: Arc<dyn Subscriber<T>>) -> Arc<Self> {
        let id = SubscriptionId(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::SeqCst));
        let subscription = Arc::new(Self {
            id,
            requested: AtomicU64::new(0),
            wip: AtomicUsize::new(0),
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                next_seq: 1,
            }),
            push_complete: AtomicBool::new(false),
            done: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            subscriber: Mutex::new(Some(subscriber.clone())),
            capacity_lock: Mutex::new(()),
            capacity: Condvar::new(),
        });

        debug!(subscription = %id, "subscription created");
        subscriber.on_subscribe(subscription.clone());
        subscription
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    // --- Consumer side ---

    /// Declare that the subscriber can take `n` more items.
    ///
    /// `n == 0` is a protocol violation and terminates the subscription.
    pub fn request(&self, n: u64) {
        if n == 0 {
            self.terminate(StreamError::violation("request(0) is not allowed"));
            return;
        }

        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_add(n))
            });
        self.drain();
    }

    /// Stop delivery immediately. Queued items are discarded. Idempotent.
    pub fn cancel(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        let dropped = {
            let mut queue = self.queue.lock();
            let n = queue.items.len();
            queue.items.clear();
            n
        };
        self.subscriber.lock().take();
        self.notify_capacity();

        debug!(subscription = %self.id, dropped, "subscription cancelled");
    }

    // --- Producer side ---

    /// Offer one item; `is_last` marks the end of the stream.
    ///
    /// Returns false (and drops the item) if the subscription is already done.
    pub fn push(&self, item: T, is_last: bool) -> bool {
        if self.is_done() {
            trace!(subscription = %self.id, "push after done ignored");
            return false;
        }

        {
            let mut queue = self.queue.lock();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.items.push_back((seq, item));
        }

        if is_last {
            self.push_complete.store(true, Ordering::Release);
        }

        self.drain();
        true
    }

    /// Mark the end of the stream without a final item.
    pub fn complete(&self) {
        if self.is_done() {
            return;
        }
        self.push_complete.store(true, Ordering::Release);
        self.drain();
    }

    /// Terminate with an error raised by the item source.
    pub fn fail(&self, error: StreamError) {
        self.terminate(error);
    }

    /// Block the calling producer thread until fewer than `limit` items are
    /// queued. Returns false if the subscription finished while waiting or
    /// the timeout elapsed first.
    pub fn wait_for_capacity(&self, limit: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.capacity_lock.lock();

        loop {
            if self.is_done() {
                return false;
            }
            if self.queued() < limit {
                return true;
            }
            if self.capacity.wait_until(&mut guard, deadline).timed_out() {
                return !self.is_done() && self.queued() < limit;
            }
        }
    }

    // --- Observers ---

    /// True once completion was delivered, an error terminated the
    /// subscription, or it was cancelled. Never reverts.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn is_push_complete(&self) -> bool {
        self.push_complete.load(Ordering::Acquire)
    }

    /// Outstanding demand.
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    /// Items waiting for demand.
    pub fn queued(&self) -> usize {
        self.queue.lock().items.len()
    }

    /// Items handed to the subscriber so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    // --- Delivery ---

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1;
        loop {
            self.deliver_pending();

            let remaining = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                break;
            }
            missed = remaining;
        }
    }

    fn deliver_pending(&self) {
        loop {
            if self.is_done() || self.requested() == 0 {
                break;
            }

            let next = self.queue.lock().items.pop_front();
            let Some((seq, item)) = next else {
                break;
            };

            if self.requested() != UNBOUNDED {
                self.requested.fetch_sub(1, Ordering::AcqRel);
            }
            self.notify_capacity();

            let Some(subscriber) = self.subscriber.lock().clone() else {
                return;
            };
            self.delivered.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = subscriber.on_next(seq, item) {
                self.terminate(e);
                return;
            }
        }

        if self.is_push_complete() && self.queue.lock().items.is_empty() {
            self.finish();
        }
    }

    /// Deliver the completion signal, once.
    fn finish(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        let subscriber = self.subscriber.lock().take();
        self.notify_capacity();
        debug!(subscription = %self.id, delivered = self.delivered(), "subscription complete");

        if let Some(subscriber) = subscriber {
            subscriber.on_complete();
        }
    }

    /// Deliver an error signal, once, and drop everything queued.
    fn terminate(&self, err: StreamError) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        self.queue.lock().items.clear();
        let subscriber = self.subscriber.lock().take();
        self.notify_capacity();

        if err.is_protocol_violation() {
            error!(subscription = %self.id, error = %err, "subscription terminated");
        } else {
            debug!(subscription = %self.id, error = %err, "subscription terminated");
        }

        if let Some(subscriber) = subscriber {
            subscriber.on_error(err);
        }
    }

    fn notify_capacity(&self) {
        let _guard = self.capacity_lock.lock();
        self.capacity.notify_all();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        trace!(subscription = %self.id, "subscription dropped");
    }
}

/// Helper returning an error when a signal arrives after termination.
pub(crate) fn ensure_live(done: bool, what: &str) -> Result<()> {
    if done {
        Err(StreamError::violation(format!("{} after completion", what)))
    } else {
        Ok(())
    }
}
