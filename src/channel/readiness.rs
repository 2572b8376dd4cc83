//! Readiness bookkeeping shared by the channel implementations.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::trace;

use super::ReadyCallback;

/// Byte counter, ready flag and the one-shot ready callback.
///
/// The counter is owned by the channel: writers add to it, the transport's
/// drain signal resets or decrements it.
pub(crate) struct Readiness {
    ready: AtomicBool,
    pending: AtomicUsize,
    high_water_mark: usize,
    callback: Mutex<Option<ReadyCallback>>,
}

impl Readiness {
    pub(crate) fn new(high_water_mark: usize) -> Self {
        Self {
            ready: AtomicBool::new(true),
            pending: AtomicUsize::new(0),
            high_water_mark,
            callback: Mutex::new(None),
        }
    }

    pub(crate) fn record_write(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Current readiness; flips to not-ready at the high-water mark.
    pub(crate) fn is_ready(&self) -> bool {
        if self.pending() >= self.high_water_mark
            && self
                .ready
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            trace!(pending = self.pending(), "channel not ready");
        }
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn register(&self, callback: ReadyCallback) {
        *self.callback.lock() = Some(callback);

        // The transport may have drained between the caller's readiness
        // check and this registration.
        if self.ready.load(Ordering::Acquire) {
            self.fire();
        }
    }

    /// Timer-driven drain: everything written so far counts as flushed.
    pub(crate) fn reset(&self) {
        self.pending.store(0, Ordering::Release);
        self.mark_ready();
    }

    /// Event-driven drain of `n` bytes.
    pub(crate) fn release(&self, n: usize) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(n)));
        if self.pending() < self.high_water_mark {
            self.mark_ready();
        }
    }

    /// Run the pending callback, if any. Never holds the lock while calling.
    pub(crate) fn fire(&self) {
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn mark_ready(&self) {
        if self
            .ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!("channel ready again");
            self.fire();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> ReadyCallback {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_flips_at_high_water_mark() {
        let r = Readiness::new(64);
        r.record_write(63);
        assert!(r.is_ready());
        r.record_write(1);
        assert!(!r.is_ready());
        assert!(!r.is_ready());
    }

    #[test]
    fn test_reset_fires_callback_once() {
        let r = Readiness::new(10);
        let fired = Arc::new(AtomicUsize::new(0));

        r.record_write(10);
        assert!(!r.is_ready());
        r.register(counting_callback(&fired));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        r.reset();
        r.reset();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(r.is_ready());
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_register_after_drain_fires_immediately() {
        let r = Readiness::new(10);
        let fired = Arc::new(AtomicUsize::new(0));

        r.record_write(20);
        assert!(!r.is_ready());
        r.reset();
        r.register(counting_callback(&fired));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_below_mark() {
        let r = Readiness::new(10);
        let fired = Arc::new(AtomicUsize::new(0));

        r.record_write(15);
        assert!(!r.is_ready());
        r.register(counting_callback(&fired));

        r.release(5);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        r.release(1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(r.pending(), 9);
    }
}
