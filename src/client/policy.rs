//! Bounded reconnection policy.

use std::time::{Duration, Instant};

use super::{ClientConfig, StopReason};

/// What to do after a lost connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Reconnect after `delay`; `attempt` counts from 1.
    Retry { attempt: u32, delay: Duration },
    Stop(StopReason),
}

/// Reconnection state of one logical streaming session.
///
/// The attempt counter only grows during a session. The total timeout is
/// measured from the first disconnect of an outage and re-armed once a
/// connection is established again.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// None = unlimited.
    max_attempts: Option<u32>,
    delay: Duration,
    timeout: Option<Duration>,
    attempt: u32,
    deadline: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: Option<u32>, delay: Duration, timeout: Option<Duration>) -> Self {
        Self {
            max_attempts,
            delay,
            timeout,
            attempt: 0,
            deadline: None,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.max_reconnect_attempts,
            config.reconnect_delay(),
            config.reconnect_timeout(),
        )
    }

    /// Reconnect attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// A connection is up again: the outage is over.
    pub fn on_connected(&mut self) {
        self.deadline = None;
    }

    /// A connection was lost (or could not be opened) at `now`.
    pub fn on_disconnect(&mut self, now: Instant) -> ReconnectDecision {
        if self.max_attempts == Some(0) {
            return ReconnectDecision::Stop(StopReason::MaxRetriesExceeded);
        }

        if let Some(timeout) = self.timeout {
            let deadline = *self.deadline.get_or_insert(now + timeout);
            if now >= deadline {
                return ReconnectDecision::Stop(StopReason::TimeoutExceeded);
            }
        }

        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return ReconnectDecision::Stop(StopReason::MaxRetriesExceeded);
            }
        }

        self.attempt += 1;
        ReconnectDecision::Retry {
            attempt: self.attempt,
            delay: self.delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(10);

    #[test]
    fn test_zero_attempts_never_retries() {
        let mut policy = ReconnectPolicy::new(Some(0), DELAY, None);
        assert_eq!(
            policy.on_disconnect(Instant::now()),
            ReconnectDecision::Stop(StopReason::MaxRetriesExceeded)
        );
        assert_eq!(policy.attempts(), 0);
    }

    #[test]
    fn test_attempts_bounded() {
        let mut policy = ReconnectPolicy::new(Some(2), DELAY, None);
        let now = Instant::now();

        assert_eq!(
            policy.on_disconnect(now),
            ReconnectDecision::Retry { attempt: 1, delay: DELAY }
        );
        policy.on_connected();
        assert_eq!(
            policy.on_disconnect(now),
            ReconnectDecision::Retry { attempt: 2, delay: DELAY }
        );
        assert_eq!(
            policy.on_disconnect(now),
            ReconnectDecision::Stop(StopReason::MaxRetriesExceeded)
        );
        assert_eq!(policy.attempts(), 2);
    }

    #[test]
    fn test_unlimited_attempts() {
        let mut policy = ReconnectPolicy::new(None, DELAY, None);
        let now = Instant::now();
        for i in 1..=100 {
            assert_eq!(
                policy.on_disconnect(now),
                ReconnectDecision::Retry { attempt: i, delay: DELAY }
            );
        }
    }

    #[test]
    fn test_timeout_measured_from_first_disconnect() {
        let mut policy = ReconnectPolicy::new(None, DELAY, Some(Duration::from_secs(10)));
        let start = Instant::now();

        assert!(matches!(policy.on_disconnect(start), ReconnectDecision::Retry { .. }));
        assert!(matches!(
            policy.on_disconnect(start + Duration::from_secs(5)),
            ReconnectDecision::Retry { .. }
        ));
        assert_eq!(
            policy.on_disconnect(start + Duration::from_secs(11)),
            ReconnectDecision::Stop(StopReason::TimeoutExceeded)
        );
    }

    #[test]
    fn test_reconnect_rearms_timeout() {
        let mut policy = ReconnectPolicy::new(None, DELAY, Some(Duration::from_secs(10)));
        let start = Instant::now();

        policy.on_disconnect(start);
        policy.on_connected();
        assert!(matches!(
            policy.on_disconnect(start + Duration::from_secs(30)),
            ReconnectDecision::Retry { attempt: 2, .. }
        ));
    }
}
