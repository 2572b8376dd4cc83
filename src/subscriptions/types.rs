//! Subscription types shared by producers and consumers.

use crate::error::{Result, StreamError};
use crate::types::{DomainItem, ItemKind, TimeRange};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::subscription::Subscription;

/// Configuration for subscriptions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Max items waiting in a subscription queue. A historical producer
    /// waits when the queue is this full; a live subscriber this far behind
    /// is dropped.
    /// Default: 1000
    pub max_buffered: usize,

    /// Complete live subscriptions that received nothing for this long
    /// (None = keep them open until the feed ends).
    pub live_timeout_ms: Option<u64>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_buffered: 1000,
            live_timeout_ms: None,
        }
    }
}

impl SubscriptionConfig {
    pub fn live_timeout(&self) -> Option<Duration> {
        self.live_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_buffered == 0 {
            return Err(StreamError::InvalidConfig(
                "subscription.max_buffered must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Filter criteria restricting which items reach a subscription.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionFilter {
    /// Item kinds to include (None = all kinds).
    pub kinds: Option<Vec<ItemKind>>,

    /// Procedure UIDs to include (None = all). Items that do not name a
    /// procedure always pass.
    pub procedures: Option<Vec<String>>,

    /// Time window on the item timestamp (None = unbounded).
    pub time_range: Option<TimeRange>,
}

impl SubscriptionFilter {
    /// Everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the given item kinds.
    pub fn kinds(kinds: Vec<ItemKind>) -> Self {
        Self {
            kinds: Some(kinds),
            ..Default::default()
        }
    }

    /// Only items from the given procedures.
    pub fn procedures(procedures: Vec<String>) -> Self {
        Self {
            procedures: Some(procedures),
            ..Default::default()
        }
    }

    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    /// Check if an item passes the filter.
    pub fn matches(&self, item: &DomainItem) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&item.kind()) {
                return false;
            }
        }

        if let (Some(procedures), Some(procedure)) = (&self.procedures, item.procedure()) {
            if !procedures.iter().any(|p| p == procedure) {
                return false;
            }
        }

        if let Some(range) = self.time_range {
            if !range.contains(item.timestamp()) {
                return false;
            }
        }

        true
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consumer side of a [`Subscription`].
///
/// Signals arrive synchronously from the subscription's delivery loop, one
/// at a time, in push order. At most one of `on_complete` / `on_error` is
/// ever called, and nothing follows it.
pub trait Subscriber<T>: Send + Sync {
    /// Called once when the subscription is created. The subscriber keeps
    /// the handle to issue `request` and `cancel`.
    fn on_subscribe(&self, subscription: Arc<Subscription<T>>);

    /// One item, stamped with its delivery sequence number (1, 2, 3, ...).
    /// An error terminates the subscription and is echoed to `on_error`.
    fn on_next(&self, seq: u64, item: T) -> Result<()>;

    /// The producer is finished and every item was delivered.
    fn on_complete(&self);

    /// The subscription failed.
    fn on_error(&self, error: StreamError);
}
