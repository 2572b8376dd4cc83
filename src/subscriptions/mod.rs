//! Flow-controlled subscriptions between item producers and serializers.
//!
//! This module provides:
//! - [`Subscription`]: the backpressure mediator between one producer and
//!   one [`Subscriber`]
//! - [`SubscriptionFilter`]: per-request kind/procedure/time restrictions
//! - [`SubscriptionManager`]: broadcasting of a live feed to many
//!   subscriptions, with slow-subscriber dropping and live-data timeout
//!
//! # Example
//!
//! ```ignore
//! let subscription = Subscription::subscribe(serializer);
//!
//! // Producer thread
//! for (i, item) in items.iter().enumerate() {
//!     subscription.push(item.clone(), i == items.len() - 1);
//! }
//!
//! // Subscriber, whenever it has room for more
//! subscription.request(1);
//! ```

mod manager;
mod subscription;
mod types;

pub use manager::{DropReason, IdleReaper, SubscriptionManager};
pub(crate) use subscription::ensure_live;
pub use subscription::{Subscription, UNBOUNDED};
pub use types::{Subscriber, SubscriptionConfig, SubscriptionFilter, SubscriptionId};
