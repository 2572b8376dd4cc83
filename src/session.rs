//! Server-side wiring of a streaming response.
//!
//! A session connects an item source to an output channel:
//!
//! ```text
//! ItemSource --(producer thread)--> Subscription --> StreamSerializer --> OutputChannel
//! ```
//!
//! Historical sources are drained by a producer thread that is throttled by
//! the subscription queue; live sessions are fed by a [`SubscriptionManager`].

use crate::channel::OutputChannel;
use crate::error::Result;
use crate::serializers::{StreamRequest, StreamSerializer};
use crate::subscriptions::{
    Subscription, SubscriptionConfig, SubscriptionFilter, SubscriptionId, SubscriptionManager,
};
use crate::types::DomainItem;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// How often a throttled producer rechecks whether the stream was cancelled.
const CAPACITY_POLL: Duration = Duration::from_millis(100);

/// Produces the items of one stream, in order.
pub trait ItemSource: Send {
    /// Next item, or None when the source is exhausted.
    fn next_item(&mut self) -> Result<Option<DomainItem>>;
}

impl<I> ItemSource for I
where
    I: Iterator<Item = DomainItem> + Send,
{
    fn next_item(&mut self) -> Result<Option<DomainItem>> {
        Ok(self.next())
    }
}

/// One streaming response in progress.
pub struct StreamSession {
    serializer: Arc<StreamSerializer>,
    subscription: Arc<Subscription<DomainItem>>,
    producer: Mutex<Option<JoinHandle<()>>>,
    live: Option<(Arc<SubscriptionManager>, SubscriptionId)>,
}

impl StreamSession {
    /// Stream a bounded source to `channel`.
    ///
    /// The source is read on a dedicated producer thread. The thread waits
    /// whenever `config.max_buffered` items are queued, so a slow client
    /// never causes unbounded buffering.
    pub fn start<S>(
        source: S,
        request: &StreamRequest,
        channel: Arc<dyn OutputChannel>,
        config: &SubscriptionConfig,
    ) -> Result<Self>
    where
        S: ItemSource + 'static,
    {
        config.validate()?;
        let serializer = StreamSerializer::new();
        serializer.init(channel, request)?;
        let subscription = Subscription::subscribe(serializer.clone());

        let producer = {
            let subscription = subscription.clone();
            let filter = request.filter.clone();
            let max_buffered = config.max_buffered;
            thread::Builder::new()
                .name(format!("sensorstream-producer-{}", subscription.id()))
                .spawn(move || produce(source, filter, subscription, max_buffered))?
        };

        Ok(Self {
            serializer,
            subscription,
            producer: Mutex::new(Some(producer)),
            live: None,
        })
    }

    /// Stream the live feed of `manager` to `channel` until the feed ends,
    /// the live-data timeout expires or the client goes away.
    pub fn attach_live(
        manager: &Arc<SubscriptionManager>,
        request: &StreamRequest,
        channel: Arc<dyn OutputChannel>,
    ) -> Result<Self> {
        let serializer = StreamSerializer::new();
        serializer.init(channel, request)?;
        let subscription = Subscription::subscribe(serializer.clone());
        let id = manager.subscribe(request.filter.clone(), subscription.clone());

        Ok(Self {
            serializer,
            subscription,
            producer: Mutex::new(None),
            live: Some((manager.clone(), id)),
        })
    }

    pub fn serializer(&self) -> &Arc<StreamSerializer> {
        &self.serializer
    }

    pub fn subscription(&self) -> &Arc<Subscription<DomainItem>> {
        &self.subscription
    }

    pub fn is_done(&self) -> bool {
        self.serializer.is_done()
    }

    /// Block until the stream ended or the timeout elapsed. Returns whether
    /// the stream ended.
    pub fn wait(&self, timeout: Duration) -> bool {
        if !self.serializer.wait(timeout) {
            return false;
        }
        if let Some(producer) = self.producer.lock().take() {
            let _ = producer.join();
        }
        true
    }

    /// Stop the stream early. The client sees a truncated stream.
    pub fn cancel(&self) {
        if let Some((manager, id)) = &self.live {
            manager.unsubscribe(*id);
        }
        self.serializer.cancel();
    }
}

fn next_matching<S: ItemSource>(source: &mut S, filter: &SubscriptionFilter) -> Result<Option<DomainItem>> {
    while let Some(item) = source.next_item()? {
        if filter.matches(&item) {
            return Ok(Some(item));
        }
    }
    Ok(None)
}

/// Producer loop: one item of lookahead so the final push carries `is_last`.
fn produce<S: ItemSource>(
    mut source: S,
    filter: SubscriptionFilter,
    subscription: Arc<Subscription<DomainItem>>,
    max_buffered: usize,
) {
    let mut next = next_matching(&mut source, &filter);

    loop {
        let item = match next {
            Ok(Some(item)) => item,
            Ok(None) => {
                subscription.complete();
                break;
            }
            Err(e) => {
                subscription.fail(e);
                break;
            }
        };

        let lookahead = next_matching(&mut source, &filter);
        let is_last = matches!(lookahead, Ok(None));

        while !subscription.wait_for_capacity(max_buffered, CAPACITY_POLL) {
            if subscription.is_done() {
                debug!(subscription = %subscription.id(), "stream ended, producer stopping");
                return;
            }
        }

        if !subscription.push(item, is_last) {
            debug!(subscription = %subscription.id(), "stream ended, producer stopping");
            return;
        }
        if is_last {
            break;
        }
        next = lookahead;
    }

    trace!(subscription = %subscription.id(), "producer finished");
}
