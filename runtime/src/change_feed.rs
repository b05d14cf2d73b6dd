//! In-process change feed backed by a `tokio::sync::broadcast` channel.
//!
//! One channel carries every [`ChangeEvent`]; each subscriber filters by topic
//! on its side. A subscriber that falls more than `capacity` events behind gets
//! a single [`FeedError::Lagged`] and keeps receiving from the oldest retained
//! event, so it can resync and carry on.

use futures::StreamExt;
use hisse_core::change_feed::{ChangeEvent, ChangeFeed, ChangeStream, FeedError, Topic};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Default number of events retained for slow subscribers
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Broadcast-backed [`ChangeFeed`]
#[derive(Clone, Debug)]
pub struct BroadcastChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl BroadcastChangeFeed {
    /// Create a feed retaining up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Current subscriber count
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn stream_for(&self, topics: &[Topic]) -> ChangeStream {
        let wanted: Vec<Topic> = topics.to_vec();
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| {
            let keep = match item {
                Ok(event) if wanted.is_empty() || wanted.contains(&event.topic()) => Some(Ok(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Change feed subscriber lagged");
                    Some(Err(FeedError::Lagged(skipped)))
                },
            };
            futures::future::ready(keep)
        });
        Box::pin(stream)
    }
}

impl Default for BroadcastChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl ChangeFeed for BroadcastChangeFeed {
    fn publish(
        &self,
        event: ChangeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<usize, FeedError>> + Send + '_>> {
        Box::pin(async move {
            // No subscribers is not an error; the event is simply not observed.
            Ok(self.sender.send(event).unwrap_or(0))
        })
    }

    fn subscribe(
        &self,
        topics: &[Topic],
    ) -> Pin<Box<dyn Future<Output = Result<ChangeStream, FeedError>> + Send + '_>> {
        let stream = self.stream_for(topics);
        Box::pin(async move { Ok(stream) })
    }
}
