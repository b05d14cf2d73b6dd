//! Normalized change feed consumed by client replicas.
//!
//! Storage emits raw [`RowChange`](crate::datastore::RowChange)s. The relay
//! turns them into typed [`ChangeEvent`]s and publishes them on a
//! [`ChangeFeed`], which fans them out to subscribers by [`Topic`].
//!
//! Delivery is at-least-once. Consumers apply events by overwriting the keyed
//! entity, so duplicates are harmless.

use crate::datastore::ChangeOp;
use crate::types::{Lot, LotId, Reservation, TransactionId};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Entity topic a subscriber can ask for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Lot rows
    Lot,
    /// Reservation rows
    Reservation,
}

impl Topic {
    /// Wire name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Lot => "lot",
            Self::Reservation => "reservation",
        }
    }

    /// Parse a wire name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "lot" | "lots" => Some(Self::Lot),
            "reservation" | "reservations" => Some(Self::Reservation),
            _ => None,
        }
    }
}

/// A typed entity change
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A lot row changed
    Lot {
        /// Mutation kind
        op: ChangeOp,
        /// Row image
        row: Lot,
    },
    /// A reservation row changed
    Reservation {
        /// Mutation kind
        op: ChangeOp,
        /// Row image
        row: Reservation,
    },
}

impl ChangeEvent {
    /// Topic this event belongs to
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::Lot { .. } => Topic::Lot,
            Self::Reservation { .. } => Topic::Reservation,
        }
    }

    /// Mutation kind
    #[must_use]
    pub const fn op(&self) -> ChangeOp {
        match self {
            Self::Lot { op, .. } | Self::Reservation { op, .. } => *op,
        }
    }

    /// Lot touched by this event
    #[must_use]
    pub const fn lot_id(&self) -> LotId {
        match self {
            Self::Lot { row, .. } => row.id,
            Self::Reservation { row, .. } => row.lot_id,
        }
    }

    /// Transaction touched by this event, for reservation changes
    #[must_use]
    pub const fn transaction_id(&self) -> Option<&TransactionId> {
        match self {
            Self::Lot { .. } => None,
            Self::Reservation { row, .. } => Some(&row.transaction_id),
        }
    }
}

/// Errors from the change feed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The subscriber fell behind and `n` events were dropped; it must resync
    #[error("Subscriber lagged, {0} events dropped")]
    Lagged(u64),

    /// The feed was shut down
    #[error("Feed closed")]
    Closed,

    /// Publish failed
    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

/// Stream of change events for one subscriber
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent, FeedError>> + Send>>;

/// Fan-out of normalized change events.
pub trait ChangeFeed: Send + Sync {
    /// Publish an event to all subscribers of its topic.
    ///
    /// Returns the number of subscribers that received it.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::PublishFailed`] if the feed cannot accept events.
    fn publish(
        &self,
        event: ChangeEvent,
    ) -> Pin<Box<dyn Future<Output = Result<usize, FeedError>> + Send + '_>>;

    /// Subscribe to the given topics. An empty slice subscribes to all.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be created.
    fn subscribe(
        &self,
        topics: &[Topic],
    ) -> Pin<Box<dyn Future<Output = Result<ChangeStream, FeedError>> + Send + '_>>;
}
