//! Change feed relay: raw row changes in, typed change events out.
//!
//! The relay subscribes to the datastore's row-change notifications for the
//! `lots` and `reservations` tables, decodes each row image into its domain
//! type and publishes a [`ChangeEvent`] on the [`ChangeFeed`]. Rows that
//! cannot be decoded, and tables nobody subscribes to, are dropped and counted.
//!
//! When the underlying notification stream ends or fails the relay
//! reconnects with backoff, then republishes the current lots and active
//! reservations so subscribers recover any change missed in the gap.

use futures::StreamExt;
use hisse_core::change_feed::{ChangeEvent, ChangeFeed, FeedError};
use hisse_core::datastore::{ChangeOp, Datastore, RowChange, RowChangeStream};
use hisse_core::{DatastoreError, Lot, Reservation};
use hisse_runtime::RetryPolicy;
use hisse_runtime::metrics::FeedMetrics;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Errors raised while relaying one change
#[derive(Error, Debug)]
pub enum RelayError {
    /// The change came from a table the feed does not carry
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// The row image did not match the domain type
    #[error("Could not decode {table} row: {reason}")]
    Decode {
        /// Source table
        table: String,
        /// Decoder message
        reason: String,
    },

    /// Reading from storage failed
    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    /// Publishing failed
    #[error(transparent)]
    Feed(#[from] FeedError),
}

/// Decode a raw row change into a typed event.
///
/// # Errors
///
/// [`RelayError::UnknownTable`] or [`RelayError::Decode`].
pub fn normalize(change: RowChange) -> Result<ChangeEvent, RelayError> {
    let RowChange { table, op, row } = change;
    let decode_error = |e: serde_json::Error, table: &str| RelayError::Decode {
        table: table.to_string(),
        reason: e.to_string(),
    };

    match table.as_str() {
        "lots" => {
            let row: Lot = serde_json::from_value(row).map_err(|e| decode_error(e, &table))?;
            Ok(ChangeEvent::Lot { op, row })
        },
        "reservations" => {
            let row: Reservation =
                serde_json::from_value(row).map_err(|e| decode_error(e, &table))?;
            Ok(ChangeEvent::Reservation { op, row })
        },
        _ => Err(RelayError::UnknownTable(table.clone())),
    }
}

/// How a subscription to raw changes ended
enum StreamEnd {
    Shutdown,
    Disconnected,
}

/// Background task relaying row changes onto a [`ChangeFeed`]
pub struct ChangeRelay {
    datastore: Arc<dyn Datastore>,
    feed: Arc<dyn ChangeFeed>,
    reconnect: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl ChangeRelay {
    /// Create a relay and the sender that stops it
    #[must_use]
    pub fn new(
        datastore: Arc<dyn Datastore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (Self::with_shutdown(datastore, feed, shutdown_rx), shutdown_tx)
    }

    /// Create a relay stopped by an existing shutdown channel
    #[must_use]
    pub fn with_shutdown(
        datastore: Arc<dyn Datastore>,
        feed: Arc<dyn ChangeFeed>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            datastore,
            feed,
            reconnect: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(250))
                .max_delay(Duration::from_secs(10))
                .build(),
            shutdown,
        }
    }

    /// Backoff between reconnect attempts (`max_retries` is ignored; the relay never gives up)
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Normalize and publish one change. Returns the number of subscribers reached.
    ///
    /// # Errors
    ///
    /// Decoding or publishing failures; the change is counted as dropped.
    pub async fn relay(&self, change: RowChange) -> Result<usize, RelayError> {
        let event = normalize(change).inspect_err(|error| {
            tracing::warn!(%error, "Dropping row change");
            FeedMetrics::record_dropped();
        })?;
        self.publish(event).await
    }

    async fn publish(&self, event: ChangeEvent) -> Result<usize, RelayError> {
        let entity = event.topic().as_str();
        let delivered = self.feed.publish(event).await.inspect_err(|error| {
            tracing::error!(%error, "Publishing change event failed");
            FeedMetrics::record_dropped();
        })?;
        FeedMetrics::record_relayed(entity);
        Ok(delivered)
    }

    /// Publish the current state of every lot and active reservation.
    ///
    /// # Errors
    ///
    /// Storage or publishing failures.
    pub async fn republish_snapshot(&self) -> Result<usize, RelayError> {
        let lots = self.datastore.list_lots().await?;
        let reservations = self.datastore.list_active_reservations().await?;
        let count = lots.len() + reservations.len();

        for row in lots {
            self.publish(ChangeEvent::Lot {
                op: ChangeOp::Update,
                row,
            })
            .await?;
        }
        for row in reservations {
            self.publish(ChangeEvent::Reservation {
                op: ChangeOp::Update,
                row,
            })
            .await?;
        }
        tracing::info!(count, "Republished snapshot after reconnect");
        Ok(count)
    }

    /// Relay until the shutdown signal flips to `true`, reconnecting as needed.
    pub async fn run(mut self) {
        tracing::info!("Starting change feed relay");
        let mut attempt = 0usize;
        let mut reconnecting = false;

        while !*self.shutdown.borrow() {
            match self.datastore.row_changes().await {
                Ok(stream) => {
                    tracing::info!("Subscribed to row changes");
                    attempt = 0;
                    if reconnecting {
                        if let Err(error) = self.republish_snapshot().await {
                            tracing::error!(%error, "Snapshot republish failed");
                        }
                    }
                    if matches!(self.consume(stream).await, StreamEnd::Shutdown) {
                        break;
                    }
                    tracing::warn!("Row change stream ended, reconnecting");
                },
                Err(error) => {
                    tracing::error!(%error, attempt, "Could not subscribe to row changes");
                },
            }
            reconnecting = true;

            let delay = self.reconnect.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Change feed relay stopped");
    }

    async fn consume(&mut self, mut stream: RowChangeStream) -> StreamEnd {
        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(change)) => {
                        let table = change.table.clone();
                        match self.relay(change).await {
                            Ok(delivered) => tracing::trace!(%table, delivered, "Relayed row change"),
                            Err(error) => tracing::debug!(%table, %error, "Row change not relayed"),
                        }
                    },
                    Some(Err(error)) => {
                        tracing::warn!(%error, "Row change stream failed");
                        return StreamEnd::Disconnected;
                    },
                    None => return StreamEnd::Disconnected,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return StreamEnd::Shutdown;
                    }
                }
            }
        }
    }
}
