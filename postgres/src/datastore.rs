use chrono::{DateTime, Utc};
use futures::StreamExt;
use hisse_core::datastore::{
    AllocationOutcome, BoxFuture, CommitOutcome, Datastore, ResizeOutcome, RowChange,
    RowChangeStream,
};
use hisse_core::{
    DatastoreError, DeliveryOption, Lot, LotId, OwnershipRecord, PriceBreakdown, Reservation,
    ReservationStatus, TransactionId,
};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;

/// Channel the row-change triggers notify on
pub const NOTIFY_CHANNEL: &str = "hisse_row_changes";

const LOT_COLUMNS: &str = "id, sequence_no, total_shares, unallocated_shares, unit_price, \
     weight_kg, scheduled_at, notes, last_edited_by, updated_at";

const RESERVATION_COLUMNS: &str =
    "transaction_id, lot_id, share_count, status, created_at, expires_at";

const OWNERSHIP_COLUMNS: &str = "id, transaction_id, lot_id, holder_name, holder_phone, \
     is_purchaser, base_price, delivery_fee, total_amount, paid_amount, remaining_payment, \
     delivery, consent_to_contact, created_at";

/// `PostgreSQL`-backed [`Datastore`]
#[derive(Clone, Debug)]
pub struct PostgresDatastore {
    pool: PgPool,
}

impl PostgresDatastore {
    /// Connect with default pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Connection`] if the database is unreachable.
    pub async fn new(database_url: &str) -> Result<Self, DatastoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        Ok(Self { pool })
    }

    /// Connect with explicit pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Connection`] if the database is unreachable.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self, DatastoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Query`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), DatastoreError> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatastoreError::Query(format!("migration failed: {e}")))
    }
}

impl Datastore for PostgresDatastore {
    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(db_err)
        })
    }

    fn insert_lot(&self, lot: Lot) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO lots (id, sequence_no, total_shares, unallocated_shares, unit_price,
                                  weight_kg, scheduled_at, notes, last_edited_by, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ",
            )
            .bind(lot.id.as_uuid())
            .bind(to_i32(lot.sequence_no)?)
            .bind(to_i32(lot.total_shares)?)
            .bind(to_i32(lot.unallocated_shares)?)
            .bind(lot.unit_price)
            .bind(lot.weight_kg)
            .bind(lot.scheduled_at)
            .bind(&lot.notes)
            .bind(&lot.last_edited_by)
            .bind(lot.updated_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_lot(&self, lot_id: LotId) -> BoxFuture<'_, Option<Lot>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {LOT_COLUMNS} FROM lots WHERE id = $1"))
                .bind(lot_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            row.as_ref().map(row_to_lot).transpose()
        })
    }

    fn list_lots(&self) -> BoxFuture<'_, Vec<Lot>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!("SELECT {LOT_COLUMNS} FROM lots ORDER BY sequence_no"))
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
            rows.iter().map(row_to_lot).collect()
        })
    }

    fn conditional_allocate(&self, lot_id: LotId, delta: i64) -> BoxFuture<'_, AllocationOutcome> {
        Box::pin(async move {
            // The guard and the write are one statement, so concurrent callers
            // serialize on the row lock and each re-evaluates the guard.
            let updated = sqlx::query(&format!(
                r"
                UPDATE lots
                SET unallocated_shares = unallocated_shares + $2, updated_at = now()
                WHERE id = $1
                  AND unallocated_shares + $2 >= 0
                  AND unallocated_shares + $2 <= total_shares
                RETURNING {LOT_COLUMNS}
                "
            ))
            .bind(lot_id.as_uuid())
            .bind(delta)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some(row) = updated {
                return Ok(AllocationOutcome::Applied(row_to_lot(&row)?));
            }

            let current: Option<i32> =
                sqlx::query_scalar("SELECT unallocated_shares FROM lots WHERE id = $1")
                    .bind(lot_id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_err)?;

            match current {
                Some(unallocated) => Ok(AllocationOutcome::Rejected {
                    unallocated: to_u32(unallocated)?,
                }),
                None => Ok(AllocationOutcome::UnknownLot),
            }
        })
    }

    fn insert_reservation(&self, reservation: Reservation) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO reservations (transaction_id, lot_id, share_count, status, created_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(reservation.transaction_id.as_str())
            .bind(reservation.lot_id.as_uuid())
            .bind(to_i32(reservation.share_count)?)
            .bind(reservation.status.as_str())
            .bind(reservation.created_at)
            .bind(reservation.expires_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_reservation(
        &self,
        transaction_id: &TransactionId,
    ) -> BoxFuture<'_, Option<Reservation>> {
        let transaction_id = transaction_id.clone();
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE transaction_id = $1"
            ))
            .bind(transaction_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
            row.as_ref().map(row_to_reservation).transpose()
        })
    }

    fn list_active_reservations(&self) -> BoxFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE status = 'active' ORDER BY created_at"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            rows.iter().map(row_to_reservation).collect()
        })
    }

    fn list_stale_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = sqlx::query(&format!(
                r"
                SELECT {RESERVATION_COLUMNS} FROM reservations
                WHERE status = 'active' AND expires_at < $1
                ORDER BY expires_at
                LIMIT $2
                "
            ))
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            rows.iter().map(row_to_reservation).collect()
        })
    }

    fn active_load(&self, lot_id: LotId) -> BoxFuture<'_, u32> {
        Box::pin(async move {
            let load: i64 = sqlx::query_scalar(
                r"
                SELECT COALESCE(SUM(share_count), 0)::BIGINT FROM reservations
                WHERE lot_id = $1 AND status = 'active'
                ",
            )
            .bind(lot_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
            u32::try_from(load).map_err(|e| DatastoreError::Serialization(e.to_string()))
        })
    }

    fn end_reservation(
        &self,
        transaction_id: &TransactionId,
        to: ReservationStatus,
    ) -> BoxFuture<'_, Option<Reservation>> {
        let transaction_id = transaction_id.clone();
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_err)?;

            let row = sqlx::query(&format!(
                r"
                UPDATE reservations SET status = $2
                WHERE transaction_id = $1 AND status = 'active'
                RETURNING {RESERVATION_COLUMNS}
                "
            ))
            .bind(transaction_id.as_str())
            .bind(to.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            let Some(row) = row else {
                tx.rollback().await.map_err(db_err)?;
                return Ok(None);
            };
            let ended = row_to_reservation(&row)?;

            let released = sqlx::query(
                r"
                UPDATE lots
                SET unallocated_shares = unallocated_shares + $2, updated_at = now()
                WHERE id = $1 AND unallocated_shares + $2 <= total_shares
                ",
            )
            .bind(ended.lot_id.as_uuid())
            .bind(i64::from(ended.share_count))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if released.rows_affected() == 0 {
                tracing::error!(
                    transaction_id = %ended.transaction_id,
                    lot_id = %ended.lot_id,
                    shares = ended.share_count,
                    "Release would exceed lot total; counter left unchanged"
                );
            }

            tx.commit().await.map_err(db_err)?;
            Ok(Some(ended))
        })
    }

    fn resize_reservation(
        &self,
        transaction_id: &TransactionId,
        new_count: u32,
    ) -> BoxFuture<'_, ResizeOutcome> {
        let transaction_id = transaction_id.clone();
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_err)?;

            let row = sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE transaction_id = $1 FOR UPDATE"
            ))
            .bind(transaction_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
            let current = match row.as_ref().map(row_to_reservation).transpose()? {
                Some(r) if r.is_active() => r,
                other => {
                    tx.rollback().await.map_err(db_err)?;
                    return Ok(ResizeOutcome::NotActive(other));
                },
            };

            // Shrinking gives shares back, growing takes them
            let delta = i64::from(current.share_count) - i64::from(new_count);
            let moved: Option<i32> = sqlx::query_scalar(
                r"
                UPDATE lots
                SET unallocated_shares = unallocated_shares + $2, updated_at = now()
                WHERE id = $1
                  AND unallocated_shares + $2 >= 0
                  AND unallocated_shares + $2 <= total_shares
                RETURNING unallocated_shares
                ",
            )
            .bind(current.lot_id.as_uuid())
            .bind(delta)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            if moved.is_none() {
                let unallocated: Option<i32> =
                    sqlx::query_scalar("SELECT unallocated_shares FROM lots WHERE id = $1")
                        .bind(current.lot_id.as_uuid())
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(db_err)?;
                let unallocated = unallocated.map(to_u32).transpose()?.unwrap_or(0);
                if delta < 0 {
                    tx.rollback().await.map_err(db_err)?;
                    return Ok(ResizeOutcome::Rejected { unallocated });
                }
                tracing::error!(
                    transaction_id = %current.transaction_id,
                    released = delta,
                    unallocated,
                    "Release would exceed lot total; counter left unchanged"
                );
            }

            let resized = sqlx::query(&format!(
                r"
                UPDATE reservations SET share_count = $2
                WHERE transaction_id = $1
                RETURNING {RESERVATION_COLUMNS}
                "
            ))
            .bind(transaction_id.as_str())
            .bind(to_i32(new_count)?)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            let resized = row_to_reservation(&resized)?;

            tx.commit().await.map_err(db_err)?;
            Ok(ResizeOutcome::Resized(resized))
        })
    }

    fn commit_ownership(
        &self,
        transaction_id: &TransactionId,
        records: Vec<OwnershipRecord>,
    ) -> BoxFuture<'_, CommitOutcome> {
        let transaction_id = transaction_id.clone();
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(db_err)?;

            let row = sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE transaction_id = $1 FOR UPDATE"
            ))
            .bind(transaction_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
            let reservation = row.as_ref().map(row_to_reservation).transpose()?;

            let reservation = match reservation {
                Some(r) if r.is_active() => r,
                other => {
                    tx.rollback().await.map_err(db_err)?;
                    return Ok(CommitOutcome::NotActive(other));
                },
            };

            // Lock the lot so concurrent finalizes on it count ownership one at a time.
            let total: i32 =
                sqlx::query_scalar("SELECT total_shares FROM lots WHERE id = $1 FOR UPDATE")
                    .bind(reservation.lot_id.as_uuid())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_err)?;
            let owned: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ownership WHERE lot_id = $1")
                .bind(reservation.lot_id.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;

            let total = to_u32(total)?;
            let owned = u32::try_from(owned).map_err(|e| DatastoreError::Serialization(e.to_string()))?;
            let requested = u32::try_from(records.len()).unwrap_or(u32::MAX);
            if owned.saturating_add(requested) > total {
                tx.rollback().await.map_err(db_err)?;
                return Ok(CommitOutcome::AtCapacity { owned, total });
            }

            for record in &records {
                sqlx::query(&format!(
                    r"
                    INSERT INTO ownership ({OWNERSHIP_COLUMNS})
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    "
                ))
                .bind(record.id)
                .bind(record.transaction_id.as_str())
                .bind(record.lot_id.as_uuid())
                .bind(&record.holder_name)
                .bind(&record.holder_phone)
                .bind(record.is_purchaser)
                .bind(record.price.base_price)
                .bind(record.price.delivery_fee)
                .bind(record.price.total_amount)
                .bind(record.price.paid_amount)
                .bind(record.price.remaining_payment)
                .bind(record.delivery.as_str())
                .bind(record.consent_to_contact)
                .bind(record.created_at)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }

            let completed = sqlx::query(&format!(
                r"
                UPDATE reservations SET status = 'completed'
                WHERE transaction_id = $1
                RETURNING {RESERVATION_COLUMNS}
                "
            ))
            .bind(transaction_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            let completed = row_to_reservation(&completed)?;

            tx.commit().await.map_err(db_err)?;
            Ok(CommitOutcome::Committed(completed))
        })
    }

    fn list_ownership(&self, lot_id: LotId) -> BoxFuture<'_, Vec<OwnershipRecord>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {OWNERSHIP_COLUMNS} FROM ownership WHERE lot_id = $1 ORDER BY created_at"
            ))
            .bind(lot_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            rows.iter().map(row_to_ownership).collect()
        })
    }

    fn row_changes(&self) -> BoxFuture<'_, RowChangeStream> {
        Box::pin(async move {
            let mut listener = PgListener::connect_with(&self.pool).await.map_err(db_err)?;
            listener.listen(NOTIFY_CHANNEL).await.map_err(db_err)?;
            tracing::info!(channel = NOTIFY_CHANNEL, "Listening for row changes");

            let stream = async_stream::stream! {
                loop {
                    match listener.try_recv().await {
                        Ok(Some(notification)) => {
                            yield serde_json::from_str::<RowChange>(notification.payload())
                                .map_err(|e| DatastoreError::Serialization(e.to_string()));
                        },
                        Ok(None) => {
                            // Notifications sent while disconnected are lost.
                            yield Err(DatastoreError::SubscriptionClosed(
                                "listener connection lost".to_string(),
                            ));
                            break;
                        },
                        Err(e) => {
                            yield Err(db_err(e));
                            break;
                        },
                    }
                }
            };

            Ok(stream.boxed())
        })
    }
}

/// Map a sqlx error onto the datastore taxonomy
fn db_err(error: sqlx::Error) -> DatastoreError {
    match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DatastoreError::Connection(error.to_string()),
        sqlx::Error::Database(db)
            if db.is_unique_violation() || db.is_foreign_key_violation() =>
        {
            DatastoreError::Conflict(db.message().to_string())
        },
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_) => DatastoreError::Serialization(error.to_string()),
        _ => DatastoreError::Query(error.to_string()),
    }
}

fn to_i32(value: u32) -> Result<i32, DatastoreError> {
    i32::try_from(value).map_err(|e| DatastoreError::Serialization(e.to_string()))
}

fn to_u32(value: i32) -> Result<u32, DatastoreError> {
    u32::try_from(value).map_err(|e| DatastoreError::Serialization(e.to_string()))
}

fn row_to_lot(row: &PgRow) -> Result<Lot, DatastoreError> {
    Ok(Lot {
        id: LotId::from_uuid(row.try_get("id").map_err(db_err)?),
        sequence_no: to_u32(row.try_get("sequence_no").map_err(db_err)?)?,
        total_shares: to_u32(row.try_get("total_shares").map_err(db_err)?)?,
        unallocated_shares: to_u32(row.try_get("unallocated_shares").map_err(db_err)?)?,
        unit_price: row.try_get("unit_price").map_err(db_err)?,
        weight_kg: row.try_get("weight_kg").map_err(db_err)?,
        scheduled_at: row.try_get("scheduled_at").map_err(db_err)?,
        notes: row.try_get("notes").map_err(db_err)?,
        last_edited_by: row.try_get("last_edited_by").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn row_to_reservation(row: &PgRow) -> Result<Reservation, DatastoreError> {
    let transaction_id: String = row.try_get("transaction_id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;

    Ok(Reservation {
        transaction_id: TransactionId::parse(&transaction_id)
            .map_err(|e| DatastoreError::Serialization(e.to_string()))?,
        lot_id: LotId::from_uuid(row.try_get("lot_id").map_err(db_err)?),
        share_count: to_u32(row.try_get("share_count").map_err(db_err)?)?,
        status: ReservationStatus::parse(&status)
            .ok_or_else(|| DatastoreError::Serialization(format!("unknown status '{status}'")))?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
    })
}

fn row_to_ownership(row: &PgRow) -> Result<OwnershipRecord, DatastoreError> {
    let transaction_id: String = row.try_get("transaction_id").map_err(db_err)?;
    let delivery: String = row.try_get("delivery").map_err(db_err)?;

    Ok(OwnershipRecord {
        id: row.try_get("id").map_err(db_err)?,
        transaction_id: TransactionId::parse(&transaction_id)
            .map_err(|e| DatastoreError::Serialization(e.to_string()))?,
        lot_id: LotId::from_uuid(row.try_get("lot_id").map_err(db_err)?),
        holder_name: row.try_get("holder_name").map_err(db_err)?,
        holder_phone: row.try_get("holder_phone").map_err(db_err)?,
        is_purchaser: row.try_get("is_purchaser").map_err(db_err)?,
        price: PriceBreakdown {
            base_price: row.try_get("base_price").map_err(db_err)?,
            delivery_fee: row.try_get("delivery_fee").map_err(db_err)?,
            total_amount: row.try_get("total_amount").map_err(db_err)?,
            paid_amount: row.try_get("paid_amount").map_err(db_err)?,
            remaining_payment: row.try_get("remaining_payment").map_err(db_err)?,
        },
        delivery: DeliveryOption::parse(&delivery)
            .ok_or_else(|| DatastoreError::Serialization(format!("unknown delivery '{delivery}'")))?,
        consent_to_contact: row.try_get("consent_to_contact").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}
