//! `PostgreSQL` datastore for Hisse.
//!
//! Implements the [`Datastore`](hisse_core::datastore::Datastore) trait with sqlx:
//!
//! - The ledger's conditional allocate is a single guarded `UPDATE ... RETURNING`
//! - Reservation transitions are compare-and-set on `status = 'active'`
//! - Finalize runs in one transaction with the lot row locked
//! - Row changes arrive through `LISTEN hisse_row_changes`, fed by triggers
//!
//! # Example
//!
//! ```ignore
//! use hisse_postgres::PostgresDatastore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let datastore = PostgresDatastore::new("postgres://localhost/hisse").await?;
//!     datastore.migrate().await?;
//!     Ok(())
//! }
//! ```

mod datastore;

pub use datastore::{NOTIFY_CHANNEL, PostgresDatastore};
