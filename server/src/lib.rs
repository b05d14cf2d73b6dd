//! # Hisse Server
//!
//! Share reservation and inventory consistency for lots split into seven
//! shares, sold to many concurrent buyers.
//!
//! - [`ledger`]: the one place the unallocated-share counter changes
//! - [`reservations`]: time-boxed holds and their lifecycle
//! - [`finalizer`]: holds into ownership records
//! - [`sweeper`]: background expiry of abandoned holds
//! - [`relay`]: datastore row changes onto the change feed
//! - [`replica`]: client-side copy of lots and holds kept current by the feed
//! - [`checkout`]: the buyer's purchase flow as a reducer
//! - [`api`] and [`server`]: the HTTP and WebSocket surface

pub mod api;
pub mod checkout;
pub mod config;
pub mod finalizer;
pub mod ledger;
pub mod relay;
pub mod replica;
pub mod reservations;
pub mod server;
pub mod service;
pub mod sweeper;

pub use config::Config;
pub use service::{ReservationService, ReservationServiceBuilder};
