//! HTTP API handlers:
//! - Lots: inventory read model
//! - Reservations: hold lifecycle and finalize
//! - WebSocket: change-event stream for client replicas

pub mod error;
pub mod lots;
pub mod reservations;
pub mod websocket;

pub use error::AppError;
pub use lots::{get_lot, list_lots};
pub use reservations::{
    active_load, cancel_reservation, create_reservation, finalize, get_reservation_status,
    mark_timed_out, update_share_count,
};
pub use websocket::change_stream;
