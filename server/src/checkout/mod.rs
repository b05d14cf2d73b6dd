//! Checkout flow controller.
//!
//! One buyer's purchase flow as a state machine run by a
//! [`Store`](hisse_runtime::Store):
//!
//! ```text
//! Selection ──hold──▶ Details ──details──▶ Confirmation ──finalize──▶ Success
//!     ▲                 │   ▲                   │
//!     └──error/timeout──┘   └───────back────────┘
//! ```
//!
//! Entering `Details` starts a countdown over the hold, driven by delayed
//! `Tick` actions. Each countdown carries a generation number so ticks left
//! over from an earlier hold are ignored. When the countdown reaches zero the
//! flow reports the timeout, returns to `Selection` and reloads inventory.

mod actions;
mod environment;
mod reducer;
mod state;

pub use actions::CheckoutAction;
pub use environment::CheckoutEnvironment;
pub use reducer::CheckoutReducer;
pub use state::{CheckoutState, CheckoutStep, Countdown, Notice, PendingCall};

/// A running checkout flow
pub type CheckoutStore =
    hisse_runtime::Store<CheckoutState, CheckoutAction, CheckoutEnvironment, CheckoutReducer>;
