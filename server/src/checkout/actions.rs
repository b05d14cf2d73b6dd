//! Checkout actions: user input, timer ticks and backend results.

use hisse_core::backend::FinalizeReceipt;
use hisse_core::{HolderDetails, Lot, LotId, Reservation, ReservationError, TransactionId};

/// Everything the checkout reducer reacts to
#[derive(Clone, Debug, PartialEq)]
pub enum CheckoutAction {
    // User input
    /// Fetch inventory
    LoadInventory,
    /// Pick `share_count` shares of `lot_id` and take a hold
    SelectShares {
        /// Lot
        lot_id: LotId,
        /// Shares wanted
        share_count: u32,
    },
    /// Resize the hold while in `Details`
    ChangeShareCount {
        /// New size
        share_count: u32,
    },
    /// Submit shareholder details, moving to `Confirmation`
    SubmitDetails {
        /// One entry per held share
        holders: Vec<HolderDetails>,
    },
    /// Return from `Confirmation` to `Details`
    Back,
    /// Commit the hold
    Confirm,
    /// Give up the hold and return to `Selection`
    CancelCheckout,
    /// The page is going away
    PageUnload,

    // Timer
    /// Countdown tick
    Tick {
        /// Countdown generation that scheduled this tick
        generation: u64,
    },

    // Backend results
    /// Fresh inventory
    InventoryLoaded {
        /// All lots
        lots: Vec<Lot>,
    },
    /// Inventory could not be read
    InventoryLoadFailed {
        /// Error message
        message: String,
    },
    /// The hold was taken
    HoldCreated {
        /// The new hold
        reservation: Reservation,
    },
    /// The hold was refused
    HoldRejected {
        /// Attempt
        transaction_id: TransactionId,
        /// Reason
        error: ReservationError,
    },
    /// The hold was resized
    HoldUpdated {
        /// The resized hold
        reservation: Reservation,
    },
    /// Resizing was refused
    UpdateRejected {
        /// Attempt
        transaction_id: TransactionId,
        /// Reason
        error: ReservationError,
    },
    /// Ownership was recorded
    Finalized {
        /// Completed reservation and its records
        receipt: FinalizeReceipt,
    },
    /// Finalize was refused
    FinalizeRejected {
        /// Attempt
        transaction_id: TransactionId,
        /// Reason
        error: ReservationError,
    },
}
