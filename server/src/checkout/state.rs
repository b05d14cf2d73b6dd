//! Per-tab checkout state.

use hisse_core::backend::FinalizeReceipt;
use hisse_core::{HolderDetails, Lot, LotId, Reservation, ReservationStatus, TransactionId};
use serde::{Deserialize, Serialize};

/// Where the buyer is in the purchase flow
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStep {
    /// Browsing lots and picking a share count
    #[default]
    Selection,
    /// Holding shares, entering shareholder details
    Details,
    /// Reviewing before committing
    Confirmation,
    /// Ownership recorded
    Success,
}

/// Message shown to the buyer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// Not enough shares left for the request
    SharesUnavailable {
        /// Lot
        lot_id: LotId,
        /// Shares asked for
        requested: u32,
        /// Shares left when the request was refused
        available: u32,
    },
    /// The hold ended before the buyer finished
    HoldLost {
        /// Status the hold ended in
        status: ReservationStatus,
    },
    /// The countdown reached zero
    HoldExpired,
    /// Few seconds left on the hold
    CountdownWarning {
        /// Threshold that was crossed
        seconds_left: u64,
    },
    /// Concurrent holds oversubscribed the lot; fewer shares are needed
    LotAtCapacity {
        /// Lot
        lot_id: LotId,
    },
    /// The entered details were refused
    InvalidDetails(String),
    /// Anything else went wrong
    Failed(String),
}

/// Countdown over the current hold
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Countdown {
    /// Ticks carrying a different generation are stale
    pub generation: u64,
    /// Seconds left, as of the last tick
    pub seconds_remaining: u64,
    /// Thresholds already announced
    pub warnings_fired: Vec<u64>,
}

/// Backend call awaiting its result
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingCall {
    /// `create_reservation`
    Create,
    /// `update_share_count`
    Update,
    /// `finalize`
    Finalize,
}

/// State of one checkout flow
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CheckoutState {
    /// Current step
    pub step: CheckoutStep,
    /// Inventory as last loaded
    pub lots: Vec<Lot>,
    /// Token of the current purchase attempt
    pub transaction_id: Option<TransactionId>,
    /// The hold, while one is live
    pub hold: Option<Reservation>,
    /// Shareholders entered in `Details`
    pub holders: Vec<HolderDetails>,
    /// Running countdown
    pub countdown: Option<Countdown>,
    /// Call in flight; user input is ignored meanwhile
    pub pending: Option<PendingCall>,
    /// Latest message for the buyer
    pub notice: Option<Notice>,
    /// Outcome of a successful finalize
    pub receipt: Option<FinalizeReceipt>,
    /// Source of countdown generations
    pub(crate) generation: u64,
}

impl CheckoutState {
    /// Fresh state at `Selection`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `transaction_id` names the current attempt
    #[must_use]
    pub fn is_current(&self, transaction_id: &TransactionId) -> bool {
        self.transaction_id.as_ref() == Some(transaction_id)
    }

    /// Seconds left on the hold, if a countdown is running
    #[must_use]
    pub fn seconds_remaining(&self) -> Option<u64> {
        self.countdown.as_ref().map(|c| c.seconds_remaining)
    }

    /// Drop the current attempt and go back to `Selection`
    pub(crate) fn reset_to_selection(&mut self) {
        self.step = CheckoutStep::Selection;
        self.transaction_id = None;
        self.hold = None;
        self.holders.clear();
        self.countdown = None;
        self.pending = None;
    }

    /// Start a countdown for the current hold and return its generation
    pub(crate) fn start_countdown(&mut self, seconds_remaining: u64) -> u64 {
        self.generation += 1;
        self.countdown = Some(Countdown {
            generation: self.generation,
            seconds_remaining,
            warnings_fired: Vec::new(),
        });
        self.generation
    }
}
