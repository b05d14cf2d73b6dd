//! Checkout flow reducer.
//!
//! Transitions are guarded by the current step and by the call in flight:
//! input that does not fit the step is ignored, as are backend results that
//! belong to an earlier attempt. Every failure the buyer cannot fix in place
//! returns the flow to `Selection` with a fresh inventory read.

use super::actions::CheckoutAction;
use super::environment::CheckoutEnvironment;
use super::state::{CheckoutState, CheckoutStep, Notice, PendingCall};
use crate::finalizer::assign_purchaser;
use crate::reservations::validate_share_count;
use hisse_core::effect::Effect;
use hisse_core::reducer::Reducer;
use hisse_core::{HolderDetails, ReservationError, SmallVec, TransactionId, smallvec};

/// Reducer for the checkout flow
#[derive(Clone, Copy, Debug, Default)]
pub struct CheckoutReducer;

type Effects = SmallVec<[Effect<CheckoutAction>; 4]>;

impl Reducer for CheckoutReducer {
    type State = CheckoutState;
    type Action = CheckoutAction;
    type Environment = CheckoutEnvironment;

    #[allow(clippy::too_many_lines)] // One arm per action
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            // ========== Inventory ==========
            CheckoutAction::LoadInventory => smallvec![refresh_inventory(env)],

            CheckoutAction::InventoryLoaded { lots } => {
                state.lots = lots;
                SmallVec::new()
            },

            CheckoutAction::InventoryLoadFailed { message } => {
                tracing::warn!(%message, "Inventory load failed");
                state.notice = Some(Notice::Failed(message));
                SmallVec::new()
            },

            // ========== Selection ==========
            CheckoutAction::SelectShares {
                lot_id,
                share_count,
            } => {
                if state.step != CheckoutStep::Selection || state.pending.is_some() {
                    return SmallVec::new();
                }
                if let Err(error) = validate_share_count(share_count) {
                    state.notice = Some(Notice::InvalidDetails(error.to_string()));
                    return SmallVec::new();
                }

                let transaction_id = TransactionId::generate();
                state.transaction_id = Some(transaction_id.clone());
                state.pending = Some(PendingCall::Create);
                state.notice = None;
                state.receipt = None;

                let backend = env.backend.clone();
                smallvec![Effect::future(async move {
                    Some(
                        match backend
                            .create_reservation(transaction_id.clone(), lot_id, share_count)
                            .await
                        {
                            Ok(reservation) => CheckoutAction::HoldCreated { reservation },
                            Err(error) => CheckoutAction::HoldRejected {
                                transaction_id,
                                error,
                            },
                        },
                    )
                })]
            },

            CheckoutAction::HoldCreated { reservation } => {
                if !state.is_current(&reservation.transaction_id)
                    || state.pending != Some(PendingCall::Create)
                {
                    tracing::debug!(
                        transaction_id = %reservation.transaction_id,
                        "Hold arrived for an abandoned attempt, releasing"
                    );
                    return smallvec![cancel_quietly(env, reservation.transaction_id)];
                }

                state.pending = None;
                state.step = CheckoutStep::Details;
                let remaining = reservation.seconds_remaining(env.clock.now());
                state.hold = Some(reservation);
                let generation = state.start_countdown(remaining);
                smallvec![schedule_tick(env, generation)]
            },

            CheckoutAction::HoldRejected {
                transaction_id,
                error,
            } => {
                if !state.is_current(&transaction_id) {
                    return SmallVec::new();
                }
                state.notice = Some(notice_for(&error));
                leave_checkout(state, env, false)
            },

            // ========== Details ==========
            CheckoutAction::ChangeShareCount { share_count } => {
                if state.step != CheckoutStep::Details || state.pending.is_some() {
                    return SmallVec::new();
                }
                let Some(hold) = state.hold.as_ref() else {
                    return SmallVec::new();
                };
                if hold.share_count == share_count {
                    return SmallVec::new();
                }
                if let Err(error) = validate_share_count(share_count) {
                    state.notice = Some(Notice::InvalidDetails(error.to_string()));
                    return SmallVec::new();
                }

                let transaction_id = hold.transaction_id.clone();
                state.pending = Some(PendingCall::Update);
                state.notice = None;

                let backend = env.backend.clone();
                smallvec![Effect::future(async move {
                    Some(
                        match backend
                            .update_share_count(transaction_id.clone(), share_count)
                            .await
                        {
                            Ok(reservation) => CheckoutAction::HoldUpdated { reservation },
                            Err(error) => CheckoutAction::UpdateRejected {
                                transaction_id,
                                error,
                            },
                        },
                    )
                })]
            },

            CheckoutAction::HoldUpdated { reservation } => {
                if !state.is_current(&reservation.transaction_id)
                    || state.pending != Some(PendingCall::Update)
                {
                    return SmallVec::new();
                }
                state.pending = None;
                state.hold = Some(reservation);
                SmallVec::new()
            },

            CheckoutAction::UpdateRejected {
                transaction_id,
                error,
            } => {
                if !state.is_current(&transaction_id)
                    || state.pending != Some(PendingCall::Update)
                {
                    return SmallVec::new();
                }
                state.pending = None;
                state.notice = Some(notice_for(&error));
                match error {
                    // The hold is unchanged; stay and show the fresh count
                    ReservationError::InsufficientInventory { .. } => {
                        smallvec![refresh_inventory(env)]
                    },
                    ReservationError::InvalidInput(_) => SmallVec::new(),
                    other => leave_checkout(state, env, hold_may_be_live(&other)),
                }
            },

            CheckoutAction::SubmitDetails { mut holders } => {
                if state.step != CheckoutStep::Details || state.pending.is_some() {
                    return SmallVec::new();
                }
                let Some(hold) = state.hold.as_ref() else {
                    return SmallVec::new();
                };
                if let Err(error) = validate_holders(hold.share_count, &mut holders) {
                    state.notice = Some(Notice::InvalidDetails(error.to_string()));
                    return SmallVec::new();
                }
                state.holders = holders;
                state.notice = None;
                state.step = CheckoutStep::Confirmation;
                SmallVec::new()
            },

            // ========== Confirmation ==========
            CheckoutAction::Back => {
                if state.step == CheckoutStep::Confirmation && state.pending.is_none() {
                    state.step = CheckoutStep::Details;
                }
                SmallVec::new()
            },

            CheckoutAction::Confirm => {
                if state.step != CheckoutStep::Confirmation || state.pending.is_some() {
                    return SmallVec::new();
                }
                let Some(transaction_id) = state.transaction_id.clone() else {
                    return SmallVec::new();
                };
                state.pending = Some(PendingCall::Finalize);
                state.notice = None;

                let backend = env.backend.clone();
                let holders = state.holders.clone();
                smallvec![Effect::future(async move {
                    Some(
                        match backend.finalize(transaction_id.clone(), holders).await {
                            Ok(receipt) => CheckoutAction::Finalized { receipt },
                            Err(error) => CheckoutAction::FinalizeRejected {
                                transaction_id,
                                error,
                            },
                        },
                    )
                })]
            },

            CheckoutAction::Finalized { receipt } => {
                if !state.is_current(&receipt.reservation.transaction_id)
                    || state.pending != Some(PendingCall::Finalize)
                {
                    return SmallVec::new();
                }
                state.pending = None;
                state.step = CheckoutStep::Success;
                state.hold = None;
                state.countdown = None;
                state.receipt = Some(receipt);
                smallvec![refresh_inventory(env)]
            },

            CheckoutAction::FinalizeRejected {
                transaction_id,
                error,
            } => {
                if !state.is_current(&transaction_id)
                    || state.pending != Some(PendingCall::Finalize)
                {
                    return SmallVec::new();
                }
                state.pending = None;
                state.notice = Some(notice_for(&error));
                match error {
                    // Still holding; the buyer has to ask for fewer shares
                    ReservationError::LotAtCapacity { .. } => {
                        state.step = CheckoutStep::Details;
                        smallvec![refresh_inventory(env)]
                    },
                    ReservationError::InvalidInput(_) => {
                        state.step = CheckoutStep::Details;
                        SmallVec::new()
                    },
                    other => leave_checkout(state, env, hold_may_be_live(&other)),
                }
            },

            // ========== Leaving ==========
            CheckoutAction::CancelCheckout => {
                if !matches!(state.step, CheckoutStep::Details | CheckoutStep::Confirmation)
                    || state.pending.is_some()
                {
                    return SmallVec::new();
                }
                state.notice = None;
                leave_checkout(state, env, true)
            },

            CheckoutAction::PageUnload => {
                let holding = matches!(state.step, CheckoutStep::Details | CheckoutStep::Confirmation)
                    || state.pending == Some(PendingCall::Create);
                let transaction_id = state.transaction_id.take();
                state.reset_to_selection();
                match transaction_id {
                    Some(transaction_id) if holding => {
                        smallvec![cancel_quietly(env, transaction_id)]
                    },
                    _ => SmallVec::new(),
                }
            },

            // ========== Countdown ==========
            CheckoutAction::Tick { generation } => {
                let now = env.clock.now();
                let remaining = state
                    .hold
                    .as_ref()
                    .map_or(0, |hold| hold.seconds_remaining(now));
                let Some(countdown) = state.countdown.as_mut() else {
                    return SmallVec::new();
                };
                if countdown.generation != generation {
                    return SmallVec::new();
                }
                countdown.seconds_remaining = remaining;

                if remaining == 0 {
                    // The server decides a racing finalize; keep ticking in
                    // case it is refused and the hold has to be timed out
                    if state.pending == Some(PendingCall::Finalize) {
                        return smallvec![schedule_tick(env, generation)];
                    }
                    tracing::info!("Checkout countdown reached zero");
                    let transaction_id = state.transaction_id.take();
                    state.notice = Some(Notice::HoldExpired);
                    state.reset_to_selection();

                    let mut effects: Vec<Effect<CheckoutAction>> = Vec::with_capacity(2);
                    if let Some(transaction_id) = transaction_id {
                        effects.push(time_out_quietly(env, transaction_id));
                    }
                    effects.push(refresh_inventory(env));
                    return smallvec![Effect::chain(effects)];
                }

                let mut crossed = None;
                for &threshold in &env.warnings {
                    if remaining <= threshold && !countdown.warnings_fired.contains(&threshold) {
                        countdown.warnings_fired.push(threshold);
                        crossed = Some(threshold);
                    }
                }
                if let Some(seconds_left) = crossed {
                    state.notice = Some(Notice::CountdownWarning { seconds_left });
                }
                smallvec![schedule_tick(env, generation)]
            },
        }
    }
}

/// Holder count must match the hold, contact fields must be filled in and
/// exactly one holder ends up as purchaser.
fn validate_holders(
    share_count: u32,
    holders: &mut [HolderDetails],
) -> Result<(), ReservationError> {
    if u32::try_from(holders.len()).ok() != Some(share_count) {
        return Err(ReservationError::InvalidInput(format!(
            "expected {share_count} shareholders, got {}",
            holders.len()
        )));
    }
    if holders
        .iter()
        .any(|h| h.name.trim().is_empty() || h.phone.trim().is_empty())
    {
        return Err(ReservationError::InvalidInput(
            "every shareholder needs a name and a phone number".to_string(),
        ));
    }
    assign_purchaser(holders)
}

fn notice_for(error: &ReservationError) -> Notice {
    match error {
        ReservationError::InsufficientInventory {
            lot_id,
            requested,
            available,
        } => Notice::SharesUnavailable {
            lot_id: *lot_id,
            requested: *requested,
            available: *available,
        },
        ReservationError::ReservationNotActive { status, .. } => Notice::HoldLost { status: *status },
        ReservationError::LotAtCapacity { lot_id, .. } => Notice::LotAtCapacity { lot_id: *lot_id },
        ReservationError::InvalidInput(message) => Notice::InvalidDetails(message.clone()),
        other => Notice::Failed(other.to_string()),
    }
}

/// Storage failures leave the server-side hold in an unknown state
const fn hold_may_be_live(error: &ReservationError) -> bool {
    matches!(error, ReservationError::Datastore(_))
}

/// Back to `Selection` with a fresh inventory read, releasing the hold first
/// when `release` is set.
fn leave_checkout(state: &mut CheckoutState, env: &CheckoutEnvironment, release: bool) -> Effects {
    let transaction_id = state.transaction_id.take();
    state.reset_to_selection();

    match transaction_id {
        Some(transaction_id) if release => smallvec![Effect::chain(vec![
            cancel_quietly(env, transaction_id),
            refresh_inventory(env),
        ])],
        _ => smallvec![refresh_inventory(env)],
    }
}

fn schedule_tick(env: &CheckoutEnvironment, generation: u64) -> Effect<CheckoutAction> {
    Effect::Delay {
        duration: env.tick,
        action: Box::new(CheckoutAction::Tick { generation }),
    }
}

/// Best-effort cancel; the sweeper reclaims the hold if this never lands
fn cancel_quietly(env: &CheckoutEnvironment, transaction_id: TransactionId) -> Effect<CheckoutAction> {
    let backend = env.backend.clone();
    Effect::future(async move {
        if let Err(error) = backend.cancel_reservation(transaction_id.clone()).await {
            tracing::debug!(%transaction_id, %error, "Cancel failed, leaving it to the sweeper");
        }
        None
    })
}

fn time_out_quietly(env: &CheckoutEnvironment, transaction_id: TransactionId) -> Effect<CheckoutAction> {
    let backend = env.backend.clone();
    Effect::future(async move {
        if let Err(error) = backend.mark_timed_out(transaction_id.clone()).await {
            tracing::debug!(%transaction_id, %error, "Timeout report failed, leaving it to the sweeper");
        }
        None
    })
}

fn refresh_inventory(env: &CheckoutEnvironment) -> Effect<CheckoutAction> {
    let backend = env.backend.clone();
    let replica = env.replica.clone();
    Effect::future(async move {
        let loaded = match replica {
            Some(replica) => replica.resync().await.map(|()| replica.lots()),
            None => backend.list_lots().await,
        };
        Some(match loaded {
            Ok(lots) => CheckoutAction::InventoryLoaded { lots },
            Err(error) => CheckoutAction::InventoryLoadFailed {
                message: error.to_string(),
            },
        })
    })
}
