//! Domain types for the share reservation system.
//!
//! This module contains the identifiers, entities and value objects shared by the
//! ledger, the reservation store, the finalizer and the client-side replica.

use crate::error::ReservationError;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Number of shares every lot is subdivided into.
pub const SHARES_PER_LOT: u32 = 7;

/// Exact length of a transaction token.
pub const TRANSACTION_ID_LEN: usize = 16;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a lot
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LotId(Uuid);

impl LotId {
    /// Creates a new random `LotId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `LotId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, client-generated transaction token.
///
/// Correlates every call belonging to one checkout attempt and doubles as the
/// idempotency key for reservation mutations. Always exactly
/// [`TRANSACTION_ID_LEN`] ASCII alphanumeric characters.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransactionId(String);

impl TransactionId {
    /// Validate and wrap a raw token.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::InvalidInput`] if the token has the wrong
    /// length or contains anything other than ASCII letters and digits.
    pub fn parse(raw: &str) -> Result<Self, ReservationError> {
        if raw.len() != TRANSACTION_ID_LEN {
            return Err(ReservationError::InvalidInput(format!(
                "transaction id must be {TRANSACTION_ID_LEN} characters, got {}",
                raw.len()
            )));
        }
        if !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ReservationError::InvalidInput(
                "transaction id must be alphanumeric".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    /// Generate a fresh random token (what a client does when a checkout starts)
    #[must_use]
    pub fn generate() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TRANSACTION_ID_LEN)
            .map(char::from)
            .collect();
        Self(token)
    }

    /// Borrow the token
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TransactionId {
    type Error = ReservationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TransactionId> for String {
    fn from(value: TransactionId) -> Self {
        value.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Lot
// ============================================================================

/// A sellable unit subdivided into [`SHARES_PER_LOT`] shares.
///
/// `unallocated_shares` is the ledger counter. It only changes through the
/// datastore's conditional allocate primitive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    /// Lot identifier
    pub id: LotId,
    /// Human-facing sequence number ("lot 12")
    pub sequence_no: u32,
    /// Total shares (always [`SHARES_PER_LOT`] for lots created here)
    pub total_shares: u32,
    /// Shares neither held by an active reservation nor owned
    pub unallocated_shares: u32,
    /// Price of one share
    pub unit_price: i64,
    /// Estimated weight
    #[serde(default)]
    pub weight_kg: Option<f64>,
    /// Scheduled processing slot
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Free-text notes
    #[serde(default)]
    pub notes: Option<String>,
    /// Last operator to edit the lot
    #[serde(default)]
    pub last_edited_by: Option<String>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl Lot {
    /// Create a fully unallocated lot
    #[must_use]
    pub fn new(sequence_no: u32, unit_price: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: LotId::new(),
            sequence_no,
            total_shares: SHARES_PER_LOT,
            unallocated_shares: SHARES_PER_LOT,
            unit_price,
            weight_kg: None,
            scheduled_at: None,
            notes: None,
            last_edited_by: None,
            updated_at: now,
        }
    }

    /// Set the estimated weight
    #[must_use]
    pub const fn with_weight(mut self, weight_kg: f64) -> Self {
        self.weight_kg = Some(weight_kg);
        self
    }

    /// Set the scheduled slot
    #[must_use]
    pub const fn with_schedule(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Set free-text notes
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Shares currently held or owned
    #[must_use]
    pub const fn allocated_shares(&self) -> u32 {
        self.total_shares.saturating_sub(self.unallocated_shares)
    }

    /// No shares left to reserve
    #[must_use]
    pub const fn is_sold_out(&self) -> bool {
        self.unallocated_shares == 0
    }
}

// ============================================================================
// Reservation
// ============================================================================

/// Reservation status. `Active` is the only non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Hold in force; its shares count against the lot
    Active,
    /// Converted into ownership records
    Completed,
    /// Released by the buyer (explicitly or on page unload)
    Canceled,
    /// Released because the client's countdown reached zero
    TimedOut,
    /// Released by the sweeper after `expires_at`
    Expired,
}

impl ReservationStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::TimedOut => "timed_out",
            Self::Expired => "expired",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "canceled" => Some(Self::Canceled),
            "timed_out" => Some(Self::TimedOut),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// No transition leaves a terminal state
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-boxed claim on `share_count` shares of one lot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Client-generated token
    pub transaction_id: TransactionId,
    /// Lot the shares are held on
    pub lot_id: LotId,
    /// Shares held (1..=7)
    pub share_count: u32,
    /// Current status
    pub status: ReservationStatus,
    /// When the hold was taken
    pub created_at: DateTime<Utc>,
    /// When the hold lapses
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// Create an active hold lasting `hold` from `now`
    #[must_use]
    pub fn new(
        transaction_id: TransactionId,
        lot_id: LotId,
        share_count: u32,
        now: DateTime<Utc>,
        hold: chrono::Duration,
    ) -> Self {
        Self {
            transaction_id,
            lot_id,
            share_count,
            status: ReservationStatus::Active,
            created_at: now,
            expires_at: now + hold,
        }
    }

    /// Still counting against the lot
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    /// Active but past its expiry time
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.expires_at < now
    }

    /// Whole seconds until `expires_at`, floored at zero
    #[must_use]
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((self.expires_at - now).num_seconds()).unwrap_or(0)
    }

    /// Read-only status snapshot
    #[must_use]
    pub fn status_view(&self, now: DateTime<Utc>) -> ReservationStatusView {
        let seconds_remaining = if self.is_active() {
            self.seconds_remaining(now)
        } else {
            0
        };
        ReservationStatusView {
            transaction_id: self.transaction_id.clone(),
            lot_id: self.lot_id,
            share_count: self.share_count,
            status: self.status,
            seconds_remaining,
            expires_at: self.expires_at,
        }
    }
}

/// Response shape of `getReservationStatus`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationStatusView {
    /// Transaction token
    pub transaction_id: TransactionId,
    /// Lot the hold is on
    pub lot_id: LotId,
    /// Shares held
    pub share_count: u32,
    /// Current status
    pub status: ReservationStatus,
    /// Time to live, zero once terminal or lapsed
    pub seconds_remaining: u64,
    /// Expiry instant
    pub expires_at: DateTime<Utc>,
}

/// Shares currently held by active reservations on one lot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLoad {
    /// Lot
    pub lot_id: LotId,
    /// Sum of `share_count` over active reservations
    pub active_share_count: u32,
}

// ============================================================================
// Ownership
// ============================================================================

/// How a shareholder receives their portion
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOption {
    /// Collected on site
    #[default]
    Pickup,
    /// Delivered to the holder
    Delivery,
}

impl DeliveryOption {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pickup => "pickup",
            Self::Delivery => "delivery",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pickup" => Some(Self::Pickup),
            "delivery" => Some(Self::Delivery),
            _ => None,
        }
    }
}

/// Details submitted for one shareholder at finalize time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderDetails {
    /// Full name
    pub name: String,
    /// Contact phone
    pub phone: String,
    /// Purchaser of record for the transaction
    #[serde(default)]
    pub is_purchaser: bool,
    /// Amount already paid towards this share
    #[serde(default)]
    pub paid_amount: i64,
    /// Per-holder delivery fee; the configured default applies when absent
    #[serde(default)]
    pub delivery_fee: Option<i64>,
    /// Delivery preference
    #[serde(default)]
    pub delivery: DeliveryOption,
    /// Consent to be contacted
    #[serde(default)]
    pub consent_to_contact: bool,
}

impl HolderDetails {
    /// Minimal holder with name and phone
    #[must_use]
    pub fn new(name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: phone.into(),
            is_purchaser: false,
            paid_amount: 0,
            delivery_fee: None,
            delivery: DeliveryOption::Pickup,
            consent_to_contact: false,
        }
    }

    /// Flag as purchaser of record
    #[must_use]
    pub const fn purchaser(mut self) -> Self {
        self.is_purchaser = true;
        self
    }

    /// Record an up-front payment
    #[must_use]
    pub const fn with_paid(mut self, amount: i64) -> Self {
        self.paid_amount = amount;
        self
    }

    /// Choose delivery with a fee
    #[must_use]
    pub const fn with_delivery(mut self, fee: i64) -> Self {
        self.delivery = DeliveryOption::Delivery;
        self.delivery_fee = Some(fee);
        self
    }
}

/// Pricing of one share: `total = base + delivery_fee`, `remaining = total - paid`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    /// Lot unit price
    pub base_price: i64,
    /// Delivery fee
    pub delivery_fee: i64,
    /// Amount owed in total
    pub total_amount: i64,
    /// Amount already paid
    pub paid_amount: i64,
    /// Amount still owed
    pub remaining_payment: i64,
}

impl PriceBreakdown {
    /// Compute and validate a breakdown.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::InvalidInput`] for negative amounts or a
    /// payment larger than the total.
    pub fn compute(
        base_price: i64,
        delivery_fee: i64,
        paid_amount: i64,
    ) -> Result<Self, ReservationError> {
        if base_price < 0 || delivery_fee < 0 || paid_amount < 0 {
            return Err(ReservationError::InvalidInput(
                "amounts must not be negative".to_string(),
            ));
        }
        let total_amount = base_price.checked_add(delivery_fee).ok_or_else(|| {
            ReservationError::InvalidInput("total amount overflows".to_string())
        })?;
        if paid_amount > total_amount {
            return Err(ReservationError::InvalidInput(format!(
                "paid amount {paid_amount} exceeds total {total_amount}"
            )));
        }
        Ok(Self {
            base_price,
            delivery_fee,
            total_amount,
            paid_amount,
            remaining_payment: total_amount - paid_amount,
        })
    }
}

/// A committed claim on exactly one share of one lot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    /// Record identifier
    pub id: Uuid,
    /// Transaction the share was bought under
    pub transaction_id: TransactionId,
    /// Lot
    pub lot_id: LotId,
    /// Holder name
    pub holder_name: String,
    /// Holder phone
    pub holder_phone: String,
    /// Exactly one record per transaction carries this flag
    pub is_purchaser: bool,
    /// Pricing
    pub price: PriceBreakdown,
    /// Delivery preference
    pub delivery: DeliveryOption,
    /// Consent to be contacted
    pub consent_to_contact: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl OwnershipRecord {
    /// Build a record for `holder` against `lot`.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::InvalidInput`] for empty contact fields or
    /// invalid amounts.
    pub fn for_holder(
        holder: &HolderDetails,
        lot: &Lot,
        transaction_id: &TransactionId,
        default_delivery_fee: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, ReservationError> {
        let name = holder.name.trim();
        let phone = holder.phone.trim();
        if name.is_empty() || phone.is_empty() {
            return Err(ReservationError::InvalidInput(
                "holder name and phone are required".to_string(),
            ));
        }
        let fee = match holder.delivery {
            DeliveryOption::Pickup => 0,
            DeliveryOption::Delivery => holder.delivery_fee.unwrap_or(default_delivery_fee),
        };
        let price = PriceBreakdown::compute(lot.unit_price, fee, holder.paid_amount)?;

        Ok(Self {
            id: Uuid::new_v4(),
            transaction_id: transaction_id.clone(),
            lot_id: lot.id,
            holder_name: name.to_string(),
            holder_phone: phone.to_string(),
            is_purchaser: holder.is_purchaser,
            price,
            delivery: holder.delivery,
            consent_to_contact: holder.consent_to_contact,
            created_at: now,
        })
    }
}
