//! Domain types for the fulfillment core.
//!
//! Value objects, entities, and status unions shared by the ledger, issuance,
//! transfer, and check-in engines. Statuses are closed Rust enums mirrored by
//! Postgres enum types; widening any of them is a schema migration, never a
//! data patch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an event.
///
/// Events themselves live in the platform registry; the fulfillment core only
/// references them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random `EventId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `EventId` from a `Uuid`
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

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Creates a new random `OrderId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `OrderId` from a `Uuid`
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

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one line of an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct OrderLineId(Uuid);

impl OrderLineId {
    /// Creates a new random `OrderLineId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `OrderLineId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for OrderLineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderLineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a ticket type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct TicketTypeId(Uuid);

impl TicketTypeId {
    /// Creates a new random `TicketTypeId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `TicketTypeId` from a `Uuid`
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

impl Default for TicketTypeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TicketTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a ticket instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct TicketId(Uuid);

impl TicketId {
    /// Creates a new random `TicketId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `TicketId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a ticket transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Creates a new random `TransferId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `TransferId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a platform user account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct UserId(Uuid);

impl UserId {
    /// Creates a new random `UserId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `UserId` from a `Uuid`
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

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status unions
// ============================================================================

/// Order lifecycle.
///
/// Mutated only by the payment ledger. Once `Paid`, the only forward
/// transition is `Refunded`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Being assembled at checkout.
    Draft,
    /// Checkout complete, awaiting payment confirmation.
    Pending,
    /// Settled; tickets issued.
    Paid,
    /// Payment failed terminally.
    Failed,
    /// Cancelled (including the overbooked abort).
    Cancelled,
    /// Refunded after having been paid.
    Refunded,
}

impl OrderStatus {
    /// Stable lowercase name, as stored in Postgres.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    /// Terminal statuses admit no further transition except `Paid → Refunded`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Refunded)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ticket instance lifecycle.
///
/// `Issued → CheckedIn` on a successful scan, `Issued → Void` on an admin
/// void, `CheckedIn → Issued` on a policy-allowed undo. Nothing else is legal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ticket_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Live and scannable.
    Issued,
    /// Invalidated by an operator or a refund.
    Void,
    /// Redeemed at the door.
    CheckedIn,
}

impl TicketStatus {
    /// Stable lowercase name, as stored in Postgres.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Void => "void",
            Self::CheckedIn => "checked_in",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer lifecycle. Everything except `Pending` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transfer_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Offered, awaiting the recipient.
    Pending,
    /// Recipient accepted; ownership moved.
    Accepted,
    /// Recipient declined.
    Rejected,
    /// Withdrawn by the sender or an operator.
    Cancelled,
    /// Deadline passed before resolution.
    Expired,
}

impl TransferStatus {
    /// Stable lowercase name, as stored in Postgres.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Only `Pending` admits transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ticket type sales lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ticket_type_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TicketTypeStatus {
    /// Not yet purchasable.
    Draft,
    /// Purchasable within the sales window.
    OnSale,
    /// Sales closed.
    Closed,
}

/// Outcome of a single scan attempt, as recorded and as returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "scan_outcome", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanOutcome {
    /// Ticket was `issued` and has been checked in.
    Valid,
    /// Ticket was already checked in.
    AlreadyUsed,
    /// Ticket was voided.
    Cancelled,
    /// Ticket belongs to a different event.
    NotInEvent,
    /// Scanner exceeded the trailing-window threshold; no lookup happened.
    RateLimitExceeded,
    /// No ticket matches the presented token.
    Invalid,
    /// Another scan held the row lock; retryable, never queued.
    Contended,
}

impl ScanOutcome {
    /// Stable lowercase name, as stored in Postgres.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::AlreadyUsed => "already_used",
            Self::Cancelled => "cancelled",
            Self::NotInEvent => "not_in_event",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::Invalid => "invalid",
            Self::Contended => "contended",
        }
    }
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by the payment provider in a webhook notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentEventStatus {
    /// Funds captured.
    Paid,
    /// Terminal provider-side failure.
    Failed,
    /// Cancelled before capture.
    Cancelled,
}

// ============================================================================
// Entities
// ============================================================================

/// An order as persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    /// Order id.
    pub id: OrderId,
    /// Event the order belongs to.
    pub event_id: EventId,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// Sum of line prices, in cents.
    pub subtotal_cents: i64,
    /// Discount applied, in cents.
    pub discount_cents: i64,
    /// `subtotal - discount`, in cents (CHECK-enforced).
    pub total_cents: i64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Purchaser contact email.
    pub purchaser_email: String,
    /// Purchaser display name.
    pub purchaser_name: String,
    /// Linked account, when the purchaser was signed in.
    pub purchaser_user_id: Option<UserId>,
    /// Provider-side payment reference, set at checkout.
    pub payment_ref: Option<String>,
    /// Why a cancelled/failed order ended there (e.g. `overbooked`).
    pub failure_reason: Option<String>,
    /// Free-form checkout metadata.
    pub metadata: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// One row of a purchase: a ticket type and a quantity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrderLine {
    /// Line id.
    pub id: OrderLineId,
    /// Owning order.
    pub order_id: OrderId,
    /// Ticket type purchased.
    pub ticket_type_id: TicketTypeId,
    /// Quantity purchased.
    pub quantity: i32,
    /// Unit price at checkout, in cents.
    pub unit_price_cents: i64,
}

/// A ticket type: the capacity-bearing inventory unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TicketType {
    /// Ticket type id.
    pub id: TicketTypeId,
    /// Event this type admits to.
    pub event_id: EventId,
    /// Display name ("Early Bird", "VIP").
    pub name: String,
    /// Hard capacity; `issued + checked_in` may never exceed it.
    pub capacity_total: i32,
    /// Sales window opening, if bounded.
    pub sales_open_at: Option<DateTime<Utc>>,
    /// Sales window closing, if bounded.
    pub sales_close_at: Option<DateTime<Utc>>,
    /// Sales lifecycle status.
    pub status: TicketTypeStatus,
}

/// A ticket instance held by an attendee.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TicketInstance {
    /// Ticket id.
    pub id: TicketId,
    /// Type this ticket was issued from.
    pub ticket_type_id: TicketTypeId,
    /// Order it was fulfilled for.
    pub order_id: OrderId,
    /// Order line it was fulfilled for.
    pub order_line_id: OrderLineId,
    /// 1-based sequence within the line; `(order_line_id, line_seq)` is
    /// unique, which is what makes issuance idempotent.
    pub line_seq: i32,
    /// Current holder's account, when linked.
    pub owner_user_id: Option<UserId>,
    /// Current holder's email.
    pub owner_email: String,
    /// Current holder's name.
    pub owner_name: String,
    /// Digest of the admission token. The raw token is never stored.
    pub token_hash: String,
    /// Lifecycle status.
    pub status: TicketStatus,
    /// When the ticket was redeemed, if it was.
    pub checked_in_at: Option<DateTime<Utc>>,
    /// Who redeemed it.
    pub checked_in_by: Option<UserId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// A ticket-ownership transfer request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transfer {
    /// Transfer id.
    pub id: TransferId,
    /// Ticket being handed over.
    pub ticket_id: TicketId,
    /// Sender's account, when linked.
    pub from_user_id: Option<UserId>,
    /// Sender's email at initiation time.
    pub from_email: String,
    /// Recipient's account, when known at initiation.
    pub to_user_id: Option<UserId>,
    /// Recipient's email.
    pub to_email: String,
    /// Digest of the acceptance token.
    pub token_hash: String,
    /// Lifecycle status.
    pub status: TransferStatus,
    /// Acceptance deadline.
    pub expires_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the transfer left `pending`.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it.
    pub resolved_by: Option<UserId>,
}

/// One immutable row per scan attempt, successful or not.
///
/// Doubles as the rate-limit counter: trailing-window scan counts are derived
/// from this table on read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScanRecord {
    /// Record id.
    pub id: Uuid,
    /// Event the scanner was admitting to.
    pub event_id: EventId,
    /// Ticket that matched, when one did.
    pub ticket_id: Option<TicketId>,
    /// Scanning actor's account.
    pub actor_user_id: Option<UserId>,
    /// Scanning device, as reported by the client.
    pub device_id: Option<String>,
    /// Client IP.
    pub ip: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// What the scan resolved to.
    pub outcome: ScanOutcome,
    /// When the attempt happened.
    pub scanned_at: DateTime<Utc>,
}

/// The permanent fact that a ticket was checked in, unique per ticket.
///
/// Distinct from the mutable [`TicketInstance::status`]: an undo flips the
/// ticket back to `issued` but never deletes this row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CheckinRecord {
    /// Record id.
    pub id: Uuid,
    /// Redeemed ticket.
    pub ticket_id: TicketId,
    /// Event it was redeemed at.
    pub event_id: EventId,
    /// Who performed the first successful scan.
    pub checked_in_by: Option<UserId>,
    /// Device that performed it.
    pub device_id: Option<String>,
    /// When it happened.
    pub checked_in_at: DateTime<Utc>,
}

// ============================================================================
// Operation payloads
// ============================================================================

/// An inbound payment-provider notification, as handed to the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentNotification {
    /// Payment provider name ("stripe", "mollie", ...).
    pub provider: String,
    /// Provider-unique event id; `(provider, provider_event_id)` is the
    /// idempotency key.
    pub provider_event_id: String,
    /// Provider-side reference identifying the order's payment.
    pub payment_ref: String,
    /// Reported status.
    pub status: PaymentEventStatus,
    /// Captured amount, in cents.
    pub amount_cents: i64,
    /// ISO 4217 currency code.
    pub currency: String,
}

/// Result of settling a payment notification.
///
/// Replaying the same `(provider, provider_event_id)` returns the outcome
/// computed by the first delivery, unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    /// Order the notification resolved to, when one was found.
    pub order_id: Option<OrderId>,
    /// Whether the order is in `paid` after this settlement.
    pub paid: bool,
    /// Instances created by this settlement. A replayed delivery reports the
    /// first delivery's count, since the whole outcome is returned unchanged.
    pub tickets_issued: u32,
    /// Whether issuance aborted the order for lack of capacity.
    pub overbooked: bool,
}

/// The identity a ticket is held under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerIdentity {
    /// Linked account, when known.
    pub user_id: Option<UserId>,
    /// Contact email.
    pub email: String,
    /// Display name.
    pub name: String,
}
