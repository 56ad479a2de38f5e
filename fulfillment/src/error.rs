//! Error types for fulfillment operations.

use crate::types::{OrderId, TicketId, TicketTypeId, TransferId};
use thiserror::Error;

/// Result type alias for fulfillment operations.
pub type Result<T> = std::result::Result<T, FulfillmentError>;

/// Error taxonomy for the fulfillment core.
///
/// Variants are grouped by how the caller should react: validation and
/// authorization failures are rejected before any mutation, conflicts carry a
/// machine-readable reason, and `Contended` is the only retryable variant.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FulfillmentError {
    // ═══════════════════════════════════════════════════════════
    // Validation
    // ═══════════════════════════════════════════════════════════

    /// Malformed input, rejected before any state change.
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// What was wrong with the input
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════
    // Authorization
    // ═══════════════════════════════════════════════════════════

    /// Actor lacks the permission required for this operation.
    #[error("Insufficient permissions: {required}")]
    InsufficientPermissions {
        /// Required permission that was missing
        required: String,
    },

    // ═══════════════════════════════════════════════════════════
    // Not found
    // ═══════════════════════════════════════════════════════════

    /// Unknown order.
    #[error("Order not found")]
    OrderNotFound,

    /// Unknown ticket.
    #[error("Ticket not found")]
    TicketNotFound,

    /// Unknown ticket type.
    #[error("Ticket type not found")]
    TicketTypeNotFound,

    /// Unknown transfer.
    #[error("Transfer not found")]
    TransferNotFound,

    /// Unknown event.
    #[error("Event not found")]
    EventNotFound,

    // ═══════════════════════════════════════════════════════════
    // Conflicts
    // ═══════════════════════════════════════════════════════════

    /// A ticket type cannot cover the quantity the order requests.
    ///
    /// The order has been driven to its cancelled terminal state; resolving
    /// this requires an external refund workflow, never an automatic retry.
    #[error("Capacity exceeded for ticket type {ticket_type}: requested {requested}, available {available}")]
    CapacityExceeded {
        /// Ticket type that ran out
        ticket_type: TicketTypeId,
        /// Quantity the order requested for that type
        requested: u32,
        /// Seats remaining at the time of the locked count
        available: u32,
    },

    /// Order is not in a state that permits the attempted transition.
    #[error("Order {order} is {status}, cannot {attempted}")]
    OrderStateConflict {
        /// Order in question
        order: OrderId,
        /// Status it was found in
        status: String,
        /// Transition that was attempted
        attempted: String,
    },

    /// Ticket is not in a state that permits the attempted transition.
    #[error("Ticket {ticket} is {status}, cannot {attempted}")]
    TicketStateConflict {
        /// Ticket in question
        ticket: TicketId,
        /// Status it was found in
        status: String,
        /// Transition that was attempted
        attempted: String,
    },

    /// Transfer is not pending (already resolved, or resolved by a racer).
    #[error("Transfer {transfer} is {status}, not pending")]
    TransferNotPending {
        /// Transfer in question
        transfer: TransferId,
        /// Terminal status it was found in
        status: String,
    },

    /// Transfer deadline passed; the transfer has been marked expired.
    #[error("Transfer {transfer} has expired")]
    TransferExpired {
        /// Transfer in question
        transfer: TransferId,
    },

    /// A pending transfer already exists for this ticket.
    #[error("Ticket {ticket} already has a pending transfer")]
    TransferAlreadyPending {
        /// Ticket in question
        ticket: TicketId,
    },

    /// Presented token does not match the stored digest.
    #[error("Invalid token")]
    InvalidToken,

    /// Check-in undo is disabled by the event's policy.
    #[error("Check-in undo is not allowed for this event")]
    UndoNotAllowed,

    // ═══════════════════════════════════════════════════════════
    // Transient
    // ═══════════════════════════════════════════════════════════

    /// Another scan holds the row lock; the caller may retry.
    #[error("Ticket is being scanned concurrently, retry")]
    Contended,

    // ═══════════════════════════════════════════════════════════
    // System
    // ═══════════════════════════════════════════════════════════

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl FulfillmentError {
    /// Returns `true` if the caller may retry the operation as-is.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Contended)
    }

    /// Returns `true` if this error reports a conflict with current state
    /// rather than a caller mistake or a system failure.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::OrderStateConflict { .. }
                | Self::TicketStateConflict { .. }
                | Self::TransferNotPending { .. }
                | Self::TransferExpired { .. }
                | Self::TransferAlreadyPending { .. }
                | Self::InvalidToken
                | Self::UndoNotAllowed
        )
    }

    /// Returns `true` if this error is due to invalid or unauthorized input.
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. } | Self::InsufficientPermissions { .. } | Self::InvalidToken
        )
    }

    pub(crate) fn db(e: sqlx::Error) -> Self {
        Self::DatabaseError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use uuid::Uuid;

    #[test]
    fn contended_is_the_only_retryable_error() {
        assert!(FulfillmentError::Contended.is_retryable());
        assert!(!FulfillmentError::InvalidToken.is_retryable());
        assert!(!FulfillmentError::DatabaseError("boom".into()).is_retryable());
    }

    #[test]
    fn conflict_classification() {
        let err = FulfillmentError::CapacityExceeded {
            ticket_type: TicketTypeId::from_uuid(Uuid::nil()),
            requested: 3,
            available: 1,
        };
        assert!(err.is_conflict());
        assert!(!err.is_user_error());
        assert!(FulfillmentError::InvalidToken.is_conflict());
        assert!(!FulfillmentError::OrderNotFound.is_conflict());
    }
}
