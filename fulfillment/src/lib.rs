//! # Boxoffice Fulfillment
//!
//! The fulfillment core of the Boxoffice ticketing platform: it turns a paid
//! order into inventory-correct tickets, lets ticket ownership move between
//! people under a capability token, and validates tickets at the door under
//! load.
//!
//! ## Guarantees
//!
//! One invariant runs through everything here: a ticket's lifecycle is never
//! corrupted by concurrent or repeated calls. Effects are exactly-once under
//! at-least-once delivery, enforced structurally rather than by client
//! cooperation:
//!
//! - payment settlement: unique `(provider, provider_event_id)`
//! - ticket issuance: unique `(order_line, sequence)`
//! - transfers: at most one pending transfer per ticket
//! - door scans: one check-in record per ticket
//!
//! ## Architecture
//!
//! Every mutating operation is one SQL transaction scoped to a single call.
//! Issuance takes pessimistic row locks in a fixed order; scans take
//! non-blocking (`SKIP LOCKED`) locks and fail fast under contention. External
//! collaborators (identity, event registry, notifications, settings) are
//! traits in [`providers`], with in-memory mocks in [`mocks`]. Every mutating
//! attempt lands in the append-only [`audit`] trail.
//!
//! ## Example: settling a payment
//!
//! ```rust,ignore
//! use boxoffice_fulfillment::*;
//!
//! let outcome = ledger
//!     .apply_payment_event(&Actor::service(), notification)
//!     .await?;
//! assert!(outcome.paid);
//! // Replaying the same notification returns the same outcome, unchanged.
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

// Public modules
pub mod actor;
pub mod audit;
pub mod capacity;
pub mod checkin;
pub mod config;
pub mod db;
pub mod error;
pub mod issuance;
pub mod ledger;
pub mod masking;
pub mod providers;
pub mod token;
pub mod transfer;
pub mod types;

#[cfg(feature = "test-utils")]
pub mod mocks;

// Re-export main types for convenience
pub use actor::{authorize, Actor, Permission, Role};
pub use audit::{AuditEntry, AuditTrail};
pub use checkin::{CheckinService, ScanContext, ScanResponse, ScannedTicket, ScanStats};
pub use config::{FulfillmentConfig, PiiDisclosure};
pub use error::{FulfillmentError, Result};
pub use issuance::{IssuedTicket, TicketIssuer};
pub use ledger::PaymentLedger;
pub use token::{RawToken, TokenCrypto, TokenHash};
pub use transfer::{TransferAcceptance, TransferManager, TransferOffer};
pub use types::{
    EventId, Order, OrderId, OrderStatus, PaymentEventStatus, PaymentNotification,
    PaymentOutcome, ScanOutcome, TicketId, TicketInstance, TicketStatus, TicketTypeId,
    Transfer, TransferId, TransferStatus, UserId,
};
