//! Explicit caller context and centralized authorization.
//!
//! No function in this crate infers who is calling it: every mutating
//! operation takes an [`Actor`] and runs [`authorize`] before touching state.

use crate::error::{FulfillmentError, Result};
use crate::types::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who is performing an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Account of the caller, when authenticated.
    pub user_id: Option<UserId>,
    /// Contact email of the caller, when known.
    pub email: Option<String>,
    /// Role the caller holds for the organization owning the touched data.
    pub role: Role,
}

impl Actor {
    /// An authenticated attendee.
    #[must_use]
    pub const fn attendee(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            email: None,
            role: Role::Attendee,
        }
    }

    /// A trusted machine caller (webhook ingress, maintenance job).
    #[must_use]
    pub const fn service() -> Self {
        Self {
            user_id: None,
            email: None,
            role: Role::Service,
        }
    }

    /// Same actor with the email filled in.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Short description for audit rows and log fields.
    #[must_use]
    pub fn label(&self) -> String {
        match self.user_id {
            Some(id) => format!("{}:{id}", self.role),
            None => self.role.to_string(),
        }
    }
}

/// Role held by a caller, as resolved by the platform's identity service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Ticket holder or purchaser.
    Attendee,
    /// Door staff operating a scanner.
    GateStaff,
    /// Event organizer.
    Organizer,
    /// Platform administrator.
    Admin,
    /// Trusted machine caller.
    Service,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Attendee => "attendee",
            Self::GateStaff => "gate_staff",
            Self::Organizer => "organizer",
            Self::Admin => "admin",
            Self::Service => "service",
        };
        f.write_str(s)
    }
}

/// Permission required by an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    /// Settle inbound payment notifications and record refunds.
    SettlePayments,
    /// Issue tickets outside the settlement path (backfill/retry).
    IssueTickets,
    /// Initiate a transfer of a ticket the caller does not own.
    TransferAnyTicket,
    /// Operate the door scanner.
    ScanTickets,
    /// Void a ticket or undo a check-in.
    ManageTickets,
    /// See unmasked participant PII in scan responses.
    ViewFullPii,
}

impl Permission {
    /// Stable name, used in error messages and audit rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SettlePayments => "settle_payments",
            Self::IssueTickets => "issue_tickets",
            Self::TransferAnyTicket => "transfer_any_ticket",
            Self::ScanTickets => "scan_tickets",
            Self::ManageTickets => "manage_tickets",
            Self::ViewFullPii => "view_full_pii",
        }
    }
}

impl Role {
    /// Role → permission mapping. Financial permissions never reach the
    /// door-staff role.
    #[must_use]
    pub const fn allows(self, permission: Permission) -> bool {
        match permission {
            Permission::SettlePayments => matches!(self, Self::Service | Self::Admin),
            Permission::IssueTickets => {
                matches!(self, Self::Service | Self::Organizer | Self::Admin)
            }
            Permission::TransferAnyTicket | Permission::ManageTickets | Permission::ViewFullPii => {
                matches!(self, Self::Organizer | Self::Admin)
            }
            Permission::ScanTickets => {
                matches!(self, Self::GateStaff | Self::Organizer | Self::Admin)
            }
        }
    }
}

/// Single authorization gate run before any handler body executes.
///
/// # Errors
///
/// Returns [`FulfillmentError::InsufficientPermissions`] when the actor's role
/// does not grant `permission`.
pub fn authorize(actor: &Actor, permission: Permission) -> Result<()> {
    if actor.role.allows(permission) {
        Ok(())
    } else {
        tracing::warn!(
            actor = %actor.label(),
            required = permission.as_str(),
            "authorization denied"
        );
        Err(FulfillmentError::InsufficientPermissions {
            required: permission.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn gate_staff_cannot_touch_money() {
        assert!(!Role::GateStaff.allows(Permission::SettlePayments));
        assert!(!Role::GateStaff.allows(Permission::TransferAnyTicket));
        assert!(Role::GateStaff.allows(Permission::ScanTickets));
    }

    #[test]
    fn service_settles_but_does_not_scan() {
        assert!(Role::Service.allows(Permission::SettlePayments));
        assert!(!Role::Service.allows(Permission::ScanTickets));
    }

    #[test]
    fn authorize_reports_missing_permission() {
        let actor = Actor::attendee(UserId::new());
        let err = authorize(&actor, Permission::ManageTickets).unwrap_err();
        assert_eq!(
            err,
            FulfillmentError::InsufficientPermissions {
                required: "manage_tickets".to_string()
            }
        );
        assert!(authorize(&Actor::service(), Permission::SettlePayments).is_ok());
    }
}
