//! Identity directory trait.

use crate::error::Result;
use crate::types::UserId;
use serde::{Deserialize, Serialize};

/// A user account as known to the platform's identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    /// Account id.
    pub user_id: UserId,
    /// Primary email.
    pub email: String,
    /// Display name.
    pub name: String,
}

/// Read-only lookup into the platform's identity service.
///
/// Used by transfer acceptance to resolve a recipient email to an account.
/// Lookups are best-effort: an unknown email is `Ok(None)`, not an error.
pub trait IdentityDirectory: Send + Sync {
    /// Find the account registered under `email`, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the identity service call fails.
    fn user_by_email(
        &self,
        email: &str,
    ) -> impl std::future::Future<Output = Result<Option<UserRef>>> + Send;
}
