//! Mock identity directory for testing.

use crate::error::{FulfillmentError, Result};
use crate::providers::{IdentityDirectory, UserRef};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory identity directory keyed by email.
#[derive(Debug, Clone, Default)]
pub struct MockIdentityDirectory {
    users: Arc<Mutex<HashMap<String, UserRef>>>,
}

impl MockIdentityDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user under their email.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (test-only code).
    #[allow(clippy::unwrap_used)]
    pub fn insert(&self, user: UserRef) {
        self.users.lock().unwrap().insert(user.email.clone(), user);
    }
}

impl IdentityDirectory for MockIdentityDirectory {
    async fn user_by_email(&self, email: &str) -> Result<Option<UserRef>> {
        let users = self
            .users
            .lock()
            .map_err(|_| FulfillmentError::DatabaseError("mutex poisoned".to_string()))?;
        Ok(users.get(email).cloned())
    }
}
