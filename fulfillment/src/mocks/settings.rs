//! Mock settings store for testing.

use crate::config::PiiDisclosure;
use crate::error::Result;
use crate::providers::{CheckinPolicy, CheckinSettings};
use crate::types::EventId;
use std::sync::{Arc, Mutex};

/// Settings store whose policy tests can swap mid-flight.
#[derive(Debug, Clone)]
pub struct MockSettings {
    policy: Arc<Mutex<CheckinPolicy>>,
}

impl MockSettings {
    /// A permissive default: generous rate limit, masked PII, undo allowed.
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(CheckinPolicy {
            max_scans_per_window: 100,
            rate_limit_window_secs: 60,
            pii_disclosure: PiiDisclosure::Masked,
            allow_undo: true,
        })
    }

    /// Start from an explicit policy.
    #[must_use]
    pub fn with_policy(policy: CheckinPolicy) -> Self {
        Self {
            policy: Arc::new(Mutex::new(policy)),
        }
    }

    /// Replace the policy served to subsequent calls.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (test-only code).
    #[allow(clippy::unwrap_used)]
    pub fn set(&self, policy: CheckinPolicy) {
        *self.policy.lock().unwrap() = policy;
    }
}

impl Default for MockSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckinSettings for MockSettings {
    #[allow(clippy::unwrap_used)]
    async fn policy(&self, _event_id: EventId) -> Result<CheckinPolicy> {
        Ok(*self.policy.lock().unwrap())
    }
}
