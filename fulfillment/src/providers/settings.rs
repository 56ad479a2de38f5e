//! Check-in settings store trait.

use crate::config::{CheckinConfig, PiiDisclosure};
use crate::error::Result;
use crate::types::EventId;
use serde::{Deserialize, Serialize};

/// Effective door policy for one event, as read-only input to check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinPolicy {
    /// Scans allowed per actor (and per device) in the trailing window.
    pub max_scans_per_window: u32,
    /// Trailing rate-limit window in seconds.
    pub rate_limit_window_secs: u64,
    /// PII disclosure level applied at the response boundary.
    pub pii_disclosure: PiiDisclosure,
    /// Whether operators may undo a check-in.
    pub allow_undo: bool,
}

/// Read-only access to per-event check-in settings.
pub trait CheckinSettings: Send + Sync {
    /// Effective policy for `event_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the settings store call fails.
    fn policy(
        &self,
        event_id: EventId,
    ) -> impl std::future::Future<Output = Result<CheckinPolicy>> + Send;
}

/// Settings provider serving the same configured policy for every event.
#[derive(Debug, Clone, Copy)]
pub struct StaticSettings {
    policy: CheckinPolicy,
}

impl StaticSettings {
    /// Build from the process configuration defaults.
    #[must_use]
    pub const fn from_config(config: &CheckinConfig) -> Self {
        Self {
            policy: CheckinPolicy {
                max_scans_per_window: config.max_scans_per_window,
                rate_limit_window_secs: config.rate_limit_window_secs,
                pii_disclosure: config.pii_disclosure,
                allow_undo: config.allow_undo,
            },
        }
    }
}

impl CheckinSettings for StaticSettings {
    async fn policy(&self, _event_id: EventId) -> Result<CheckinPolicy> {
        Ok(self.policy)
    }
}
