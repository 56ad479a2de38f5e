//! Event registry trait.

use crate::error::Result;
use crate::types::EventId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event as known to the platform registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    /// Event id.
    pub event_id: EventId,
    /// Organization owning the event.
    pub organization_id: Uuid,
    /// Display name.
    pub name: String,
}

/// Read-only lookup into the platform's event/organization registry.
pub trait EventRegistry: Send + Sync {
    /// Resolve an event to its summary, if it exists.
    ///
    /// # Errors
    ///
    /// Returns error if the registry call fails.
    fn event(
        &self,
        event_id: EventId,
    ) -> impl std::future::Future<Output = Result<Option<EventSummary>>> + Send;
}
