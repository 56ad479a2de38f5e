//! Mock event registry for testing.

use crate::error::{FulfillmentError, Result};
use crate::providers::{EventRegistry, EventSummary};
use crate::types::EventId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// In-memory event registry.
#[derive(Debug, Clone, Default)]
pub struct MockEventRegistry {
    events: Arc<Mutex<HashMap<EventId, EventSummary>>>,
}

impl MockEventRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event with a fresh organization.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (test-only code).
    #[allow(clippy::unwrap_used)]
    pub fn insert(&self, event_id: EventId, name: &str) {
        let summary = EventSummary {
            event_id,
            organization_id: Uuid::new_v4(),
            name: name.to_string(),
        };
        self.events.lock().unwrap().insert(event_id, summary);
    }
}

impl EventRegistry for MockEventRegistry {
    async fn event(&self, event_id: EventId) -> Result<Option<EventSummary>> {
        let events = self
            .events
            .lock()
            .map_err(|_| FulfillmentError::DatabaseError("mutex poisoned".to_string()))?;
        Ok(events.get(&event_id).cloned())
    }
}
