//! Mock notifier for testing.

use crate::providers::Notifier;
use crate::token::RawToken;
use crate::types::{OrderId, TransferId};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// A notification a test observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentNotification {
    /// Purchaser informed their tickets are ready.
    TicketsIssued {
        /// Recipient.
        email: String,
        /// Fulfilled order.
        order_id: OrderId,
        /// Number of tickets.
        count: usize,
    },
    /// Recipient offered a transfer. The raw token is captured so tests can
    /// complete the acceptance leg.
    TransferOffer {
        /// Recipient.
        email: String,
        /// Offered transfer.
        transfer_id: TransferId,
        /// Acceptance token.
        token: String,
        /// Acceptance deadline.
        expires_at: DateTime<Utc>,
    },
}

/// Notifier that records every dispatch for assertions.
#[derive(Debug, Clone, Default)]
pub struct MockNotifier {
    sent: Arc<Mutex<Vec<SentNotification>>>,
}

impl MockNotifier {
    /// Create an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything dispatched so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (test-only code).
    #[allow(clippy::unwrap_used)]
    #[must_use]
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for MockNotifier {
    #[allow(clippy::unwrap_used)]
    async fn tickets_issued(&self, email: &str, order_id: OrderId, count: usize) {
        self.sent.lock().unwrap().push(SentNotification::TicketsIssued {
            email: email.to_string(),
            order_id,
            count,
        });
    }

    #[allow(clippy::unwrap_used)]
    async fn transfer_offer(
        &self,
        email: &str,
        transfer_id: TransferId,
        token: &RawToken,
        expires_at: DateTime<Utc>,
    ) {
        self.sent.lock().unwrap().push(SentNotification::TransferOffer {
            email: email.to_string(),
            transfer_id,
            token: token.expose().to_string(),
            expires_at,
        });
    }
}
