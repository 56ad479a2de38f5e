//! Notification dispatcher trait.

use crate::token::RawToken;
use crate::types::{OrderId, TransferId};
use chrono::{DateTime, Utc};

/// Fire-and-forget notification dispatch.
///
/// Invoked after the mutating transaction commits; a delivery failure must
/// never fail or roll back the operation that triggered it, so these methods
/// are infallible at the call surface and implementations log their own
/// errors.
pub trait Notifier: Send + Sync {
    /// Tell a purchaser their tickets are ready.
    fn tickets_issued(
        &self,
        email: &str,
        order_id: OrderId,
        count: usize,
    ) -> impl std::future::Future<Output = ()> + Send;

    /// Send a transfer offer to the recipient, including the acceptance
    /// token. The token travels to the recipient and nowhere else.
    fn transfer_offer(
        &self,
        email: &str,
        transfer_id: TransferId,
        token: &RawToken,
        expires_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = ()> + Send;
}

/// Notifier that records intent in the log instead of dispatching email.
///
/// Suitable as a default wiring in environments without a mail relay. Note
/// that tokens are deliberately NOT logged, which makes this implementation
/// observable but not usable to complete a transfer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    async fn tickets_issued(&self, email: &str, order_id: OrderId, count: usize) {
        tracing::info!(email = %email, order_id = %order_id, count, "tickets issued notification");
    }

    async fn transfer_offer(
        &self,
        email: &str,
        transfer_id: TransferId,
        _token: &RawToken,
        expires_at: DateTime<Utc>,
    ) {
        tracing::info!(
            email = %email,
            transfer_id = %transfer_id,
            expires_at = %expires_at,
            "transfer offer notification"
        );
    }
}
