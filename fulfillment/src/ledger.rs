//! Payment ledger: authoritative order/payment status.
//!
//! The ledger owns every order-status mutation and the idempotency record for
//! inbound payment notifications. `(provider, provider_event_id)` is claimed
//! with an `INSERT ... ON CONFLICT DO NOTHING` at the top of the settlement
//! transaction; a duplicate delivery blocks on the first one's commit, finds
//! the stored outcome, and returns it unchanged. No second mutation occurs.

use crate::actor::{authorize, Actor, Permission};
use crate::audit::{AuditEntry, AuditTrail};
use crate::error::{FulfillmentError, Result};
use crate::issuance::{Fulfillment, TicketIssuer};
use crate::providers::Notifier;
use crate::types::{
    Order, OrderId, OrderStatus, PaymentEventStatus, PaymentNotification, PaymentOutcome,
};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

impl PaymentEventStatus {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Lock an order row for the remainder of the transaction.
pub(crate) async fn lock_order(conn: &mut PgConnection, order_id: OrderId) -> Result<Order> {
    sqlx::query_as::<_, Order>(
        r"
        SELECT id, event_id, status, subtotal_cents, discount_cents, total_cents,
               currency, purchaser_email, purchaser_name, purchaser_user_id,
               payment_ref, failure_reason, metadata, created_at, updated_at
        FROM orders
        WHERE id = $1
        FOR UPDATE
        ",
    )
    .bind(order_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(FulfillmentError::db)?
    .ok_or(FulfillmentError::OrderNotFound)
}

async fn lock_order_by_payment_ref(
    conn: &mut PgConnection,
    payment_ref: &str,
) -> Result<Option<Order>> {
    sqlx::query_as::<_, Order>(
        r"
        SELECT id, event_id, status, subtotal_cents, discount_cents, total_cents,
               currency, purchaser_email, purchaser_name, purchaser_user_id,
               payment_ref, failure_reason, metadata, created_at, updated_at
        FROM orders
        WHERE payment_ref = $1
        FOR UPDATE
        ",
    )
    .bind(payment_ref)
    .fetch_optional(&mut *conn)
    .await
    .map_err(FulfillmentError::db)
}

async fn set_order_status(
    conn: &mut PgConnection,
    order_id: OrderId,
    from: OrderStatus,
    to: OrderStatus,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE orders SET status = $3, updated_at = now() WHERE id = $1 AND status = $2",
    )
    .bind(order_id)
    .bind(from)
    .bind(to)
    .execute(&mut *conn)
    .await
    .map_err(FulfillmentError::db)?;
    Ok(result.rows_affected() == 1)
}

/// Drive an order that cannot be covered to its cancelled terminal state.
pub(crate) async fn mark_order_overbooked(
    conn: &mut PgConnection,
    order_id: OrderId,
) -> Result<()> {
    sqlx::query(
        r"
        UPDATE orders
        SET status = 'cancelled', failure_reason = 'overbooked', updated_at = now()
        WHERE id = $1
        ",
    )
    .bind(order_id)
    .execute(&mut *conn)
    .await
    .map_err(FulfillmentError::db)?;
    Ok(())
}

/// Void every live instance of an order (racing-retry cleanup, refunds).
async fn void_order_instances(conn: &mut PgConnection, order_id: OrderId) -> Result<u64> {
    let result = sqlx::query(
        r"
        UPDATE ticket_instances
        SET status = 'void', updated_at = now()
        WHERE order_id = $1 AND status = 'issued'
        ",
    )
    .bind(order_id)
    .execute(&mut *conn)
    .await
    .map_err(FulfillmentError::db)?;
    Ok(result.rows_affected())
}

/// Payment ledger engine.
#[derive(Debug, Clone)]
pub struct PaymentLedger<N> {
    pool: PgPool,
    audit: AuditTrail,
    issuer: TicketIssuer<N>,
}

impl<N: Notifier> PaymentLedger<N> {
    /// Create a ledger that fulfills paid orders through `issuer`.
    pub const fn new(pool: PgPool, audit: AuditTrail, issuer: TicketIssuer<N>) -> Self {
        Self { pool, audit, issuer }
    }

    /// Settle one inbound payment notification.
    ///
    /// Safe under at-least-once delivery: replaying a `(provider,
    /// provider_event_id)` pair returns the outcome computed by the first
    /// delivery, and racing deliveries serialize on the idempotency row.
    ///
    /// # Errors
    ///
    /// - [`FulfillmentError::InvalidInput`] for blank identifiers or a
    ///   negative amount (rejected before any state change)
    /// - [`FulfillmentError::OrderNotFound`] when no order carries the
    ///   notification's payment reference; nothing is recorded so a retry
    ///   after the order lands can still settle
    pub async fn apply_payment_event(
        &self,
        actor: &Actor,
        notification: PaymentNotification,
    ) -> Result<PaymentOutcome> {
        authorize(actor, Permission::SettlePayments)?;
        validate_notification(&notification)?;

        let mut tx = self.pool.begin().await.map_err(FulfillmentError::db)?;

        // Claim the idempotency slot. A concurrent duplicate blocks here
        // until the first delivery commits, then reads its stored outcome.
        let claimed: Option<Uuid> = sqlx::query_scalar(
            r"
            INSERT INTO payment_events
                (id, provider, provider_event_id, payment_ref, status,
                 amount_cents, currency, outcome)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'null')
            ON CONFLICT (provider, provider_event_id) DO NOTHING
            RETURNING id
            ",
        )
        .bind(Uuid::new_v4())
        .bind(&notification.provider)
        .bind(&notification.provider_event_id)
        .bind(&notification.payment_ref)
        .bind(notification.status.as_str())
        .bind(notification.amount_cents)
        .bind(&notification.currency)
        .fetch_optional(&mut *tx)
        .await
        .map_err(FulfillmentError::db)?;

        let Some(event_row_id) = claimed else {
            let _ = tx.rollback().await;
            let stored = self.stored_outcome(&notification).await?;
            tracing::info!(
                provider = %notification.provider,
                provider_event_id = %notification.provider_event_id,
                "duplicate payment event, returning stored outcome"
            );
            return Ok(stored);
        };

        let Some(order) = lock_order_by_payment_ref(&mut tx, &notification.payment_ref).await?
        else {
            // Leave the idempotency slot unclaimed so a retry can settle
            // once the order exists.
            let _ = tx.rollback().await;
            self.audit
                .record(AuditEntry::failure(
                    actor,
                    "payment.apply",
                    "payment_event",
                    format!("{}:{}", notification.provider, notification.provider_event_id),
                    "order_not_found",
                ))
                .await;
            return Err(FulfillmentError::OrderNotFound);
        };

        if notification.amount_cents != order.total_cents {
            tracing::warn!(
                order_id = %order.id,
                expected = order.total_cents,
                received = notification.amount_cents,
                "payment amount differs from order total"
            );
        }

        let status_before = order.status;
        let (outcome, issued) = self.settle(&mut tx, &order, &notification).await?;

        sqlx::query("UPDATE payment_events SET order_id = $2, outcome = $3 WHERE id = $1")
            .bind(event_row_id)
            .bind(order.id)
            .bind(
                serde_json::to_value(&outcome)
                    .map_err(|e| FulfillmentError::DatabaseError(e.to_string()))?,
            )
            .execute(&mut *tx)
            .await
            .map_err(FulfillmentError::db)?;

        tx.commit().await.map_err(FulfillmentError::db)?;

        let status_after = if outcome.paid {
            OrderStatus::Paid
        } else if outcome.overbooked {
            OrderStatus::Cancelled
        } else {
            match notification.status {
                PaymentEventStatus::Failed => OrderStatus::Failed,
                PaymentEventStatus::Cancelled => OrderStatus::Cancelled,
                PaymentEventStatus::Paid => status_before,
            }
        };
        self.audit
            .record(
                AuditEntry::success(actor, "payment.apply", "order", order.id)
                    .with_transition(status_before.as_str(), status_after.as_str())
                    .with_detail(serde_json::json!({
                        "provider": notification.provider,
                        "provider_event_id": notification.provider_event_id,
                        "tickets_issued": outcome.tickets_issued,
                        "overbooked": outcome.overbooked,
                    })),
            )
            .await;

        if issued > 0 {
            self.issuer
                .notify_issued(&order.purchaser_email, order.id, issued)
                .await;
        }

        tracing::info!(
            order_id = %order.id,
            paid = outcome.paid,
            tickets_issued = outcome.tickets_issued,
            overbooked = outcome.overbooked,
            "payment event settled"
        );

        Ok(outcome)
    }

    /// Record a refund: the only forward transition out of `paid`. Voids the
    /// order's live instances.
    ///
    /// # Errors
    ///
    /// Returns [`FulfillmentError::OrderStateConflict`] unless the order is
    /// `paid`.
    pub async fn refund_order(&self, actor: &Actor, order_id: OrderId) -> Result<()> {
        authorize(actor, Permission::SettlePayments)?;

        let mut tx = self.pool.begin().await.map_err(FulfillmentError::db)?;
        let order = lock_order(&mut tx, order_id).await?;

        if !set_order_status(&mut tx, order_id, OrderStatus::Paid, OrderStatus::Refunded).await? {
            let _ = tx.rollback().await;
            self.audit
                .record(
                    AuditEntry::failure(actor, "order.refund", "order", order_id, "order_not_paid")
                        .with_transition(order.status.as_str(), order.status.as_str()),
                )
                .await;
            return Err(FulfillmentError::OrderStateConflict {
                order: order_id,
                status: order.status.to_string(),
                attempted: "refund".to_string(),
            });
        }

        let voided = void_order_instances(&mut tx, order_id).await?;
        tx.commit().await.map_err(FulfillmentError::db)?;

        tracing::info!(order_id = %order_id, voided, "order refunded");
        self.audit
            .record(
                AuditEntry::success(actor, "order.refund", "order", order_id)
                    .with_transition(OrderStatus::Paid.as_str(), OrderStatus::Refunded.as_str())
                    .with_detail(serde_json::json!({ "voided": voided })),
            )
            .await;
        Ok(())
    }

    /// Apply the notification to the locked order. Returns the outcome and
    /// the number of instances created.
    async fn settle(
        &self,
        conn: &mut PgConnection,
        order: &Order,
        notification: &PaymentNotification,
    ) -> Result<(PaymentOutcome, u32)> {
        match notification.status {
            PaymentEventStatus::Paid => match order.status {
                OrderStatus::Pending => {
                    set_order_status(&mut *conn, order.id, OrderStatus::Pending, OrderStatus::Paid)
                        .await?;
                    let mut paid_order = order.clone();
                    paid_order.status = OrderStatus::Paid;

                    match self.issuer.fulfill(&mut *conn, &paid_order).await? {
                        Fulfillment::Issued { created, .. } => Ok((
                            PaymentOutcome {
                                order_id: Some(order.id),
                                paid: true,
                                tickets_issued: created,
                                overbooked: false,
                            },
                            created,
                        )),
                        Fulfillment::ShortOfCapacity(shortfall) => {
                            mark_order_overbooked(&mut *conn, order.id).await?;
                            tracing::warn!(
                                order_id = %order.id,
                                ticket_type = %shortfall.ticket_type,
                                requested = shortfall.requested,
                                available = shortfall.available,
                                "order overbooked, cancelled for refund"
                            );
                            Ok((
                                PaymentOutcome {
                                    order_id: Some(order.id),
                                    paid: false,
                                    tickets_issued: 0,
                                    overbooked: true,
                                },
                                0,
                            ))
                        }
                    }
                }
                // Already settled by an earlier event: no second mutation.
                OrderStatus::Paid => Ok((
                    PaymentOutcome {
                        order_id: Some(order.id),
                        paid: true,
                        tickets_issued: 0,
                        overbooked: false,
                    },
                    0,
                )),
                _ => Ok((
                    PaymentOutcome {
                        order_id: Some(order.id),
                        paid: false,
                        tickets_issued: 0,
                        overbooked: order.failure_reason.as_deref() == Some("overbooked"),
                    },
                    0,
                )),
            },
            PaymentEventStatus::Failed | PaymentEventStatus::Cancelled => {
                let target = match notification.status {
                    PaymentEventStatus::Failed => OrderStatus::Failed,
                    _ => OrderStatus::Cancelled,
                };
                let moved =
                    set_order_status(&mut *conn, order.id, OrderStatus::Pending, target).await?;
                if moved {
                    // A racing retry may have created instances before this
                    // terminal event arrived; those instances are dead now.
                    let voided = void_order_instances(&mut *conn, order.id).await?;
                    if voided > 0 {
                        tracing::warn!(
                            order_id = %order.id,
                            voided,
                            "voided instances on terminal payment status"
                        );
                    }
                } else if order.status == OrderStatus::Paid {
                    // Once paid, only a refund moves the order; a conflicting
                    // provider signal is surfaced, not applied.
                    tracing::warn!(
                        order_id = %order.id,
                        provider_status = notification.status.as_str(),
                        "terminal payment status for an already-paid order ignored"
                    );
                }
                Ok((
                    PaymentOutcome {
                        order_id: Some(order.id),
                        paid: order.status == OrderStatus::Paid,
                        tickets_issued: 0,
                        overbooked: false,
                    },
                    0,
                ))
            }
        }
    }

    /// Outcome stored by the delivery that claimed the idempotency slot.
    async fn stored_outcome(&self, notification: &PaymentNotification) -> Result<PaymentOutcome> {
        let stored: serde_json::Value = sqlx::query_scalar(
            r"
            SELECT outcome FROM payment_events
            WHERE provider = $1 AND provider_event_id = $2
            ",
        )
        .bind(&notification.provider)
        .bind(&notification.provider_event_id)
        .fetch_one(&self.pool)
        .await
        .map_err(FulfillmentError::db)?;

        serde_json::from_value(stored)
            .map_err(|e| FulfillmentError::DatabaseError(format!("stored outcome corrupt: {e}")))
    }
}

fn validate_notification(notification: &PaymentNotification) -> Result<()> {
    if notification.provider.trim().is_empty() {
        return Err(FulfillmentError::InvalidInput { reason: "provider is empty".to_string() });
    }
    if notification.provider_event_id.trim().is_empty() {
        return Err(FulfillmentError::InvalidInput {
            reason: "provider_event_id is empty".to_string(),
        });
    }
    if notification.payment_ref.trim().is_empty() {
        return Err(FulfillmentError::InvalidInput { reason: "payment_ref is empty".to_string() });
    }
    if notification.amount_cents < 0 {
        return Err(FulfillmentError::InvalidInput {
            reason: "amount_cents is negative".to_string(),
        });
    }
    Ok(())
}
