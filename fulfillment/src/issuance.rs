//! Ticket issuance: turns a paid order into ticket instances.
//!
//! Inventory correctness with variable quantities cannot be expressed through
//! uniqueness constraints alone, so issuance takes pessimistic row locks: the
//! order row first, then every referenced ticket-type row in ascending-id
//! order (two orders spanning the same types always lock in the same
//! sequence, which is what rules out deadlocks). Counting happens under those
//! locks; the pure decision lives in [`crate::capacity::plan_issuance`].
//!
//! Idempotency is structural: `(order_line_id, line_seq)` is unique, and the
//! planner only requests sequences a previous fulfillment did not occupy, so
//! re-invoking issuance on a fulfilled order inserts nothing and returns the
//! existing instances.

use crate::actor::{authorize, Actor, Permission};
use crate::audit::{AuditEntry, AuditTrail};
use crate::capacity::{plan_issuance, CapacityShortfall, LineRequest, TypeInventory};
use crate::error::{FulfillmentError, Result};
use crate::ledger;
use crate::providers::Notifier;
use crate::token::{RawToken, TokenCrypto};
use crate::types::{
    Order, OrderLine, OrderStatus, TicketId, TicketInstance, TicketTypeId,
};
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;

/// A ticket instance handed back from issuance.
#[derive(Debug, Clone)]
pub struct IssuedTicket {
    /// The persisted instance.
    pub ticket: TicketInstance,
    /// The admission token, present only when this call created the
    /// instance. It exists nowhere else; deliver it to the holder now or
    /// never.
    pub raw_token: Option<RawToken>,
}

/// What fulfillment decided for an order, before the caller resolves it.
#[derive(Debug)]
pub(crate) enum Fulfillment {
    /// Every line fits; instances exist (pre-existing and newly created).
    Issued {
        /// All instances for the order, in line/sequence order.
        tickets: Vec<IssuedTicket>,
        /// How many of them this call created.
        created: u32,
    },
    /// Some type cannot cover the order; nothing was created for any line.
    ShortOfCapacity(CapacityShortfall),
}

/// Issuance engine.
#[derive(Debug, Clone)]
pub struct TicketIssuer<N> {
    pool: PgPool,
    audit: AuditTrail,
    notifier: N,
}

impl<N: Notifier> TicketIssuer<N> {
    /// Create an issuer.
    pub const fn new(pool: PgPool, audit: AuditTrail, notifier: N) -> Self {
        Self { pool, audit, notifier }
    }

    /// Issue all instances for a paid order. Idempotent; usable standalone
    /// for backfill or retry after a crashed settlement.
    ///
    /// # Errors
    ///
    /// - [`FulfillmentError::OrderNotFound`] for an unknown order
    /// - [`FulfillmentError::OrderStateConflict`] unless the order is `paid`
    /// - [`FulfillmentError::CapacityExceeded`] when a line cannot be
    ///   covered; the order has then been driven to its cancelled terminal
    ///   state and an external refund is required
    pub async fn issue(&self, actor: &Actor, order_id: crate::types::OrderId) -> Result<Vec<IssuedTicket>> {
        authorize(actor, Permission::IssueTickets)?;

        let mut tx = self.pool.begin().await.map_err(FulfillmentError::db)?;
        let order = ledger::lock_order(&mut tx, order_id).await?;

        if order.status != OrderStatus::Paid {
            let _ = tx.rollback().await;
            self.audit
                .record(
                    AuditEntry::failure(actor, "order.issue", "order", order_id, "order_not_paid")
                        .with_transition(order.status.as_str(), order.status.as_str()),
                )
                .await;
            return Err(FulfillmentError::OrderStateConflict {
                order: order_id,
                status: order.status.to_string(),
                attempted: "issue".to_string(),
            });
        }

        match self.fulfill(&mut tx, &order).await? {
            Fulfillment::Issued { tickets, created } => {
                tx.commit().await.map_err(FulfillmentError::db)?;

                tracing::info!(
                    order_id = %order.id,
                    created,
                    total = tickets.len(),
                    "order issuance complete"
                );
                self.audit
                    .record(
                        AuditEntry::success(actor, "order.issue", "order", order.id)
                            .with_detail(serde_json::json!({ "created": created })),
                    )
                    .await;
                if created > 0 {
                    self.notifier
                        .tickets_issued(&order.purchaser_email, order.id, tickets.len())
                        .await;
                }
                Ok(tickets)
            }
            Fulfillment::ShortOfCapacity(shortfall) => {
                // Intentional terminal state, not a rollback: operators need
                // the cancelled order to trigger the refund workflow.
                ledger::mark_order_overbooked(&mut tx, order.id).await?;
                tx.commit().await.map_err(FulfillmentError::db)?;

                self.audit
                    .record(
                        AuditEntry::failure(actor, "order.issue", "order", order.id, "capacity_exceeded")
                            .with_transition(OrderStatus::Paid.as_str(), OrderStatus::Cancelled.as_str())
                            .with_detail(serde_json::json!({
                                "ticket_type": shortfall.ticket_type,
                                "requested": shortfall.requested,
                                "available": shortfall.available,
                            })),
                    )
                    .await;
                Err(FulfillmentError::CapacityExceeded {
                    ticket_type: shortfall.ticket_type,
                    requested: shortfall.requested,
                    available: shortfall.available,
                })
            }
        }
    }

    /// Purchaser notification, exposed so the ledger can dispatch it after
    /// its own commit.
    pub(crate) async fn notify_issued(&self, email: &str, order_id: crate::types::OrderId, count: u32) {
        self.notifier
            .tickets_issued(email, order_id, count as usize)
            .await;
    }

    /// Run the capacity gate and create missing instances, inside the
    /// caller's transaction. The order row must already be locked.
    pub(crate) async fn fulfill(
        &self,
        conn: &mut PgConnection,
        order: &Order,
    ) -> Result<Fulfillment> {
        let lines = sqlx::query_as::<_, OrderLine>(
            r"
            SELECT id, order_id, ticket_type_id, quantity, unit_price_cents
            FROM order_lines
            WHERE order_id = $1
            ORDER BY id
            ",
        )
        .bind(order.id)
        .fetch_all(&mut *conn)
        .await
        .map_err(FulfillmentError::db)?;

        if lines.is_empty() {
            return Ok(Fulfillment::Issued { tickets: Vec::new(), created: 0 });
        }

        // Lock every referenced type, ascending, then count under lock.
        let mut type_ids: Vec<TicketTypeId> =
            lines.iter().map(|l| l.ticket_type_id).collect();
        type_ids.sort_unstable();
        type_ids.dedup();

        let mut inventory: HashMap<TicketTypeId, TypeInventory> = HashMap::new();
        for type_id in &type_ids {
            let capacity_total: i32 = sqlx::query_scalar(
                "SELECT capacity_total FROM ticket_types WHERE id = $1 FOR UPDATE",
            )
            .bind(type_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(FulfillmentError::db)?
            .ok_or(FulfillmentError::TicketTypeNotFound)?;

            let issued: i64 = sqlx::query_scalar(
                r"
                SELECT COUNT(*) FROM ticket_instances
                WHERE ticket_type_id = $1 AND status IN ('issued', 'checked_in')
                ",
            )
            .bind(type_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(FulfillmentError::db)?;

            inventory.insert(
                *type_id,
                TypeInventory {
                    capacity_total: u32::try_from(capacity_total).unwrap_or(0),
                    issued: u32::try_from(issued).unwrap_or(u32::MAX),
                },
            );
        }

        let mut existing_per_line: HashMap<crate::types::OrderLineId, Vec<TicketInstance>> =
            HashMap::new();
        let mut requests = Vec::with_capacity(lines.len());
        for line in &lines {
            let existing = sqlx::query_as::<_, TicketInstance>(
                r"
                SELECT id, ticket_type_id, order_id, order_line_id, line_seq,
                       owner_user_id, owner_email, owner_name, token_hash, status,
                       checked_in_at, checked_in_by, created_at, updated_at
                FROM ticket_instances
                WHERE order_line_id = $1
                ORDER BY line_seq
                ",
            )
            .bind(line.id)
            .fetch_all(&mut *conn)
            .await
            .map_err(FulfillmentError::db)?;

            requests.push(LineRequest {
                line_id: line.id,
                ticket_type_id: line.ticket_type_id,
                quantity: u32::try_from(line.quantity).unwrap_or(0),
                already_issued: u32::try_from(existing.len()).unwrap_or(u32::MAX),
            });
            existing_per_line.insert(line.id, existing);
        }

        let plans = match plan_issuance(&requests, &inventory) {
            Ok(plans) => plans,
            Err(shortfall) => return Ok(Fulfillment::ShortOfCapacity(shortfall)),
        };

        let mut tickets = Vec::new();
        let mut created: u32 = 0;
        for plan in plans {
            let mut line_tickets: Vec<IssuedTicket> = existing_per_line
                .remove(&plan.line_id)
                .unwrap_or_default()
                .into_iter()
                .map(|ticket| IssuedTicket { ticket, raw_token: None })
                .collect();

            for seq in plan.first_seq..plan.first_seq + plan.create {
                let raw = TokenCrypto::generate();
                let hash = TokenCrypto::hash(raw.expose());
                let ticket = sqlx::query_as::<_, TicketInstance>(
                    r"
                    INSERT INTO ticket_instances
                        (id, ticket_type_id, order_id, order_line_id, line_seq,
                         owner_user_id, owner_email, owner_name, token_hash, status)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'issued')
                    RETURNING id, ticket_type_id, order_id, order_line_id, line_seq,
                              owner_user_id, owner_email, owner_name, token_hash, status,
                              checked_in_at, checked_in_by, created_at, updated_at
                    ",
                )
                .bind(TicketId::new())
                .bind(plan.ticket_type_id)
                .bind(order.id)
                .bind(plan.line_id)
                .bind(i32::try_from(seq).unwrap_or(i32::MAX))
                .bind(order.purchaser_user_id)
                .bind(&order.purchaser_email)
                .bind(&order.purchaser_name)
                .bind(hash.as_str())
                .fetch_one(&mut *conn)
                .await
                .map_err(FulfillmentError::db)?;

                created += 1;
                line_tickets.push(IssuedTicket { ticket, raw_token: Some(raw) });
            }
            tickets.extend(line_tickets);
        }

        Ok(Fulfillment::Issued { tickets, created })
    }
}
