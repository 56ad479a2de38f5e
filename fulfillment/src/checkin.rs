//! Door check-in: token validation, rate limiting, status flips, PII masking.
//!
//! The scan path deliberately trades a retryable miss for bounded latency:
//! the ticket row is taken with `FOR UPDATE SKIP LOCKED`, so near-simultaneous
//! scans of the same ticket fail fast instead of queueing behind each other.
//! At most one concurrent scan of a given ticket can succeed.
//!
//! Every attempt, successful or not, is appended to `scan_records`. That log
//! doubles as the rate limiter: per-actor and per-device counts are derived
//! from the trailing window on read, so they stay correct under arbitrary
//! concurrency without extra shared mutable state.

use crate::actor::{authorize, Actor, Permission};
use crate::audit::{AuditEntry, AuditTrail};
use crate::config::PiiDisclosure;
use crate::error::{FulfillmentError, Result};
use crate::masking::{disclose_email, disclose_name, effective_disclosure};
use crate::providers::{CheckinSettings, EventRegistry};
use crate::token::TokenCrypto;
use crate::types::{
    EventId, ScanOutcome, TicketId, TicketInstance, TicketStatus, UserId,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

/// Client-supplied context of a scan attempt.
#[derive(Debug, Clone, Default)]
pub struct ScanContext {
    /// Scanning device identifier.
    pub device_id: Option<String>,
    /// Client IP.
    pub ip: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
}

/// A ticket as shown to the scanning operator, PII already disclosed at the
/// configured level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedTicket {
    /// Ticket id.
    pub ticket_id: TicketId,
    /// Ticket type display name.
    pub ticket_type: String,
    /// Status after the scan resolved.
    pub status: TicketStatus,
    /// Holder name, per disclosure level.
    pub attendee_name: Option<String>,
    /// Holder email, per disclosure level.
    pub attendee_email: Option<String>,
    /// When the ticket was (first) checked in, if it was.
    pub checked_in_at: Option<DateTime<Utc>>,
}

/// Result of one scan attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResponse {
    /// Classification of the attempt.
    pub result: ScanOutcome,
    /// Ticket context for the operator, present when a ticket of this event
    /// matched the token.
    pub ticket: Option<ScannedTicket>,
}

/// Per-outcome scan counts for an event, derived from the scan log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Successful check-ins.
    pub valid: i64,
    /// Re-scans of already-used tickets.
    pub already_used: i64,
    /// Scans of voided tickets.
    pub cancelled: i64,
    /// Tickets of other events.
    pub not_in_event: i64,
    /// Short-circuited by the rate limiter.
    pub rate_limit_exceeded: i64,
    /// Unknown tokens.
    pub invalid: i64,
    /// Lost lock races.
    pub contended: i64,
    /// Permanent check-in facts (survives undo).
    pub checked_in_total: i64,
}

/// How a ticket's current status classifies a scan. Pure; the engine applies
/// the matching mutation.
#[must_use]
pub const fn classify(status: TicketStatus) -> ScanOutcome {
    match status {
        TicketStatus::Issued => ScanOutcome::Valid,
        TicketStatus::CheckedIn => ScanOutcome::AlreadyUsed,
        TicketStatus::Void => ScanOutcome::Cancelled,
    }
}

/// Check-in engine.
#[derive(Debug, Clone)]
pub struct CheckinService<S, R> {
    pool: PgPool,
    audit: AuditTrail,
    settings: S,
    registry: R,
}

async fn record_scan<'e, E>(
    executor: E,
    event_id: EventId,
    ticket_id: Option<TicketId>,
    actor: &Actor,
    ctx: &ScanContext,
    outcome: ScanOutcome,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r"
        INSERT INTO scan_records
            (id, event_id, ticket_id, actor_user_id, device_id, ip, user_agent, outcome)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ",
    )
    .bind(Uuid::new_v4())
    .bind(event_id)
    .bind(ticket_id)
    .bind(actor.user_id)
    .bind(&ctx.device_id)
    .bind(&ctx.ip)
    .bind(&ctx.user_agent)
    .bind(outcome)
    .execute(executor)
    .await
    .map_err(FulfillmentError::db)?;
    Ok(())
}

impl<S: CheckinSettings, R: EventRegistry> CheckinService<S, R> {
    /// Create a check-in service.
    pub const fn new(pool: PgPool, audit: AuditTrail, settings: S, registry: R) -> Self {
        Self { pool, audit, settings, registry }
    }

    /// Validate a scanned token against an event.
    ///
    /// Classification: `issued` → flip to `checked_in`, VALID; `checked_in` →
    /// ALREADY_USED; `void` → CANCELLED; unknown token → INVALID; another
    /// event's ticket → NOT_IN_EVENT. The rate limiter runs before any ticket
    /// lookup and short-circuits to RATE_LIMIT_EXCEEDED.
    ///
    /// # Errors
    ///
    /// - [`FulfillmentError::EventNotFound`] for an unknown event
    /// - [`FulfillmentError::Contended`] when a concurrent scan holds the
    ///   ticket row; recorded as a scan attempt only, safe to retry
    pub async fn scan(
        &self,
        actor: &Actor,
        event_id: EventId,
        raw_token: &str,
        ctx: &ScanContext,
    ) -> Result<ScanResponse> {
        authorize(actor, Permission::ScanTickets)?;

        let event = self
            .registry
            .event(event_id)
            .await?
            .ok_or(FulfillmentError::EventNotFound)?;
        let policy = self.settings.policy(event_id).await?;

        if self.rate_limited(actor, ctx, &policy).await? {
            record_scan(&self.pool, event_id, None, actor, ctx, ScanOutcome::RateLimitExceeded)
                .await?;
            tracing::warn!(
                rate_limit_exceeded = true,
                actor = %actor.label(),
                device_id = ctx.device_id.as_deref().unwrap_or("-"),
                event = %event.name,
                "scan rate limit exceeded"
            );
            self.audit
                .record(AuditEntry::failure(
                    actor,
                    "ticket.scan",
                    "event",
                    event_id,
                    "rate_limit_exceeded",
                ))
                .await;
            return Ok(ScanResponse { result: ScanOutcome::RateLimitExceeded, ticket: None });
        }

        let hash = TokenCrypto::hash(raw_token);
        let mut tx = self.pool.begin().await.map_err(FulfillmentError::db)?;

        // Skip rows a concurrent scan already holds: the loser fails fast
        // instead of queueing behind the door rush.
        let locked = sqlx::query_as::<_, TicketInstance>(
            r"
            SELECT id, ticket_type_id, order_id, order_line_id, line_seq,
                   owner_user_id, owner_email, owner_name, token_hash, status,
                   checked_in_at, checked_in_by, created_at, updated_at
            FROM ticket_instances
            WHERE token_hash = $1
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(hash.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(FulfillmentError::db)?;

        let Some(ticket) = locked else {
            let _ = tx.rollback().await;
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM ticket_instances WHERE token_hash = $1)",
            )
            .bind(hash.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(FulfillmentError::db)?;

            if exists {
                record_scan(&self.pool, event_id, None, actor, ctx, ScanOutcome::Contended)
                    .await?;
                return Err(FulfillmentError::Contended);
            }

            record_scan(&self.pool, event_id, None, actor, ctx, ScanOutcome::Invalid).await?;
            self.audit
                .record(AuditEntry::failure(actor, "ticket.scan", "event", event_id, "invalid_token"))
                .await;
            return Ok(ScanResponse { result: ScanOutcome::Invalid, ticket: None });
        };

        let (ticket_event, type_name): (EventId, String) =
            sqlx::query_as("SELECT event_id, name FROM ticket_types WHERE id = $1")
                .bind(ticket.ticket_type_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(FulfillmentError::db)?;

        if ticket_event != event_id {
            let _ = tx.rollback().await;
            record_scan(&self.pool, event_id, Some(ticket.id), actor, ctx, ScanOutcome::NotInEvent)
                .await?;
            self.audit
                .record(AuditEntry::failure(
                    actor,
                    "ticket.scan",
                    "ticket",
                    ticket.id,
                    "not_in_event",
                ))
                .await;
            return Ok(ScanResponse { result: ScanOutcome::NotInEvent, ticket: None });
        }

        let disclosure = effective_disclosure(policy.pii_disclosure, actor);
        let outcome = classify(ticket.status);
        match outcome {
            ScanOutcome::Valid => {
                let checked_in_at: DateTime<Utc> = sqlx::query_scalar(
                    r"
                    UPDATE ticket_instances
                    SET status = 'checked_in', checked_in_at = now(), checked_in_by = $2,
                        updated_at = now()
                    WHERE id = $1
                    RETURNING checked_in_at
                    ",
                )
                .bind(ticket.id)
                .bind(actor.user_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(FulfillmentError::db)?;

                // Permanent fact; a ticket that was undone and re-scanned
                // keeps its original row.
                sqlx::query(
                    r"
                    INSERT INTO checkin_records (id, ticket_id, event_id, checked_in_by, device_id)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (ticket_id) DO NOTHING
                    ",
                )
                .bind(Uuid::new_v4())
                .bind(ticket.id)
                .bind(event_id)
                .bind(actor.user_id)
                .bind(&ctx.device_id)
                .execute(&mut *tx)
                .await
                .map_err(FulfillmentError::db)?;

                record_scan(&mut *tx, event_id, Some(ticket.id), actor, ctx, ScanOutcome::Valid)
                    .await?;
                tx.commit().await.map_err(FulfillmentError::db)?;

                tracing::info!(ticket_id = %ticket.id, event = %event.name, "ticket checked in");
                self.audit
                    .record(
                        AuditEntry::success(actor, "ticket.scan", "ticket", ticket.id)
                            .with_transition(
                                TicketStatus::Issued.as_str(),
                                TicketStatus::CheckedIn.as_str(),
                            ),
                    )
                    .await;

                Ok(ScanResponse {
                    result: ScanOutcome::Valid,
                    ticket: Some(summarize(
                        &ticket,
                        &type_name,
                        TicketStatus::CheckedIn,
                        Some(checked_in_at),
                        disclosure,
                    )),
                })
            }
            ScanOutcome::AlreadyUsed | ScanOutcome::Cancelled => {
                record_scan(&mut *tx, event_id, Some(ticket.id), actor, ctx, outcome).await?;
                tx.commit().await.map_err(FulfillmentError::db)?;

                self.audit
                    .record(
                        AuditEntry::failure(actor, "ticket.scan", "ticket", ticket.id, outcome.as_str())
                            .with_transition(ticket.status.as_str(), ticket.status.as_str()),
                    )
                    .await;

                Ok(ScanResponse {
                    result: outcome,
                    ticket: Some(summarize(
                        &ticket,
                        &type_name,
                        ticket.status,
                        ticket.checked_in_at,
                        disclosure,
                    )),
                })
            }
            // classify() never yields the remaining outcomes.
            _ => Err(FulfillmentError::DatabaseError("unreachable scan outcome".to_string())),
        }
    }

    /// Void an issued ticket.
    ///
    /// # Errors
    ///
    /// Returns [`FulfillmentError::TicketStateConflict`] unless the ticket is
    /// `issued`.
    pub async fn void_ticket(&self, actor: &Actor, ticket_id: TicketId) -> Result<()> {
        authorize(actor, Permission::ManageTickets)?;

        let mut tx = self.pool.begin().await.map_err(FulfillmentError::db)?;
        let ticket = crate::transfer::lock_ticket(&mut tx, ticket_id).await?;

        if ticket.status != TicketStatus::Issued {
            let _ = tx.rollback().await;
            self.audit
                .record(
                    AuditEntry::failure(actor, "ticket.void", "ticket", ticket_id, "ticket_not_issued")
                        .with_transition(ticket.status.as_str(), ticket.status.as_str()),
                )
                .await;
            return Err(FulfillmentError::TicketStateConflict {
                ticket: ticket_id,
                status: ticket.status.to_string(),
                attempted: "void".to_string(),
            });
        }

        sqlx::query(
            "UPDATE ticket_instances SET status = 'void', updated_at = now() WHERE id = $1",
        )
        .bind(ticket_id)
        .execute(&mut *tx)
        .await
        .map_err(FulfillmentError::db)?;
        tx.commit().await.map_err(FulfillmentError::db)?;

        tracing::info!(ticket_id = %ticket_id, "ticket voided");
        self.audit
            .record(
                AuditEntry::success(actor, "ticket.void", "ticket", ticket_id)
                    .with_transition(TicketStatus::Issued.as_str(), TicketStatus::Void.as_str()),
            )
            .await;
        Ok(())
    }

    /// Undo a check-in, returning the ticket to `issued`.
    ///
    /// Forward-logged like every other transition; the `checkin_records` fact
    /// and the scan log keep the original check-in visible forever.
    ///
    /// # Errors
    ///
    /// - [`FulfillmentError::UndoNotAllowed`] when the event's policy forbids it
    /// - [`FulfillmentError::TicketStateConflict`] unless the ticket is
    ///   `checked_in`
    pub async fn undo_checkin(&self, actor: &Actor, ticket_id: TicketId) -> Result<()> {
        authorize(actor, Permission::ManageTickets)?;

        // Resolve the event (for its policy) before taking any lock.
        let event_id: EventId = sqlx::query_scalar(
            r"
            SELECT tt.event_id
            FROM ticket_instances ti
            JOIN ticket_types tt ON tt.id = ti.ticket_type_id
            WHERE ti.id = $1
            ",
        )
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(FulfillmentError::db)?
        .ok_or(FulfillmentError::TicketNotFound)?;

        let policy = self.settings.policy(event_id).await?;
        if !policy.allow_undo {
            self.audit
                .record(AuditEntry::failure(
                    actor,
                    "ticket.undo_checkin",
                    "ticket",
                    ticket_id,
                    "undo_not_allowed",
                ))
                .await;
            return Err(FulfillmentError::UndoNotAllowed);
        }

        let mut tx = self.pool.begin().await.map_err(FulfillmentError::db)?;
        let ticket = crate::transfer::lock_ticket(&mut tx, ticket_id).await?;

        if ticket.status != TicketStatus::CheckedIn {
            let _ = tx.rollback().await;
            self.audit
                .record(
                    AuditEntry::failure(actor, "ticket.undo_checkin", "ticket", ticket_id, "not_checked_in")
                        .with_transition(ticket.status.as_str(), ticket.status.as_str()),
                )
                .await;
            return Err(FulfillmentError::TicketStateConflict {
                ticket: ticket_id,
                status: ticket.status.to_string(),
                attempted: "undo_checkin".to_string(),
            });
        }

        sqlx::query(
            r"
            UPDATE ticket_instances
            SET status = 'issued', checked_in_at = NULL, checked_in_by = NULL, updated_at = now()
            WHERE id = $1
            ",
        )
        .bind(ticket_id)
        .execute(&mut *tx)
        .await
        .map_err(FulfillmentError::db)?;
        tx.commit().await.map_err(FulfillmentError::db)?;

        tracing::info!(ticket_id = %ticket_id, "check-in undone");
        self.audit
            .record(
                AuditEntry::success(actor, "ticket.undo_checkin", "ticket", ticket_id)
                    .with_transition(TicketStatus::CheckedIn.as_str(), TicketStatus::Issued.as_str()),
            )
            .await;
        Ok(())
    }

    /// Per-outcome scan statistics for an event. Pure read; not audited.
    ///
    /// # Errors
    ///
    /// Returns error if the queries fail.
    pub async fn event_stats(&self, event_id: EventId) -> Result<ScanStats> {
        let rows: Vec<(ScanOutcome, i64)> = sqlx::query_as(
            "SELECT outcome, COUNT(*) FROM scan_records WHERE event_id = $1 GROUP BY outcome",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(FulfillmentError::db)?;

        let mut stats = ScanStats::default();
        for (outcome, count) in rows {
            match outcome {
                ScanOutcome::Valid => stats.valid = count,
                ScanOutcome::AlreadyUsed => stats.already_used = count,
                ScanOutcome::Cancelled => stats.cancelled = count,
                ScanOutcome::NotInEvent => stats.not_in_event = count,
                ScanOutcome::RateLimitExceeded => stats.rate_limit_exceeded = count,
                ScanOutcome::Invalid => stats.invalid = count,
                ScanOutcome::Contended => stats.contended = count,
            }
        }

        stats.checked_in_total =
            sqlx::query_scalar("SELECT COUNT(*) FROM checkin_records WHERE event_id = $1")
                .bind(event_id)
                .fetch_one(&self.pool)
                .await
                .map_err(FulfillmentError::db)?;

        Ok(stats)
    }

    /// Trailing-window counts, derived from the scan log before any ticket
    /// lookup happens.
    async fn rate_limited(
        &self,
        actor: &Actor,
        ctx: &ScanContext,
        policy: &crate::providers::CheckinPolicy,
    ) -> Result<bool> {
        let window = Duration::seconds(
            i64::try_from(policy.rate_limit_window_secs).unwrap_or(60),
        );
        let window_start = Utc::now() - window;
        let threshold = i64::from(policy.max_scans_per_window);

        if let Some(user_id) = actor.user_id {
            let count = count_scans_by_actor(&self.pool, user_id, window_start).await?;
            if count >= threshold {
                return Ok(true);
            }
        }
        if let Some(device_id) = &ctx.device_id {
            let count = count_scans_by_device(&self.pool, device_id, window_start).await?;
            if count >= threshold {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

async fn count_scans_by_actor(
    pool: &PgPool,
    user_id: UserId,
    window_start: DateTime<Utc>,
) -> Result<i64> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM scan_records WHERE actor_user_id = $1 AND scanned_at > $2",
    )
    .bind(user_id)
    .bind(window_start)
    .fetch_one(pool)
    .await
    .map_err(FulfillmentError::db)
}

async fn count_scans_by_device(
    pool: &PgPool,
    device_id: &str,
    window_start: DateTime<Utc>,
) -> Result<i64> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM scan_records WHERE device_id = $1 AND scanned_at > $2",
    )
    .bind(device_id)
    .bind(window_start)
    .fetch_one(pool)
    .await
    .map_err(FulfillmentError::db)
}

fn summarize(
    ticket: &TicketInstance,
    type_name: &str,
    status: TicketStatus,
    checked_in_at: Option<DateTime<Utc>>,
    disclosure: PiiDisclosure,
) -> ScannedTicket {
    ScannedTicket {
        ticket_id: ticket.id,
        ticket_type: type_name.to_string(),
        status,
        attendee_name: disclose_name(&ticket.owner_name, disclosure),
        attendee_email: disclose_email(&ticket.owner_email, disclosure),
        checked_in_at,
    }
}
