//! Ticket-ownership transfers.
//!
//! A transfer is offered by the current holder (or a privileged operator),
//! carries a capability token, and resolves exactly once: `pending →
//! accepted | rejected | cancelled | expired`, all terminal. Concurrent
//! accepts serialize on the transfer row lock; the loser observes `accepted`
//! and gets the idempotent no-op success. "At most one pending transfer per
//! ticket" is structural: a partial unique index on the pending status.
//!
//! Identity-directory lookups happen before the transaction opens; no lock
//! is ever held across a network round trip.

use crate::actor::{authorize, Actor, Permission};
use crate::audit::{AuditEntry, AuditTrail};
use crate::error::{FulfillmentError, Result};
use crate::providers::{IdentityDirectory, Notifier, UserRef};
use crate::token::{RawToken, TokenCrypto};
use crate::types::{
    OwnerIdentity, TicketId, TicketInstance, TicketStatus, Transfer, TransferId, TransferStatus,
    UserId,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool};

/// A freshly initiated transfer offer.
#[derive(Debug)]
pub struct TransferOffer {
    /// Transfer id.
    pub transfer_id: TransferId,
    /// Acceptance token; exists nowhere else, deliver it to the recipient.
    pub raw_token: RawToken,
    /// Acceptance deadline.
    pub expires_at: DateTime<Utc>,
}

/// Result of a (possibly replayed) acceptance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferAcceptance {
    /// The identity the ticket is now held under.
    pub new_owner: OwnerIdentity,
}

/// Transfer state machine engine.
#[derive(Debug, Clone)]
pub struct TransferManager<I, N> {
    pool: PgPool,
    audit: AuditTrail,
    identity: I,
    notifier: N,
}

/// Deterministic recipient resolution for acceptance.
///
/// Precedence, first hit wins:
/// 1. the account linked at initiation time (`transfers.to_user_id`),
/// 2. the authenticated accepting actor,
/// 3. the identity-directory match for the recipient email,
/// 4. the recipient email itself, unlinked.
fn resolve_recipient(
    linked_user: Option<UserId>,
    linked_name: Option<&str>,
    actor: &Actor,
    directory_match: Option<&UserRef>,
    to_email: &str,
) -> OwnerIdentity {
    if let Some(user_id) = linked_user {
        return OwnerIdentity {
            user_id: Some(user_id),
            email: to_email.to_string(),
            name: linked_name.unwrap_or(to_email).to_string(),
        };
    }
    if let Some(user_id) = actor.user_id {
        return OwnerIdentity {
            user_id: Some(user_id),
            email: actor.email.clone().unwrap_or_else(|| to_email.to_string()),
            name: directory_match.map_or_else(|| to_email.to_string(), |u| u.name.clone()),
        };
    }
    if let Some(user) = directory_match {
        return OwnerIdentity {
            user_id: Some(user.user_id),
            email: user.email.clone(),
            name: user.name.clone(),
        };
    }
    OwnerIdentity {
        user_id: None,
        email: to_email.to_string(),
        name: to_email.to_string(),
    }
}

fn validate_email(email: &str) -> Result<()> {
    let well_formed = email.len() >= 3
        && email.len() <= 255
        && email.split('@').count() == 2
        && email.split('@').all(|part| !part.is_empty());
    if well_formed {
        Ok(())
    } else {
        Err(FulfillmentError::InvalidInput { reason: format!("malformed email: {email}") })
    }
}

async fn lock_transfer(conn: &mut PgConnection, transfer_id: TransferId) -> Result<Transfer> {
    sqlx::query_as::<_, Transfer>(
        r"
        SELECT id, ticket_id, from_user_id, from_email, to_user_id, to_email,
               token_hash, status, expires_at, created_at, resolved_at, resolved_by
        FROM transfers
        WHERE id = $1
        FOR UPDATE
        ",
    )
    .bind(transfer_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(FulfillmentError::db)?
    .ok_or(FulfillmentError::TransferNotFound)
}

pub(crate) async fn lock_ticket(
    conn: &mut PgConnection,
    ticket_id: TicketId,
) -> Result<TicketInstance> {
    sqlx::query_as::<_, TicketInstance>(
        r"
        SELECT id, ticket_type_id, order_id, order_line_id, line_seq,
               owner_user_id, owner_email, owner_name, token_hash, status,
               checked_in_at, checked_in_by, created_at, updated_at
        FROM ticket_instances
        WHERE id = $1
        FOR UPDATE
        ",
    )
    .bind(ticket_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(FulfillmentError::db)?
    .ok_or(FulfillmentError::TicketNotFound)
}

async fn resolve_transfer(
    conn: &mut PgConnection,
    transfer_id: TransferId,
    to: TransferStatus,
    actor: &Actor,
) -> Result<()> {
    sqlx::query(
        r"
        UPDATE transfers
        SET status = $2, resolved_at = now(), resolved_by = $3
        WHERE id = $1
        ",
    )
    .bind(transfer_id)
    .bind(to)
    .bind(actor.user_id)
    .execute(&mut *conn)
    .await
    .map_err(FulfillmentError::db)?;
    Ok(())
}

impl<I: IdentityDirectory, N: Notifier> TransferManager<I, N> {
    /// Create a transfer manager.
    pub const fn new(pool: PgPool, audit: AuditTrail, identity: I, notifier: N) -> Self {
        Self { pool, audit, identity, notifier }
    }

    /// Offer a ticket to `to_email`, valid for `ttl`.
    ///
    /// The initiator must hold the ticket or a privileged (non-financial)
    /// role. The ticket must be `issued` and free of pending transfers.
    ///
    /// # Errors
    ///
    /// - [`FulfillmentError::InvalidInput`] for a malformed email or
    ///   non-positive ttl
    /// - [`FulfillmentError::TicketStateConflict`] unless the ticket is `issued`
    /// - [`FulfillmentError::TransferAlreadyPending`] when an open offer exists
    pub async fn initiate(
        &self,
        actor: &Actor,
        ticket_id: TicketId,
        to_email: &str,
        ttl: Duration,
    ) -> Result<TransferOffer> {
        validate_email(to_email)?;
        if ttl <= Duration::zero() {
            return Err(FulfillmentError::InvalidInput {
                reason: "ttl must be positive".to_string(),
            });
        }

        // Recipient account resolution happens before any row is locked.
        let linked = self.identity.user_by_email(to_email).await?;

        let mut tx = self.pool.begin().await.map_err(FulfillmentError::db)?;
        let ticket = lock_ticket(&mut tx, ticket_id).await?;

        let owns = actor.user_id.is_some() && actor.user_id == ticket.owner_user_id
            || actor
                .email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(&ticket.owner_email));
        if !owns {
            if let Err(e) = authorize(actor, Permission::TransferAnyTicket) {
                let _ = tx.rollback().await;
                self.audit
                    .record(AuditEntry::failure(
                        actor,
                        "transfer.initiate",
                        "ticket",
                        ticket_id,
                        "not_owner",
                    ))
                    .await;
                return Err(e);
            }
        }

        if ticket.status != TicketStatus::Issued {
            let _ = tx.rollback().await;
            self.audit
                .record(
                    AuditEntry::failure(
                        actor,
                        "transfer.initiate",
                        "ticket",
                        ticket_id,
                        "ticket_not_issued",
                    )
                    .with_transition(ticket.status.as_str(), ticket.status.as_str()),
                )
                .await;
            return Err(FulfillmentError::TicketStateConflict {
                ticket: ticket_id,
                status: ticket.status.to_string(),
                attempted: "transfer".to_string(),
            });
        }

        let pending_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM transfers WHERE ticket_id = $1 AND status = 'pending')",
        )
        .bind(ticket_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(FulfillmentError::db)?;
        if pending_exists {
            let _ = tx.rollback().await;
            return Err(FulfillmentError::TransferAlreadyPending { ticket: ticket_id });
        }

        let transfer_id = TransferId::new();
        let raw_token = TokenCrypto::generate();
        let expires_at = Utc::now() + ttl;
        let insert = sqlx::query(
            r"
            INSERT INTO transfers
                (id, ticket_id, from_user_id, from_email, to_user_id, to_email,
                 token_hash, status, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8)
            ",
        )
        .bind(transfer_id)
        .bind(ticket_id)
        .bind(ticket.owner_user_id)
        .bind(&ticket.owner_email)
        .bind(linked.as_ref().map(|u| u.user_id))
        .bind(to_email)
        .bind(TokenCrypto::hash(raw_token.expose()).as_str())
        .bind(expires_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            // The partial unique index is the authoritative guard against a
            // racing initiation that slipped past the pre-check.
            let _ = tx.rollback().await;
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.is_unique_violation() {
                    return Err(FulfillmentError::TransferAlreadyPending { ticket: ticket_id });
                }
            }
            return Err(FulfillmentError::db(e));
        }

        tx.commit().await.map_err(FulfillmentError::db)?;

        tracing::info!(
            transfer_id = %transfer_id,
            ticket_id = %ticket_id,
            expires_at = %expires_at,
            "transfer initiated"
        );
        self.audit
            .record(
                AuditEntry::success(actor, "transfer.initiate", "transfer", transfer_id)
                    .with_transition("", TransferStatus::Pending.as_str())
                    .with_detail(serde_json::json!({ "ticket_id": ticket_id })),
            )
            .await;
        self.notifier
            .transfer_offer(to_email, transfer_id, &raw_token, expires_at)
            .await;

        Ok(TransferOffer { transfer_id, raw_token, expires_at })
    }

    /// Accept a pending transfer with its capability token.
    ///
    /// Re-accepting an already-accepted transfer is a no-op success. An
    /// overdue transfer is marked expired on the spot and reported as such.
    ///
    /// # Errors
    ///
    /// - [`FulfillmentError::InvalidToken`] on a digest mismatch; the
    ///   transfer stays `pending`
    /// - [`FulfillmentError::TransferExpired`] past the deadline
    /// - [`FulfillmentError::TransferNotPending`] out of `rejected`,
    ///   `cancelled` or `expired`
    pub async fn accept(
        &self,
        actor: &Actor,
        transfer_id: TransferId,
        raw_token: &str,
    ) -> Result<TransferAcceptance> {
        // Peek without a lock to learn the recipient email, then resolve the
        // directory match before the transaction opens.
        let peeked_email: Option<String> =
            sqlx::query_scalar("SELECT to_email FROM transfers WHERE id = $1")
                .bind(transfer_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(FulfillmentError::db)?;
        let to_email = peeked_email.ok_or(FulfillmentError::TransferNotFound)?;
        let directory_match = self.identity.user_by_email(&to_email).await?;

        let mut tx = self.pool.begin().await.map_err(FulfillmentError::db)?;
        let transfer = lock_transfer(&mut tx, transfer_id).await?;

        if !TokenCrypto::verify(raw_token, &crate::token::TokenHash::from_stored(transfer.token_hash.clone())) {
            let _ = tx.rollback().await;
            self.audit
                .record(AuditEntry::failure(
                    actor,
                    "transfer.accept",
                    "transfer",
                    transfer_id,
                    "invalid_token",
                ))
                .await;
            return Err(FulfillmentError::InvalidToken);
        }

        match transfer.status {
            TransferStatus::Accepted => {
                // Idempotent replay: report the ownership change that already
                // happened.
                let ticket = lock_ticket(&mut tx, transfer.ticket_id).await?;
                let _ = tx.rollback().await;
                Ok(TransferAcceptance {
                    new_owner: OwnerIdentity {
                        user_id: ticket.owner_user_id,
                        email: ticket.owner_email,
                        name: ticket.owner_name,
                    },
                })
            }
            TransferStatus::Rejected | TransferStatus::Cancelled | TransferStatus::Expired => {
                let _ = tx.rollback().await;
                self.audit
                    .record(
                        AuditEntry::failure(
                            actor,
                            "transfer.accept",
                            "transfer",
                            transfer_id,
                            "transfer_not_pending",
                        )
                        .with_transition(transfer.status.as_str(), transfer.status.as_str()),
                    )
                    .await;
                Err(FulfillmentError::TransferNotPending {
                    transfer: transfer_id,
                    status: transfer.status.to_string(),
                })
            }
            TransferStatus::Pending => {
                if Utc::now() >= transfer.expires_at {
                    resolve_transfer(&mut tx, transfer_id, TransferStatus::Expired, actor).await?;
                    tx.commit().await.map_err(FulfillmentError::db)?;
                    self.audit
                        .record(
                            AuditEntry::failure(
                                actor,
                                "transfer.accept",
                                "transfer",
                                transfer_id,
                                "expired",
                            )
                            .with_transition(
                                TransferStatus::Pending.as_str(),
                                TransferStatus::Expired.as_str(),
                            ),
                        )
                        .await;
                    return Err(FulfillmentError::TransferExpired { transfer: transfer_id });
                }

                let ticket = lock_ticket(&mut tx, transfer.ticket_id).await?;
                if ticket.status != TicketStatus::Issued {
                    let _ = tx.rollback().await;
                    return Err(FulfillmentError::TicketStateConflict {
                        ticket: ticket.id,
                        status: ticket.status.to_string(),
                        attempted: "transfer".to_string(),
                    });
                }

                let new_owner = resolve_recipient(
                    transfer.to_user_id,
                    directory_match.as_ref().map(|u| u.name.as_str()),
                    actor,
                    directory_match.as_ref(),
                    &transfer.to_email,
                );

                sqlx::query(
                    r"
                    UPDATE ticket_instances
                    SET owner_user_id = $2, owner_email = $3, owner_name = $4, updated_at = now()
                    WHERE id = $1
                    ",
                )
                .bind(ticket.id)
                .bind(new_owner.user_id)
                .bind(&new_owner.email)
                .bind(&new_owner.name)
                .execute(&mut *tx)
                .await
                .map_err(FulfillmentError::db)?;

                sqlx::query(
                    r"
                    UPDATE transfers
                    SET status = 'accepted', to_user_id = $2, resolved_at = now(), resolved_by = $3
                    WHERE id = $1
                    ",
                )
                .bind(transfer_id)
                .bind(new_owner.user_id)
                .bind(actor.user_id)
                .execute(&mut *tx)
                .await
                .map_err(FulfillmentError::db)?;

                tx.commit().await.map_err(FulfillmentError::db)?;

                tracing::info!(
                    transfer_id = %transfer_id,
                    ticket_id = %ticket.id,
                    "transfer accepted"
                );
                self.audit
                    .record(
                        AuditEntry::success(actor, "transfer.accept", "transfer", transfer_id)
                            .with_transition(
                                TransferStatus::Pending.as_str(),
                                TransferStatus::Accepted.as_str(),
                            )
                            .with_detail(serde_json::json!({ "ticket_id": ticket.id })),
                    )
                    .await;

                Ok(TransferAcceptance { new_owner })
            }
        }
    }

    /// Decline a pending transfer with its capability token.
    ///
    /// # Errors
    ///
    /// Mirrors [`TransferManager::accept`]: invalid token, expired, or not
    /// pending.
    pub async fn reject(
        &self,
        actor: &Actor,
        transfer_id: TransferId,
        raw_token: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(FulfillmentError::db)?;
        let transfer = lock_transfer(&mut tx, transfer_id).await?;

        if !TokenCrypto::verify(raw_token, &crate::token::TokenHash::from_stored(transfer.token_hash.clone())) {
            let _ = tx.rollback().await;
            self.audit
                .record(AuditEntry::failure(
                    actor,
                    "transfer.reject",
                    "transfer",
                    transfer_id,
                    "invalid_token",
                ))
                .await;
            return Err(FulfillmentError::InvalidToken);
        }

        self.resolve_pending(tx, actor, &transfer, TransferStatus::Rejected, "transfer.reject")
            .await
    }

    /// Withdraw a pending transfer. Restricted to the sender or a privileged
    /// role; no token required.
    ///
    /// # Errors
    ///
    /// - [`FulfillmentError::InsufficientPermissions`] for strangers
    /// - [`FulfillmentError::TransferNotPending`] out of a terminal state
    pub async fn cancel(&self, actor: &Actor, transfer_id: TransferId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(FulfillmentError::db)?;
        let transfer = lock_transfer(&mut tx, transfer_id).await?;

        let is_sender = actor.user_id.is_some() && actor.user_id == transfer.from_user_id
            || actor
                .email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(&transfer.from_email));
        if !is_sender {
            if let Err(e) = authorize(actor, Permission::TransferAnyTicket) {
                let _ = tx.rollback().await;
                self.audit
                    .record(AuditEntry::failure(
                        actor,
                        "transfer.cancel",
                        "transfer",
                        transfer_id,
                        "not_sender",
                    ))
                    .await;
                return Err(e);
            }
        }

        self.resolve_pending(tx, actor, &transfer, TransferStatus::Cancelled, "transfer.cancel")
            .await
    }

    /// Mark every overdue pending transfer expired. Maintenance sweep; the
    /// lazy path in `accept`/`reject` performs the same transition one row
    /// at a time.
    ///
    /// # Errors
    ///
    /// Returns error if the sweep query fails.
    pub async fn expire_stale(&self, actor: &Actor) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE transfers
            SET status = 'expired', resolved_at = now()
            WHERE status = 'pending' AND expires_at <= now()
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(FulfillmentError::db)?;

        let expired = result.rows_affected();
        if expired > 0 {
            tracing::info!(expired, "expired stale transfers");
            self.audit
                .record(
                    AuditEntry::success(actor, "transfer.expire_stale", "transfer", "sweep")
                        .with_transition(
                            TransferStatus::Pending.as_str(),
                            TransferStatus::Expired.as_str(),
                        )
                        .with_detail(serde_json::json!({ "expired": expired })),
                )
                .await;
        }
        Ok(expired)
    }

    /// Shared tail of `reject`/`cancel`: a pending transfer moves to `to`,
    /// with lazy expiry and terminal-state reporting.
    async fn resolve_pending(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        actor: &Actor,
        transfer: &Transfer,
        to: TransferStatus,
        action: &'static str,
    ) -> Result<()> {
        match transfer.status {
            TransferStatus::Pending if Utc::now() >= transfer.expires_at => {
                resolve_transfer(&mut tx, transfer.id, TransferStatus::Expired, actor).await?;
                tx.commit().await.map_err(FulfillmentError::db)?;
                self.audit
                    .record(
                        AuditEntry::failure(actor, action, "transfer", transfer.id, "expired")
                            .with_transition(
                                TransferStatus::Pending.as_str(),
                                TransferStatus::Expired.as_str(),
                            ),
                    )
                    .await;
                Err(FulfillmentError::TransferExpired { transfer: transfer.id })
            }
            TransferStatus::Pending => {
                resolve_transfer(&mut tx, transfer.id, to, actor).await?;
                tx.commit().await.map_err(FulfillmentError::db)?;
                tracing::info!(transfer_id = %transfer.id, to = to.as_str(), "transfer resolved");
                self.audit
                    .record(
                        AuditEntry::success(actor, action, "transfer", transfer.id)
                            .with_transition(TransferStatus::Pending.as_str(), to.as_str()),
                    )
                    .await;
                Ok(())
            }
            terminal => {
                let _ = tx.rollback().await;
                self.audit
                    .record(
                        AuditEntry::failure(actor, action, "transfer", transfer.id, "transfer_not_pending")
                            .with_transition(terminal.as_str(), terminal.as_str()),
                    )
                    .await;
                Err(FulfillmentError::TransferNotPending {
                    transfer: transfer.id,
                    status: terminal.to_string(),
                })
            }
        }
    }
}
