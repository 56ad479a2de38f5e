//! Append-only audit trail.
//!
//! Every mutating attempt, successful or failed, lands here; rows are never
//! updated or deleted. Engines call [`AuditTrail::record`] explicitly after
//! their transaction resolves (post-commit on success, on a fresh connection
//! after rollback on failure), so the write is visible in the control flow
//! rather than hidden in the storage layer.

use crate::actor::Actor;
use crate::types::UserId;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Outcome of the attempt being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    /// The mutation committed.
    Success,
    /// The attempt was rejected or rolled back.
    Failure,
}

impl AuditOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// One attempt, ready to append.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    actor_user_id: Option<UserId>,
    actor_role: String,
    action: &'static str,
    subject_type: &'static str,
    subject_id: String,
    outcome: AuditOutcome,
    reason: Option<String>,
    status_before: Option<String>,
    status_after: Option<String>,
    detail: serde_json::Value,
}

impl AuditEntry {
    /// A successful mutation by `actor` on `subject_type`/`subject_id`.
    #[must_use]
    pub fn success(
        actor: &Actor,
        action: &'static str,
        subject_type: &'static str,
        subject_id: impl ToString,
    ) -> Self {
        Self::new(actor, action, subject_type, subject_id, AuditOutcome::Success, None)
    }

    /// A rejected or rolled-back attempt, with the machine-readable reason.
    #[must_use]
    pub fn failure(
        actor: &Actor,
        action: &'static str,
        subject_type: &'static str,
        subject_id: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            actor,
            action,
            subject_type,
            subject_id,
            AuditOutcome::Failure,
            Some(reason.into()),
        )
    }

    fn new(
        actor: &Actor,
        action: &'static str,
        subject_type: &'static str,
        subject_id: impl ToString,
        outcome: AuditOutcome,
        reason: Option<String>,
    ) -> Self {
        Self {
            actor_user_id: actor.user_id,
            actor_role: actor.role.to_string(),
            action,
            subject_type,
            subject_id: subject_id.to_string(),
            outcome,
            reason,
            status_before: None,
            status_after: None,
            detail: serde_json::Value::Null,
        }
    }

    /// Record the status transition the attempt performed (or would have).
    #[must_use]
    pub fn with_transition(
        mut self,
        before: impl Into<String>,
        after: impl Into<String>,
    ) -> Self {
        self.status_before = Some(before.into());
        self.status_after = Some(after.into());
        self
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// A recorded attempt, as read back.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRow {
    /// Monotonic append position.
    pub id: i64,
    /// Acting account, when authenticated.
    pub actor_user_id: Option<UserId>,
    /// Acting role.
    pub actor_role: String,
    /// Operation name ("payment.apply", "transfer.accept", ...).
    pub action: String,
    /// Kind of row acted on.
    pub subject_type: String,
    /// Id of the row acted on.
    pub subject_id: String,
    /// "success" or "failure".
    pub outcome: String,
    /// Failure reason, when the attempt failed.
    pub reason: Option<String>,
    /// Status before the transition.
    pub status_before: Option<String>,
    /// Status after the transition.
    pub status_after: Option<String>,
    /// When the attempt happened.
    pub occurred_at: DateTime<Utc>,
}

/// Writer (and test-support reader) for the `audit_log` table.
#[derive(Clone)]
pub struct AuditTrail {
    pool: PgPool,
}

impl AuditTrail {
    /// Create an audit trail writing through `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one attempt.
    ///
    /// Best-effort: the mutation this records has already resolved, so a
    /// failing append is logged and swallowed rather than turned into a
    /// misreport of an operation that actually committed.
    pub async fn record(&self, entry: AuditEntry) {
        let result = sqlx::query(
            r"
            INSERT INTO audit_log
                (actor_user_id, actor_role, action, subject_type, subject_id,
                 outcome, reason, status_before, status_after, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(entry.actor_user_id)
        .bind(&entry.actor_role)
        .bind(entry.action)
        .bind(entry.subject_type)
        .bind(&entry.subject_id)
        .bind(entry.outcome.as_str())
        .bind(&entry.reason)
        .bind(&entry.status_before)
        .bind(&entry.status_after)
        .bind(&entry.detail)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(
                action = entry.action,
                subject = %entry.subject_id,
                error = %e,
                "failed to append audit entry"
            );
        }
    }

    /// Entries for one subject, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn for_subject(
        &self,
        subject_type: &str,
        subject_id: &str,
    ) -> crate::error::Result<Vec<AuditRow>> {
        sqlx::query_as::<_, AuditRow>(
            r"
            SELECT id, actor_user_id, actor_role, action, subject_type, subject_id,
                   outcome, reason, status_before, status_after, occurred_at
            FROM audit_log
            WHERE subject_type = $1 AND subject_id = $2
            ORDER BY id
            ",
        )
        .bind(subject_type)
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::FulfillmentError::db)
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail").finish_non_exhaustive()
    }
}
