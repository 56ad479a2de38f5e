//! Transfer state-machine integration tests.
//!
//! Exercises the capability token, the one-pending-per-ticket guard, lazy
//! expiry, and the accept-exactly-once race against a real database.
//!
//! Run with `DATABASE_URL` set; skipped otherwise.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

mod common;

use boxoffice_fulfillment::providers::UserRef;
use boxoffice_fulfillment::{
    Actor, FulfillmentError, Role, TicketId, TransferStatus, UserId,
};
use chrono::Duration;
use common::TestContext;

/// One issued ticket, via the real issuance path.
async fn seed_ticket(ctx: &TestContext) -> TicketId {
    let event_id = ctx.seed_event("Transfer Night");
    let ga = ctx.seed_ticket_type(event_id, 50).await;
    let order_id = ctx.seed_pending_order(event_id, &[(ga, 1)], &ctx.payment_ref()).await;
    sqlx::query("UPDATE orders SET status = 'paid' WHERE id = $1")
        .bind(order_id)
        .execute(&ctx.pool)
        .await
        .expect("failed to mark paid");
    let tickets = ctx
        .issuer()
        .issue(&Actor::service(), order_id)
        .await
        .expect("issuance failed");
    tickets[0].ticket.id
}

/// The actor who owns a freshly issued ticket (matched by purchaser email).
async fn owner_of(ctx: &TestContext, ticket_id: TicketId) -> Actor {
    let email: String =
        sqlx::query_scalar("SELECT owner_email FROM ticket_instances WHERE id = $1")
            .bind(ticket_id)
            .fetch_one(&ctx.pool)
            .await
            .expect("owner query failed");
    Actor { user_id: None, email: Some(email), role: Role::Attendee }
}

async fn transfer_status(ctx: &TestContext, id: boxoffice_fulfillment::TransferId) -> TransferStatus {
    sqlx::query_scalar("SELECT status FROM transfers WHERE id = $1")
        .bind(id)
        .fetch_one(&ctx.pool)
        .await
        .expect("status query failed")
}

#[tokio::test]
async fn accept_moves_ownership_with_the_right_token() {
    let Some(ctx) = common::setup().await else { return };
    let transfers = ctx.transfers();
    let ticket_id = seed_ticket(&ctx).await;
    let owner = owner_of(&ctx, ticket_id).await;

    let recipient = UserRef {
        user_id: UserId::new(),
        email: "rx@example.com".to_string(),
        name: "Recipient Person".to_string(),
    };
    ctx.identity.insert(recipient.clone());

    let offer = transfers
        .initiate(&owner, ticket_id, "rx@example.com", Duration::hours(48))
        .await
        .expect("initiate failed");

    let anonymous = Actor { user_id: None, email: None, role: Role::Attendee };
    let acceptance = transfers
        .accept(&anonymous, offer.transfer_id, offer.raw_token.expose())
        .await
        .expect("accept failed");

    assert_eq!(acceptance.new_owner.user_id, Some(recipient.user_id));
    assert_eq!(acceptance.new_owner.email, "rx@example.com");

    let (owner_email, owner_user): (String, Option<UserId>) = sqlx::query_as(
        "SELECT owner_email, owner_user_id FROM ticket_instances WHERE id = $1",
    )
    .bind(ticket_id)
    .fetch_one(&ctx.pool)
    .await
    .expect("owner query failed");
    assert_eq!(owner_email, "rx@example.com");
    assert_eq!(owner_user, Some(recipient.user_id));
    assert_eq!(transfer_status(&ctx, offer.transfer_id).await, TransferStatus::Accepted);

    // The offer went out to the recipient, and both transitions are on the
    // audit trail with their before/after statuses.
    let sent = ctx.notifier.sent();
    assert!(sent.iter().any(|n| matches!(
        n,
        boxoffice_fulfillment::mocks::SentNotification::TransferOffer { email, .. }
            if email == "rx@example.com"
    )));

    let trail = ctx
        .audit
        .for_subject("transfer", &offer.transfer_id.to_string())
        .await
        .expect("audit read failed");
    assert!(trail.iter().any(|row| row.action == "transfer.initiate" && row.outcome == "success"));
    assert!(trail.iter().any(|row| {
        row.action == "transfer.accept"
            && row.status_before.as_deref() == Some("pending")
            && row.status_after.as_deref() == Some("accepted")
    }));
}

#[tokio::test]
async fn wrong_token_is_rejected_and_leaves_the_transfer_pending() {
    let Some(ctx) = common::setup().await else { return };
    let transfers = ctx.transfers();
    let ticket_id = seed_ticket(&ctx).await;
    let owner = owner_of(&ctx, ticket_id).await;

    let offer = transfers
        .initiate(&owner, ticket_id, "rx@example.com", Duration::hours(48))
        .await
        .expect("initiate failed");

    let anonymous = Actor { user_id: None, email: None, role: Role::Attendee };
    let err = transfers
        .accept(&anonymous, offer.transfer_id, "wrong-token")
        .await
        .unwrap_err();
    assert_eq!(err, FulfillmentError::InvalidToken);
    assert_eq!(transfer_status(&ctx, offer.transfer_id).await, TransferStatus::Pending);
}

#[tokio::test]
async fn re_accepting_an_accepted_transfer_is_a_no_op_success() {
    let Some(ctx) = common::setup().await else { return };
    let transfers = ctx.transfers();
    let ticket_id = seed_ticket(&ctx).await;
    let owner = owner_of(&ctx, ticket_id).await;

    let offer = transfers
        .initiate(&owner, ticket_id, "rx@example.com", Duration::hours(48))
        .await
        .expect("initiate failed");

    let anonymous = Actor { user_id: None, email: None, role: Role::Attendee };
    let first = transfers
        .accept(&anonymous, offer.transfer_id, offer.raw_token.expose())
        .await
        .expect("first accept failed");
    let second = transfers
        .accept(&anonymous, offer.transfer_id, offer.raw_token.expose())
        .await
        .expect("second accept must be a no-op success");

    assert_eq!(first.new_owner.email, second.new_owner.email);
}

#[tokio::test]
async fn concurrent_accepts_change_ownership_exactly_once() {
    let Some(ctx) = common::setup().await else { return };
    let ticket_id = seed_ticket(&ctx).await;
    let owner = owner_of(&ctx, ticket_id).await;

    let offer = ctx
        .transfers()
        .initiate(&owner, ticket_id, "rx@example.com", Duration::hours(48))
        .await
        .expect("initiate failed");

    let token_a = offer.raw_token.expose().to_string();
    let token_b = token_a.clone();
    let transfers_a = ctx.transfers();
    let transfers_b = ctx.transfers();
    let transfer_id = offer.transfer_id;
    let actor_a = Actor { user_id: None, email: None, role: Role::Attendee };
    let actor_b = actor_a.clone();

    let task_a =
        tokio::spawn(async move { transfers_a.accept(&actor_a, transfer_id, &token_a).await });
    let task_b =
        tokio::spawn(async move { transfers_b.accept(&actor_b, transfer_id, &token_b).await });

    let result_a = task_a.await.expect("task a panicked").expect("accept a failed");
    let result_b = task_b.await.expect("task b panicked").expect("accept b failed");

    // Both callers observe the same owner; the flip happened once.
    assert_eq!(result_a, result_b);
    assert_eq!(transfer_status(&ctx, transfer_id).await, TransferStatus::Accepted);
}

#[tokio::test]
async fn only_one_pending_transfer_per_ticket() {
    let Some(ctx) = common::setup().await else { return };
    let transfers = ctx.transfers();
    let ticket_id = seed_ticket(&ctx).await;
    let owner = owner_of(&ctx, ticket_id).await;

    transfers
        .initiate(&owner, ticket_id, "first@example.com", Duration::hours(48))
        .await
        .expect("first initiate failed");
    let err = transfers
        .initiate(&owner, ticket_id, "second@example.com", Duration::hours(48))
        .await
        .unwrap_err();
    assert_eq!(err, FulfillmentError::TransferAlreadyPending { ticket: ticket_id });
}

#[tokio::test]
async fn strangers_cannot_initiate_or_cancel() {
    let Some(ctx) = common::setup().await else { return };
    let transfers = ctx.transfers();
    let ticket_id = seed_ticket(&ctx).await;
    let owner = owner_of(&ctx, ticket_id).await;

    let stranger = Actor {
        user_id: Some(UserId::new()),
        email: Some("stranger@example.com".to_string()),
        role: Role::Attendee,
    };
    let err = transfers
        .initiate(&stranger, ticket_id, "rx@example.com", Duration::hours(48))
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::InsufficientPermissions { .. }));

    let offer = transfers
        .initiate(&owner, ticket_id, "rx@example.com", Duration::hours(48))
        .await
        .expect("initiate failed");
    let err = transfers.cancel(&stranger, offer.transfer_id).await.unwrap_err();
    assert!(matches!(err, FulfillmentError::InsufficientPermissions { .. }));

    // An organizer may cancel on the holder's behalf.
    let organizer = Actor { user_id: Some(UserId::new()), email: None, role: Role::Organizer };
    transfers.cancel(&organizer, offer.transfer_id).await.expect("organizer cancel failed");
    assert_eq!(transfer_status(&ctx, offer.transfer_id).await, TransferStatus::Cancelled);
}

#[tokio::test]
async fn overdue_transfers_expire_on_accept_and_on_sweep() {
    let Some(ctx) = common::setup().await else { return };
    let transfers = ctx.transfers();
    let anonymous = Actor { user_id: None, email: None, role: Role::Attendee };

    // Lazy path: accept after the deadline marks expired and reports it.
    let ticket_a = seed_ticket(&ctx).await;
    let owner_a = owner_of(&ctx, ticket_a).await;
    let offer_a = transfers
        .initiate(&owner_a, ticket_a, "rx@example.com", Duration::seconds(1))
        .await
        .expect("initiate failed");
    sqlx::query("UPDATE transfers SET expires_at = now() - interval '1 minute' WHERE id = $1")
        .bind(offer_a.transfer_id)
        .execute(&ctx.pool)
        .await
        .expect("backdate failed");

    let err = transfers
        .accept(&anonymous, offer_a.transfer_id, offer_a.raw_token.expose())
        .await
        .unwrap_err();
    assert_eq!(err, FulfillmentError::TransferExpired { transfer: offer_a.transfer_id });
    assert_eq!(transfer_status(&ctx, offer_a.transfer_id).await, TransferStatus::Expired);

    // Sweep path: the maintenance pass performs the same transition.
    let ticket_b = seed_ticket(&ctx).await;
    let owner_b = owner_of(&ctx, ticket_b).await;
    let offer_b = transfers
        .initiate(&owner_b, ticket_b, "rx@example.com", Duration::seconds(1))
        .await
        .expect("initiate failed");
    sqlx::query("UPDATE transfers SET expires_at = now() - interval '1 minute' WHERE id = $1")
        .bind(offer_b.transfer_id)
        .execute(&ctx.pool)
        .await
        .expect("backdate failed");

    let expired = transfers.expire_stale(&Actor::service()).await.expect("sweep failed");
    assert!(expired >= 1);
    assert_eq!(transfer_status(&ctx, offer_b.transfer_id).await, TransferStatus::Expired);

    // Terminal states are immutable: the attempt is reported, not dropped.
    let err = transfers
        .accept(&anonymous, offer_b.transfer_id, offer_b.raw_token.expose())
        .await
        .unwrap_err();
    assert!(matches!(err, FulfillmentError::TransferNotPending { .. }));
}

#[tokio::test]
async fn reject_requires_the_token_and_pending_state() {
    let Some(ctx) = common::setup().await else { return };
    let transfers = ctx.transfers();
    let ticket_id = seed_ticket(&ctx).await;
    let owner = owner_of(&ctx, ticket_id).await;
    let anonymous = Actor { user_id: None, email: None, role: Role::Attendee };

    let offer = transfers
        .initiate(&owner, ticket_id, "rx@example.com", Duration::hours(48))
        .await
        .expect("initiate failed");

    let err = transfers
        .reject(&anonymous, offer.transfer_id, "wrong-token")
        .await
        .unwrap_err();
    assert_eq!(err, FulfillmentError::InvalidToken);

    transfers
        .reject(&anonymous, offer.transfer_id, offer.raw_token.expose())
        .await
        .expect("reject failed");
    assert_eq!(transfer_status(&ctx, offer.transfer_id).await, TransferStatus::Rejected);

    // The ticket is free for a new offer afterwards.
    transfers
        .initiate(&owner, ticket_id, "other@example.com", Duration::hours(48))
        .await
        .expect("re-initiate after reject failed");
}
