//! Payment settlement integration tests.
//!
//! Exercises the idempotency record, the pending→paid compare-and-swap, and
//! the overbooked abort against a real database.
//!
//! Run with `DATABASE_URL` set; skipped otherwise.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

mod common;

use boxoffice_fulfillment::{
    Actor, FulfillmentError, OrderId, OrderStatus, PaymentEventStatus, PaymentNotification,
};
use uuid::Uuid;

fn notification(payment_ref: &str, status: PaymentEventStatus, amount: i64) -> PaymentNotification {
    PaymentNotification {
        provider: "stripe".to_string(),
        provider_event_id: format!("evt_{}", Uuid::new_v4()),
        payment_ref: payment_ref.to_string(),
        status,
        amount_cents: amount,
        currency: "EUR".to_string(),
    }
}

async fn live_instances(pool: &sqlx::PgPool, order_id: OrderId) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM ticket_instances WHERE order_id = $1 AND status IN ('issued', 'checked_in')",
    )
    .bind(order_id)
    .fetch_one(pool)
    .await
    .expect("count query failed")
}

async fn order_status(pool: &sqlx::PgPool, order_id: OrderId) -> OrderStatus {
    sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_one(pool)
        .await
        .expect("status query failed")
}

#[tokio::test]
async fn paid_event_settles_once_and_replays_stored_outcome() {
    let Some(ctx) = common::setup().await else { return };
    let ledger = ctx.ledger();
    let actor = Actor::service();

    let event_id = ctx.seed_event("Rust Night");
    let ga = ctx.seed_ticket_type(event_id, 100).await;
    let payment_ref = ctx.payment_ref();
    let order_id = ctx.seed_pending_order(event_id, &[(ga, 3)], &payment_ref).await;

    let n = notification(&payment_ref, PaymentEventStatus::Paid, 7_500);
    let first = ledger.apply_payment_event(&actor, n.clone()).await.expect("settlement failed");

    assert!(first.paid);
    assert_eq!(first.tickets_issued, 3);
    assert!(!first.overbooked);
    assert_eq!(first.order_id, Some(order_id));
    assert_eq!(order_status(&ctx.pool, order_id).await, OrderStatus::Paid);
    assert_eq!(live_instances(&ctx.pool, order_id).await, 3);

    // Same (provider, provider_event_id): the stored outcome comes back
    // unchanged and nothing new is created.
    let replay = ledger.apply_payment_event(&actor, n).await.expect("replay failed");
    assert_eq!(replay, first);
    assert_eq!(live_instances(&ctx.pool, order_id).await, 3);
}

#[tokio::test]
async fn second_paid_event_for_the_same_order_issues_nothing() {
    let Some(ctx) = common::setup().await else { return };
    let ledger = ctx.ledger();
    let actor = Actor::service();

    let event_id = ctx.seed_event("Rust Night");
    let ga = ctx.seed_ticket_type(event_id, 10).await;
    let payment_ref = ctx.payment_ref();
    let order_id = ctx.seed_pending_order(event_id, &[(ga, 2)], &payment_ref).await;

    let first = ledger
        .apply_payment_event(&actor, notification(&payment_ref, PaymentEventStatus::Paid, 5_000))
        .await
        .expect("settlement failed");
    assert_eq!(first.tickets_issued, 2);

    // Distinct provider event for the same payment: order status changes at
    // most once, tickets issue at most once.
    let second = ledger
        .apply_payment_event(&actor, notification(&payment_ref, PaymentEventStatus::Paid, 5_000))
        .await
        .expect("second settlement failed");
    assert!(second.paid);
    assert_eq!(second.tickets_issued, 0);
    assert_eq!(live_instances(&ctx.pool, order_id).await, 2);
}

#[tokio::test]
async fn overbooked_order_is_cancelled_with_zero_instances() {
    let Some(ctx) = common::setup().await else { return };
    let ledger = ctx.ledger();
    let actor = Actor::service();

    let event_id = ctx.seed_event("Tiny Venue");
    let ga = ctx.seed_ticket_type(event_id, 2).await;
    let payment_ref = ctx.payment_ref();
    // Two lines; the second one cannot be covered, so neither may issue.
    let order_id = ctx
        .seed_pending_order(event_id, &[(ga, 1), (ga, 4)], &payment_ref)
        .await;

    let outcome = ledger
        .apply_payment_event(&actor, notification(&payment_ref, PaymentEventStatus::Paid, 12_500))
        .await
        .expect("settlement failed");

    assert!(!outcome.paid);
    assert!(outcome.overbooked);
    assert_eq!(outcome.tickets_issued, 0);
    assert_eq!(live_instances(&ctx.pool, order_id).await, 0);
    assert_eq!(order_status(&ctx.pool, order_id).await, OrderStatus::Cancelled);

    let reason: Option<String> =
        sqlx::query_scalar("SELECT failure_reason FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_one(&ctx.pool)
            .await
            .expect("reason query failed");
    assert_eq!(reason.as_deref(), Some("overbooked"));
}

#[tokio::test]
async fn failed_event_moves_pending_order_to_failed() {
    let Some(ctx) = common::setup().await else { return };
    let ledger = ctx.ledger();
    let actor = Actor::service();

    let event_id = ctx.seed_event("Rust Night");
    let ga = ctx.seed_ticket_type(event_id, 10).await;
    let payment_ref = ctx.payment_ref();
    let order_id = ctx.seed_pending_order(event_id, &[(ga, 1)], &payment_ref).await;

    let outcome = ledger
        .apply_payment_event(&actor, notification(&payment_ref, PaymentEventStatus::Failed, 2_500))
        .await
        .expect("settlement failed");

    assert!(!outcome.paid);
    assert_eq!(order_status(&ctx.pool, order_id).await, OrderStatus::Failed);
}

#[tokio::test]
async fn unknown_payment_ref_is_reported_and_leaves_no_record() {
    let Some(ctx) = common::setup().await else { return };
    let ledger = ctx.ledger();
    let actor = Actor::service();

    let n = notification(&ctx.payment_ref(), PaymentEventStatus::Paid, 1_000);
    let err = ledger.apply_payment_event(&actor, n.clone()).await.unwrap_err();
    assert_eq!(err, FulfillmentError::OrderNotFound);

    // The idempotency slot stays unclaimed, so the same delivery can settle
    // once the order exists.
    let event_id = ctx.seed_event("Late Order");
    let ga = ctx.seed_ticket_type(event_id, 5).await;
    ctx.seed_pending_order(event_id, &[(ga, 1)], &n.payment_ref).await;

    let outcome = ledger.apply_payment_event(&actor, n).await.expect("retry failed");
    assert!(outcome.paid);
    assert_eq!(outcome.tickets_issued, 1);
}

#[tokio::test]
async fn refund_is_the_only_exit_from_paid_and_voids_instances() {
    let Some(ctx) = common::setup().await else { return };
    let ledger = ctx.ledger();
    let actor = Actor::service();

    let event_id = ctx.seed_event("Rust Night");
    let ga = ctx.seed_ticket_type(event_id, 10).await;
    let payment_ref = ctx.payment_ref();
    let order_id = ctx.seed_pending_order(event_id, &[(ga, 2)], &payment_ref).await;

    ledger
        .apply_payment_event(&actor, notification(&payment_ref, PaymentEventStatus::Paid, 5_000))
        .await
        .expect("settlement failed");

    ledger.refund_order(&actor, order_id).await.expect("refund failed");
    assert_eq!(order_status(&ctx.pool, order_id).await, OrderStatus::Refunded);
    assert_eq!(live_instances(&ctx.pool, order_id).await, 0);

    // Refunding twice is a state conflict, not a silent no-op.
    let err = ledger.refund_order(&actor, order_id).await.unwrap_err();
    assert!(matches!(err, FulfillmentError::OrderStateConflict { .. }));
}

#[tokio::test]
async fn concurrent_duplicate_deliveries_settle_exactly_once() {
    let Some(ctx) = common::setup().await else { return };
    let actor = Actor::service();

    let event_id = ctx.seed_event("Webhook Storm");
    let ga = ctx.seed_ticket_type(event_id, 10).await;
    let payment_ref = ctx.payment_ref();
    let order_id = ctx.seed_pending_order(event_id, &[(ga, 2)], &payment_ref).await;

    let n = notification(&payment_ref, PaymentEventStatus::Paid, 5_000);

    let ledger_a = ctx.ledger();
    let ledger_b = ctx.ledger();
    let (n_a, n_b) = (n.clone(), n);
    let actor_a = actor.clone();
    let actor_b = actor;

    let task_a = tokio::spawn(async move { ledger_a.apply_payment_event(&actor_a, n_a).await });
    let task_b = tokio::spawn(async move { ledger_b.apply_payment_event(&actor_b, n_b).await });

    let result_a = task_a.await.expect("task a panicked").expect("delivery a failed");
    let result_b = task_b.await.expect("task b panicked").expect("delivery b failed");

    // Both callers observe the same outcome; only one created instances.
    assert_eq!(result_a, result_b);
    assert!(result_a.paid);
    assert_eq!(result_a.tickets_issued, 2);
    assert_eq!(live_instances(&ctx.pool, order_id).await, 2);
}
