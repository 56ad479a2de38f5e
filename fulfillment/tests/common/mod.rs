//! Shared harness for the Postgres-backed integration suites.
//!
//! These tests need a real database because the properties under test are
//! locking properties. Set `DATABASE_URL` to run them; without it every test
//! skips with a notice, mirroring the library's env-driven configuration.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(dead_code)] // not every suite uses every helper

use boxoffice_fulfillment::audit::AuditTrail;
use boxoffice_fulfillment::mocks::{
    MockEventRegistry, MockIdentityDirectory, MockNotifier, MockSettings,
};
use boxoffice_fulfillment::{
    CheckinService, EventId, OrderId, PaymentLedger, TicketIssuer, TicketTypeId, TransferManager,
};
use sqlx::PgPool;
use uuid::Uuid;

/// Everything a suite needs, wired against one pool and shared mocks.
pub struct TestContext {
    pub pool: PgPool,
    pub audit: AuditTrail,
    pub registry: MockEventRegistry,
    pub identity: MockIdentityDirectory,
    pub notifier: MockNotifier,
    pub settings: MockSettings,
}

/// Connect and migrate, or skip the test when no database is configured.
pub async fn setup() -> Option<TestContext> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping integration test");
        return None;
    };

    let pool = PgPool::connect(&url)
        .await
        .expect("failed to connect to DATABASE_URL");
    boxoffice_fulfillment::db::migrate(&pool)
        .await
        .expect("failed to run migrations");

    let audit = AuditTrail::new(pool.clone());
    Some(TestContext {
        pool,
        audit,
        registry: MockEventRegistry::new(),
        identity: MockIdentityDirectory::new(),
        notifier: MockNotifier::new(),
        settings: MockSettings::new(),
    })
}

impl TestContext {
    pub fn issuer(&self) -> TicketIssuer<MockNotifier> {
        TicketIssuer::new(self.pool.clone(), self.audit.clone(), self.notifier.clone())
    }

    pub fn ledger(&self) -> PaymentLedger<MockNotifier> {
        PaymentLedger::new(self.pool.clone(), self.audit.clone(), self.issuer())
    }

    pub fn transfers(&self) -> TransferManager<MockIdentityDirectory, MockNotifier> {
        TransferManager::new(
            self.pool.clone(),
            self.audit.clone(),
            self.identity.clone(),
            self.notifier.clone(),
        )
    }

    pub fn checkin(&self) -> CheckinService<MockSettings, MockEventRegistry> {
        CheckinService::new(
            self.pool.clone(),
            self.audit.clone(),
            self.settings.clone(),
            self.registry.clone(),
        )
    }

    /// Register a fresh event in the mock registry.
    pub fn seed_event(&self, name: &str) -> EventId {
        let event_id = EventId::new();
        self.registry.insert(event_id, name);
        event_id
    }

    pub async fn seed_ticket_type(&self, event_id: EventId, capacity: i32) -> TicketTypeId {
        let type_id = TicketTypeId::new();
        sqlx::query(
            r"
            INSERT INTO ticket_types (id, event_id, name, capacity_total, status)
            VALUES ($1, $2, $3, $4, 'on_sale')
            ",
        )
        .bind(type_id)
        .bind(event_id)
        .bind(format!("GA-{}", &type_id.to_string()[..8]))
        .bind(capacity)
        .execute(&self.pool)
        .await
        .expect("failed to seed ticket type");
        type_id
    }

    /// A pending order with one line per `(ticket_type, quantity)` pair.
    pub async fn seed_pending_order(
        &self,
        event_id: EventId,
        lines: &[(TicketTypeId, i32)],
        payment_ref: &str,
    ) -> OrderId {
        let order_id = OrderId::new();
        let subtotal: i64 = lines.iter().map(|&(_, q)| i64::from(q) * 2_500).sum();
        sqlx::query(
            r"
            INSERT INTO orders
                (id, event_id, status, subtotal_cents, discount_cents, total_cents,
                 currency, purchaser_email, purchaser_name, payment_ref)
            VALUES ($1, $2, 'pending', $3, 0, $3, 'EUR', $4, $5, $6)
            ",
        )
        .bind(order_id)
        .bind(event_id)
        .bind(subtotal)
        .bind(format!("buyer-{}@example.com", Uuid::new_v4()))
        .bind("Jane Doe")
        .bind(payment_ref)
        .execute(&self.pool)
        .await
        .expect("failed to seed order");

        for &(type_id, quantity) in lines {
            sqlx::query(
                r"
                INSERT INTO order_lines (id, order_id, ticket_type_id, quantity, unit_price_cents)
                VALUES ($1, $2, $3, $4, 2500)
                ",
            )
            .bind(Uuid::new_v4())
            .bind(order_id)
            .bind(type_id)
            .bind(quantity)
            .execute(&self.pool)
            .await
            .expect("failed to seed order line");
        }
        order_id
    }

    /// Fresh payment_ref unique across suites sharing one database.
    pub fn payment_ref(&self) -> String {
        format!("pi_{}", Uuid::new_v4())
    }
}
