//! Collaborator boundaries consumed by the fulfillment core.
//!
//! The platform's identity service, event registry, notification dispatcher,
//! and settings store are external systems that this crate only calls through
//! narrow traits. Production wiring implements them against the real
//! services; `crate::mocks` provides in-memory implementations for tests.

mod identity;
mod notifier;
mod registry;
mod settings;

pub use identity::{IdentityDirectory, UserRef};
pub use notifier::Notifier;
pub use registry::{EventRegistry, EventSummary};
pub use settings::{CheckinPolicy, CheckinSettings};
