//! Capacity gate: the locked read-then-decide step that prevents oversell.
//!
//! The decision itself is pure. The issuance engine loads line state and
//! per-type counts under row locks, hands them to [`plan_issuance`], and only
//! then inserts. Either every line of the order fits and the whole plan is
//! returned, or nothing is created and the shortfall names the first ticket
//! type that could not cover its requested quantity.

use crate::types::{OrderLineId, TicketTypeId};
use std::collections::HashMap;

/// One order line as seen by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRequest {
    /// Line id.
    pub line_id: OrderLineId,
    /// Ticket type the line purchases.
    pub ticket_type_id: TicketTypeId,
    /// Quantity the line purchases.
    pub quantity: u32,
    /// Instances already existing for this line (from an earlier, possibly
    /// partial, fulfillment). Re-planning a fully fulfilled line yields an
    /// empty creation plan, which is what makes re-invocation idempotent.
    pub already_issued: u32,
}

/// Live inventory for one ticket type, counted under lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInventory {
    /// Hard capacity of the type.
    pub capacity_total: u32,
    /// Existing `issued + checked_in` instances across all orders, including
    /// any counted in [`LineRequest::already_issued`].
    pub issued: u32,
}

impl TypeInventory {
    /// Seats still available.
    #[must_use]
    pub const fn remaining(self) -> u32 {
        self.capacity_total.saturating_sub(self.issued)
    }
}

/// Creation plan for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinePlan {
    /// Line to fulfill.
    pub line_id: OrderLineId,
    /// Ticket type to draw from.
    pub ticket_type_id: TicketTypeId,
    /// Instances to create.
    pub create: u32,
    /// Sequence number of the first new instance (existing ones occupy
    /// `1..=already_issued`).
    pub first_seq: u32,
}

/// A ticket type that cannot cover the order's requested quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityShortfall {
    /// The type that ran out.
    pub ticket_type: TicketTypeId,
    /// Quantity the order still needed from that type.
    pub requested: u32,
    /// Seats remaining at the time of the locked count.
    pub available: u32,
}

/// Decide what to create for an order, or abort the whole order.
///
/// `inventory` must contain every ticket type referenced by `lines`; the
/// engine loads it from the lines' foreign keys, so a miss is treated as a
/// zero-capacity type rather than a panic.
///
/// # Errors
///
/// Returns the first shortfall (in ascending ticket-type order, matching the
/// lock order) if any type cannot cover the quantity still needed for it.
/// On shortfall, nothing is to be created for *any* line.
pub fn plan_issuance(
    lines: &[LineRequest],
    inventory: &HashMap<TicketTypeId, TypeInventory>,
) -> Result<Vec<LinePlan>, CapacityShortfall> {
    // Aggregate the still-needed quantity per type first: an order may hold
    // several lines of the same type, and they draw from one pool.
    let mut needed: HashMap<TicketTypeId, u32> = HashMap::new();
    for line in lines {
        let missing = line.quantity.saturating_sub(line.already_issued);
        *needed.entry(line.ticket_type_id).or_default() += missing;
    }

    let mut type_ids: Vec<TicketTypeId> = needed.keys().copied().collect();
    type_ids.sort_unstable();

    for type_id in type_ids {
        let required = needed[&type_id];
        let available = inventory.get(&type_id).copied().map_or(0, TypeInventory::remaining);
        if required > available {
            return Err(CapacityShortfall {
                ticket_type: type_id,
                requested: required,
                available,
            });
        }
    }

    Ok(lines
        .iter()
        .map(|line| LinePlan {
            line_id: line.line_id,
            ticket_type_id: line.ticket_type_id,
            create: line.quantity.saturating_sub(line.already_issued),
            first_seq: line.already_issued + 1,
        })
        .collect())
}
