//! Capacity accounting for a single slot.
//!
//! Nothing here is stored: `units_in_use` is recomputed from the slot's active
//! allocations and the pool's units are read at the instant of the check, so the
//! ledger can never drift from the rows it describes.

use ulid::Ulid;

use super::error::{EngineError, Entity, InvalidStateReason};
use crate::model::{Allocation, AllocationState, SlotBook};

/// Unit counts of the pool a slot draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCapacity {
    pub unit_count: u32,
    pub available_units: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ledger {
    pub enabled: bool,
    pub unit_count: u32,
    pub available_units: u32,
    pub units_in_use: u32,
}

/// Why a reservation cannot be made right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortfall {
    Disabled,
    /// Too few units in service, independent of bookings.
    UnitsUnavailable,
    /// Taken by other allocations. The only waitlistable case.
    Booked,
}

impl Ledger {
    pub fn of(book: &SlotBook, pool: PoolCapacity) -> Self {
        Self {
            enabled: book.slot.enabled,
            unit_count: pool.unit_count,
            available_units: pool.available_units,
            units_in_use: book.units_in_use(),
        }
    }

    /// Units the slot can hold at all: zero while disabled, otherwise bounded by
    /// the units currently in service.
    pub fn effective_capacity(&self) -> u32 {
        if !self.enabled {
            return 0;
        }
        self.unit_count.min(self.available_units)
    }

    pub fn available(&self) -> u32 {
        self.effective_capacity().saturating_sub(self.units_in_use)
    }

    pub fn is_exhausted(&self) -> bool {
        self.available() == 0
    }

    pub fn shortfall(&self, units: u32) -> Option<Shortfall> {
        if !self.enabled {
            return Some(Shortfall::Disabled);
        }
        if self.available() >= units {
            return None;
        }
        let free_if_all_in_service = self.unit_count.saturating_sub(self.units_in_use);
        if units > self.available_units || free_if_all_in_service >= units {
            Some(Shortfall::UnitsUnavailable)
        } else {
            Some(Shortfall::Booked)
        }
    }
}

/// Check that an allocation may move to `to` and return it as it is now.
/// Releasing an already terminal allocation fails, which keeps release idempotent.
pub fn check_transition<'a>(book: &'a SlotBook, allocation_id: Ulid, to: AllocationState) -> Result<&'a Allocation, EngineError> {
    let allocation = book
        .allocation(allocation_id)
        .ok_or(EngineError::NotFound(Entity::Allocation, allocation_id))?;
    if !allocation.state.can_become(to) {
        return Err(EngineError::InvalidState(InvalidStateReason::Transition {
            id: allocation_id,
            from: allocation.state,
            to,
        }));
    }
    Ok(allocation)
}
