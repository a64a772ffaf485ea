use crate::model::{Ms, HOUR_MS};

pub const MAX_POOLS: usize = 64;
pub const MAX_UNITS_PER_POOL: usize = 16;
pub const MAX_NAME_LEN: usize = 128;

/// Widest date range a single `generate_slots` call may cover.
pub const MAX_GENERATION_DAYS: i64 = 62;

/// Upper bound on slots emitted for one pool on one day.
pub const MAX_SLOTS_PER_POOL_DAY: usize = 288;

pub const MIN_SLOT_MINUTES: u32 = 5;

/// Longest manually created slot.
pub const MAX_SLOT_DURATION_MS: Ms = 24 * HOUR_MS;

/// Allocation and waitlist rows kept per slot, terminal ones included.
pub const MAX_ROWS_PER_SLOT: usize = 512;
