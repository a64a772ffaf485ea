use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{AllocationState, Ms, WaitlistState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Pool,
    Unit,
    Slot,
    Allocation,
    WaitlistEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// The requester already holds an active allocation on the slot.
    AlreadyAllocated(Ulid),
    /// The requester is already queued for the slot.
    AlreadyWaitlisted(Ulid),
    /// Closer than the buffer to another allocation of the same requester.
    /// `gap` is `None` when the windows overlap.
    Buffer { allocation_id: Ulid, gap: Option<Ms> },
    /// Closer than the buffer to a slot the requester is queued for.
    WaitlistBuffer { entry_id: Ulid, gap: Option<Ms> },
    /// A slot window overlapping another slot of the same pool.
    OverlappingSlot(Ulid),
    AlreadyExists(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExhaustionReason {
    /// Booked out and the queue is at its cap.
    WaitlistFull { cap: u32 },
    /// Out-of-service units leave too little room. Not waitlistable.
    UnitsUnavailable { needed: u32, available_units: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyReason {
    SlotInPast,
    InsideLeadTime { lead_time: Ms },
    ClosedDay(NaiveDate),
    CancellationWindowClosed { cutoff: Ms },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidStateReason {
    SlotDisabled(Ulid),
    Transition {
        id: Ulid,
        from: AllocationState,
        to: AllocationState,
    },
    EntryClosed { id: Ulid, state: WaitlistState },
    SlotInUse { slot_id: Ulid, active: u32 },
}

/// Caller-facing category of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Exhausted,
    InvalidState,
    PolicyViolation,
    /// Nothing was applied; the same call may succeed later.
    Transient,
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Entity, Ulid),
    Conflict(ConflictReason),
    Exhausted(ExhaustionReason),
    InvalidState(InvalidStateReason),
    PolicyViolation(PolicyReason),
    LimitExceeded(&'static str),
    Persistence(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(..) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Exhausted(_) => ErrorKind::Exhausted,
            EngineError::InvalidState(_) => ErrorKind::InvalidState,
            EngineError::PolicyViolation(_) | EngineError::LimitExceeded(_) => ErrorKind::PolicyViolation,
            EngineError::Persistence(_) => ErrorKind::Transient,
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) => "not_found",
            EngineError::Conflict(ConflictReason::Buffer { .. } | ConflictReason::WaitlistBuffer { .. }) => {
                "buffer_conflict"
            }
            EngineError::Conflict(_) => "conflict",
            EngineError::Exhausted(ExhaustionReason::WaitlistFull { .. }) => "waitlist_full",
            EngineError::Exhausted(ExhaustionReason::UnitsUnavailable { .. }) => "units_unavailable",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::PolicyViolation(_) => "policy_violation",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Persistence(_) => "persistence",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(entity, id) => write!(f, "{entity:?} not found: {id}"),
            EngineError::Conflict(reason) => match reason {
                ConflictReason::AlreadyAllocated(id) => {
                    write!(f, "requester already holds allocation {id} on this slot")
                }
                ConflictReason::AlreadyWaitlisted(id) => {
                    write!(f, "requester already waitlisted for this slot as {id}")
                }
                ConflictReason::Buffer { allocation_id, gap: None } => {
                    write!(f, "overlaps allocation {allocation_id}")
                }
                ConflictReason::Buffer { allocation_id, gap: Some(gap) } => {
                    write!(f, "only {gap}ms after/before allocation {allocation_id}")
                }
                ConflictReason::WaitlistBuffer { entry_id, gap: None } => {
                    write!(f, "overlaps queued slot of waitlist entry {entry_id}")
                }
                ConflictReason::WaitlistBuffer { entry_id, gap: Some(gap) } => {
                    write!(f, "only {gap}ms after/before queued slot of waitlist entry {entry_id}")
                }
                ConflictReason::OverlappingSlot(id) => write!(f, "overlaps slot {id}"),
                ConflictReason::AlreadyExists(id) => write!(f, "already exists: {id}"),
            },
            EngineError::Exhausted(reason) => match reason {
                ExhaustionReason::WaitlistFull { cap } => {
                    write!(f, "slot is full and its waitlist holds {cap} entries")
                }
                ExhaustionReason::UnitsUnavailable { needed, available_units } => write!(
                    f,
                    "needs {needed} units but only {available_units} are in service"
                ),
            },
            EngineError::InvalidState(reason) => match reason {
                InvalidStateReason::SlotDisabled(id) => write!(f, "slot {id} is disabled"),
                InvalidStateReason::Transition { id, from, to } => write!(
                    f,
                    "allocation {id} cannot go from {} to {}",
                    from.label(),
                    to.label()
                ),
                InvalidStateReason::EntryClosed { id, state } => {
                    write!(f, "waitlist entry {id} is no longer waiting ({state:?})")
                }
                InvalidStateReason::SlotInUse { slot_id, active } => {
                    write!(f, "slot {slot_id} still has {active} active allocations")
                }
            },
            EngineError::PolicyViolation(reason) => match reason {
                PolicyReason::SlotInPast => write!(f, "slot has already started"),
                PolicyReason::InsideLeadTime { lead_time } => {
                    write!(f, "slot starts within the {lead_time}ms booking lead time")
                }
                PolicyReason::ClosedDay(date) => write!(f, "facility is closed on {date}"),
                PolicyReason::CancellationWindowClosed { cutoff } => {
                    write!(f, "cancellations close {cutoff}ms before the slot starts")
                }
            },
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Persistence(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
