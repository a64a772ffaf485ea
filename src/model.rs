use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Wall clock as `Ms`.
pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Requesters are owned by an external identity service; the engine only keeps their id.
pub type RequesterId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Idle time between two spans, `None` if they overlap.
    /// Back-to-back spans have a separation of zero.
    pub fn separation(&self, other: &Span) -> Option<Ms> {
        if self.overlaps(other) {
            None
        } else if self.end <= other.start {
            Some(other.start - self.end)
        } else {
            Some(self.start - other.end)
        }
    }
}

/// What the requester brings. Separated loads need both machines of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadKind {
    Combined,
    SeparateWhites,
    SeparateColors,
}

impl LoadKind {
    pub fn is_separated(self) -> bool {
        matches!(self, LoadKind::SeparateWhites | LoadKind::SeparateColors)
    }

    pub fn label(self) -> &'static str {
        match self {
            LoadKind::Combined => "combined",
            LoadKind::SeparateWhites => "separate_whites",
            LoadKind::SeparateColors => "separate_colors",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Available,
    OutOfOrder,
    Maintenance,
}

impl UnitStatus {
    pub fn is_available(self) -> bool {
        matches!(self, UnitStatus::Available)
    }

    pub fn label(self) -> &'static str {
        match self {
            UnitStatus::Available => "available",
            UnitStatus::OutOfOrder => "out_of_order",
            UnitStatus::Maintenance => "maintenance",
        }
    }
}

/// One machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: Ulid,
    pub number: u32,
    pub status: UnitStatus,
}

/// A group of identical units booked through a shared slot schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub id: Ulid,
    pub name: Option<String>,
    /// Position in the facility; drives the stagger offset of the pool's schedule.
    pub ordinal: u32,
    pub units: Vec<Unit>,
}

impl ResourcePool {
    pub fn unit_count(&self) -> u32 {
        self.units.len() as u32
    }

    pub fn available_units(&self) -> u32 {
        self.units.iter().filter(|u| u.status.is_available()).count() as u32
    }

    pub fn unit_mut(&mut self, id: Ulid) -> Option<&mut Unit> {
        self.units.iter_mut().find(|u| u.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub pool_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationState {
    Granted,
    Claimed,
    InProgress,
    Completed,
    NoShow,
    Cancelled,
}

impl AllocationState {
    /// Active allocations consume units.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AllocationState::Granted | AllocationState::Claimed | AllocationState::InProgress
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn can_become(self, next: AllocationState) -> bool {
        use AllocationState::*;
        matches!(
            (self, next),
            (Granted, Claimed)
                | (Claimed, InProgress)
                | (InProgress, Completed)
                | (Granted, NoShow)
                | (Granted | Claimed | InProgress, Cancelled)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            AllocationState::Granted => "granted",
            AllocationState::Claimed => "claimed",
            AllocationState::InProgress => "in_progress",
            AllocationState::Completed => "completed",
            AllocationState::NoShow => "no_show",
            AllocationState::Cancelled => "cancelled",
        }
    }
}

/// A booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub requester_id: RequesterId,
    pub slot_id: Ulid,
    pub load_kind: LoadKind,
    pub units: u32,
    pub state: AllocationState,
    pub created_at: Ms,
    pub claimed_at: Option<Ms>,
    pub updated_at: Ms,
    /// Waitlist entry this allocation was promoted from, if any.
    pub promoted_from: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitlistState {
    Waiting,
    Promoted,
    Withdrawn,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub requester_id: RequesterId,
    pub slot_id: Ulid,
    pub load_kind: LoadKind,
    pub units: u32,
    /// 1-based place in line. Only meaningful while `Waiting`.
    pub position: u32,
    pub state: WaitlistState,
    pub created_at: Ms,
    pub closed_at: Option<Ms>,
}

impl WaitlistEntry {
    pub fn is_waiting(&self) -> bool {
        self.state == WaitlistState::Waiting
    }
}

/// Everything that lives behind one slot's lock: the slot itself, its bookings, its queue.
#[derive(Debug, Clone)]
pub struct SlotBook {
    pub slot: Slot,
    pub allocations: Vec<Allocation>,
    pub waitlist: Vec<WaitlistEntry>,
}

impl SlotBook {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            allocations: Vec::new(),
            waitlist: Vec::new(),
        }
    }

    pub fn active_allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.iter().filter(|a| a.state.is_active())
    }

    /// Units held by active allocations, recomputed from the allocation set every time.
    pub fn units_in_use(&self) -> u32 {
        self.active_allocations().map(|a| a.units).sum()
    }

    pub fn allocation(&self, id: Ulid) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == id)
    }

    pub fn allocation_mut(&mut self, id: Ulid) -> Option<&mut Allocation> {
        self.allocations.iter_mut().find(|a| a.id == id)
    }

    pub fn entry(&self, id: Ulid) -> Option<&WaitlistEntry> {
        self.waitlist.iter().find(|e| e.id == id)
    }

    pub fn entry_mut(&mut self, id: Ulid) -> Option<&mut WaitlistEntry> {
        self.waitlist.iter_mut().find(|e| e.id == id)
    }

    /// Waiting entries in queue order.
    pub fn queue(&self) -> Vec<&WaitlistEntry> {
        let mut waiting: Vec<&WaitlistEntry> =
            self.waitlist.iter().filter(|e| e.is_waiting()).collect();
        waiting.sort_by_key(|e| (e.position, e.created_at, e.id));
        waiting
    }

    pub fn queue_len(&self) -> u32 {
        self.waitlist.iter().filter(|e| e.is_waiting()).count() as u32
    }

    pub fn holds_active_allocation(&self, requester: RequesterId) -> bool {
        self.active_allocations().any(|a| a.requester_id == requester)
    }

    pub fn holds_waiting_entry(&self, requester: RequesterId) -> bool {
        self.waitlist
            .iter()
            .any(|e| e.is_waiting() && e.requester_id == requester)
    }

    /// Renumber waiting entries to `1..N`, keeping their relative order.
    pub fn reindex_waitlist(&mut self) {
        let mut order: Vec<(u32, Ms, Ulid)> = self
            .waitlist
            .iter()
            .filter(|e| e.is_waiting())
            .map(|e| (e.position, e.created_at, e.id))
            .collect();
        order.sort();
        for (idx, (_, _, id)) in order.into_iter().enumerate() {
            if let Some(entry) = self.entry_mut(id) {
                entry.position = idx as u32 + 1;
            }
        }
    }
}

/// The event types. A `Commit` groups the events of one logical transaction
/// and is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PoolCreated {
        pool: ResourcePool,
    },
    UnitStatusChanged {
        pool_id: Ulid,
        unit_id: Ulid,
        status: UnitStatus,
    },
    SlotCreated {
        slot: Slot,
    },
    SlotEnabledChanged {
        slot_id: Ulid,
        enabled: bool,
    },
    SlotDeleted {
        slot_id: Ulid,
    },
    /// Records an allocation row as given (state included).
    AllocationGranted {
        allocation: Allocation,
    },
    AllocationStateChanged {
        id: Ulid,
        slot_id: Ulid,
        requester_id: RequesterId,
        state: AllocationState,
        at: Ms,
    },
    /// Records a waitlist row as given (state included).
    WaitlistEnqueued {
        entry: WaitlistEntry,
    },
    WaitlistClosed {
        id: Ulid,
        slot_id: Ulid,
        requester_id: RequesterId,
        state: WaitlistState,
        at: Ms,
    },
}

impl Event {
    /// Slot the event is applied under, `None` for pool-level events.
    pub fn slot_id(&self) -> Option<Ulid> {
        match self {
            Event::SlotCreated { slot } => Some(slot.id),
            Event::SlotEnabledChanged { slot_id, .. }
            | Event::SlotDeleted { slot_id }
            | Event::AllocationStateChanged { slot_id, .. }
            | Event::WaitlistClosed { slot_id, .. } => Some(*slot_id),
            Event::AllocationGranted { allocation } => Some(allocation.slot_id),
            Event::WaitlistEnqueued { entry } => Some(entry.slot_id),
            Event::PoolCreated { .. } | Event::UnitStatusChanged { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub events: Vec<Event>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub slot: Slot,
    pub unit_count: u32,
    pub units_in_use: u32,
    pub available: u32,
    pub waiting: u32,
    pub can_book_combined: bool,
    pub can_book_separate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    pub slot: Slot,
    pub allocations: Vec<Allocation>,
    /// Waiting entries in queue order.
    pub queue: Vec<WaitlistEntry>,
}

/// An allocation together with the slot it is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub allocation: Allocation,
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub entry: WaitlistEntry,
    pub slot: Slot,
}
