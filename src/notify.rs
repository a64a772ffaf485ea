use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{AllocationState, Event, Ms, RequesterId, WaitlistState};

const CHANNEL_CAPACITY: usize = 256;

/// Domain events for notification collaborators. Fire-and-forget: a missing or
/// lagging subscriber never affects the state change that produced the notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    AllocationGranted {
        allocation_id: Ulid,
        requester_id: RequesterId,
        slot_id: Ulid,
    },
    AllocationPromotedFromWaitlist {
        allocation_id: Ulid,
        entry_id: Ulid,
        requester_id: RequesterId,
        slot_id: Ulid,
    },
    AllocationCompleted {
        allocation_id: Ulid,
        requester_id: RequesterId,
        slot_id: Ulid,
    },
    /// Marked no-show, by the sweep or by an attendant.
    AllocationExpired {
        allocation_id: Ulid,
        requester_id: RequesterId,
        slot_id: Ulid,
        at: Ms,
    },
    AllocationCancelled {
        allocation_id: Ulid,
        requester_id: RequesterId,
        slot_id: Ulid,
    },
    WaitlistJoined {
        entry_id: Ulid,
        requester_id: RequesterId,
        slot_id: Ulid,
        position: u32,
    },
}

impl Notice {
    /// The notice a committed event produces, if any.
    pub fn from_event(event: &Event) -> Option<Notice> {
        match event {
            Event::AllocationGranted { allocation } if allocation.state == AllocationState::Granted => {
                Some(match allocation.promoted_from {
                    Some(entry_id) => Notice::AllocationPromotedFromWaitlist {
                        allocation_id: allocation.id,
                        entry_id,
                        requester_id: allocation.requester_id,
                        slot_id: allocation.slot_id,
                    },
                    None => Notice::AllocationGranted {
                        allocation_id: allocation.id,
                        requester_id: allocation.requester_id,
                        slot_id: allocation.slot_id,
                    },
                })
            }
            Event::AllocationStateChanged {
                id,
                slot_id,
                requester_id,
                state,
                at,
            } => match state {
                AllocationState::Completed => Some(Notice::AllocationCompleted {
                    allocation_id: *id,
                    requester_id: *requester_id,
                    slot_id: *slot_id,
                }),
                AllocationState::NoShow => Some(Notice::AllocationExpired {
                    allocation_id: *id,
                    requester_id: *requester_id,
                    slot_id: *slot_id,
                    at: *at,
                }),
                AllocationState::Cancelled => Some(Notice::AllocationCancelled {
                    allocation_id: *id,
                    requester_id: *requester_id,
                    slot_id: *slot_id,
                }),
                _ => None,
            },
            Event::WaitlistEnqueued { entry } if entry.state == WaitlistState::Waiting => {
                Some(Notice::WaitlistJoined {
                    entry_id: entry.id,
                    requester_id: entry.requester_id,
                    slot_id: entry.slot_id,
                    position: entry.position,
                })
            }
            _ => None,
        }
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::AllocationGranted { .. } => "allocation_granted",
            Notice::AllocationPromotedFromWaitlist { .. } => "allocation_promoted",
            Notice::AllocationCompleted { .. } => "allocation_completed",
            Notice::AllocationExpired { .. } => "allocation_expired",
            Notice::AllocationCancelled { .. } => "allocation_cancelled",
            Notice::WaitlistJoined { .. } => "waitlist_joined",
        }
    }

    pub fn requester_id(&self) -> RequesterId {
        match self {
            Notice::AllocationGranted { requester_id, .. }
            | Notice::AllocationPromotedFromWaitlist { requester_id, .. }
            | Notice::AllocationCompleted { requester_id, .. }
            | Notice::AllocationExpired { requester_id, .. }
            | Notice::AllocationCancelled { requester_id, .. }
            | Notice::WaitlistJoined { requester_id, .. } => *requester_id,
        }
    }
}

/// Broadcast hub: one channel per requester plus a firehose of every notice.
pub struct NotifyHub {
    all: broadcast::Sender<Notice>,
    requesters: DashMap<RequesterId, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            requesters: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notice> {
        self.all.subscribe()
    }

    /// Subscribe to one requester's notices. Creates the channel if needed.
    pub fn subscribe(&self, requester: RequesterId) -> broadcast::Receiver<Notice> {
        let sender = self
            .requesters
            .entry(requester)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish. A requester channel whose listeners are all gone is dropped.
    pub fn send(&self, notice: Notice) {
        metrics::counter!(crate::observability::NOTICES_TOTAL, "kind" => notice.kind()).increment(1);
        let requester = notice.requester_id();
        let orphaned = match self.requesters.get(&requester) {
            Some(sender) => sender.send(notice.clone()).is_err(),
            None => false,
        };
        if orphaned {
            self.prune(&requester);
        }
        let _ = self.all.send(notice);
    }

    fn prune(&self, requester: &RequesterId) {
        self.requesters
            .remove_if(requester, |_, sender| sender.receiver_count() == 0);
    }
}
