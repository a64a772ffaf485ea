use chrono::Datelike;
use ulid::Ulid;

use crate::lattice::date_of;
use crate::limits::MAX_ROWS_PER_SLOT;
use crate::model::*;
use crate::observability;

use super::error::{ConflictReason, EngineError, Entity, ExhaustionReason, InvalidStateReason, PolicyReason};
use super::ledger::{check_transition, Ledger, Shortfall};
use super::{Engine, Holding, SlotTx};

/// Result of a booking request that was not rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOutcome {
    Granted(Allocation),
    Waitlisted(WaitlistEntry),
}

impl AllocationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AllocationOutcome::Granted(_) => "granted",
            AllocationOutcome::Waitlisted(_) => "waitlisted",
        }
    }
}

/// Buffer rule: the candidate must keep at least `buffer` of idle time to every
/// other active allocation and waiting entry the requester holds on the same date.
pub(super) fn check_buffer(
    holdings: &[Holding],
    slot: &Slot,
    buffer: Ms,
) -> Result<(), EngineError> {
    for held in holdings.iter().filter(|h| h.date == slot.date && h.slot_id != slot.id) {
        let gap = held.span.separation(&slot.span);
        if gap.is_none_or(|g| g < buffer) {
            let reason = if held.queued {
                ConflictReason::WaitlistBuffer { entry_id: held.row_id, gap }
            } else {
                ConflictReason::Buffer { allocation_id: held.row_id, gap }
            };
            return Err(EngineError::Conflict(reason));
        }
    }
    Ok(())
}

impl Engine {
    /// Book `slot_id` for `requester`. Grants when the slot has room, queues the
    /// request when it is booked out, rejects otherwise.
    pub async fn request_allocation(
        &self,
        requester: RequesterId,
        slot_id: Ulid,
        load_kind: LoadKind,
        now: Ms,
    ) -> Result<AllocationOutcome, EngineError> {
        let result = self.request_allocation_inner(requester, slot_id, load_kind, now).await;
        self.release_requester_lock(&requester);
        let outcome = match &result {
            Ok(o) => o.label(),
            Err(e) => e.label(),
        };
        metrics::counter!(observability::ALLOCATION_REQUESTS_TOTAL, "outcome" => outcome).increment(1);
        match &result {
            Ok(o) => tracing::debug!(%requester, %slot_id, load = load_kind.label(), "request {}", o.label()),
            Err(e) => tracing::debug!(%requester, %slot_id, load = load_kind.label(), "request rejected: {e}"),
        }
        result
    }

    async fn request_allocation_inner(
        &self,
        requester: RequesterId,
        slot_id: Ulid,
        load_kind: LoadKind,
        now: Ms,
    ) -> Result<AllocationOutcome, EngineError> {
        let _gate = self.write_gate.read().await;
        let requester_lock = self.requester_lock(requester);
        let _serial = requester_lock.lock().await;
        let mut guard = self.lock_slot(slot_id).await?;
        let slot = guard.slot.clone();

        // 1. enabled
        if !slot.enabled {
            return Err(EngineError::InvalidState(InvalidStateReason::SlotDisabled(slot_id)));
        }
        // 2. timing and operating day
        if slot.date < date_of(now) || slot.span.start <= now {
            return Err(EngineError::PolicyViolation(PolicyReason::SlotInPast));
        }
        if slot.span.start < now + self.policy.lead_time {
            return Err(EngineError::PolicyViolation(PolicyReason::InsideLeadTime {
                lead_time: self.policy.lead_time,
            }));
        }
        if self.policy.hours.for_day(slot.date.weekday()).is_none() {
            return Err(EngineError::PolicyViolation(PolicyReason::ClosedDay(slot.date)));
        }
        // 3. + 4. one active row per requester per slot
        if let Some(a) = guard.active_allocations().find(|a| a.requester_id == requester) {
            return Err(EngineError::Conflict(ConflictReason::AlreadyAllocated(a.id)));
        }
        if let Some(e) = guard.queue().into_iter().find(|e| e.requester_id == requester) {
            return Err(EngineError::Conflict(ConflictReason::AlreadyWaitlisted(e.id)));
        }
        // 5. buffer
        check_buffer(&self.holdings_of(&requester), &slot, self.policy.buffer)?;

        if guard.allocations.len() + guard.waitlist.len() >= MAX_ROWS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many rows on slot"));
        }

        // 6. capacity
        let units = self.policy.load_units.units_for(load_kind);
        let ledger = Ledger::of(&guard, self.pool_capacity(slot.pool_id).await?);
        let mut tx = SlotTx::begin(&guard);
        let outcome = match ledger.shortfall(units) {
            None => {
                let allocation = Allocation {
                    id: Ulid::new(),
                    requester_id: requester,
                    slot_id,
                    load_kind,
                    units,
                    state: AllocationState::Granted,
                    created_at: now,
                    claimed_at: None,
                    updated_at: now,
                    promoted_from: None,
                };
                tx.push(Event::AllocationGranted { allocation: allocation.clone() });
                AllocationOutcome::Granted(allocation)
            }
            Some(Shortfall::Disabled) => {
                return Err(EngineError::InvalidState(InvalidStateReason::SlotDisabled(slot_id)));
            }
            Some(Shortfall::UnitsUnavailable) => {
                return Err(EngineError::Exhausted(ExhaustionReason::UnitsUnavailable {
                    needed: units,
                    available_units: ledger.available(),
                }));
            }
            Some(Shortfall::Booked) => {
                let waiting = tx.book.queue_len();
                if waiting >= self.policy.waitlist_cap {
                    return Err(EngineError::Exhausted(ExhaustionReason::WaitlistFull {
                        cap: self.policy.waitlist_cap,
                    }));
                }
                let entry = WaitlistEntry {
                    id: Ulid::new(),
                    requester_id: requester,
                    slot_id,
                    load_kind,
                    units,
                    position: waiting + 1,
                    state: WaitlistState::Waiting,
                    created_at: now,
                    closed_at: None,
                };
                tx.push(Event::WaitlistEnqueued { entry: entry.clone() });
                AllocationOutcome::Waitlisted(entry)
            }
        };

        self.commit_slot(&mut guard, tx).await?;
        Ok(outcome)
    }

    /// Drop-off: `granted -> claimed`.
    pub async fn claim_allocation(&self, id: Ulid, now: Ms) -> Result<Allocation, EngineError> {
        self.transition(id, AllocationState::Claimed, now).await
    }

    /// `claimed -> in_progress`.
    pub async fn start_allocation(&self, id: Ulid, now: Ms) -> Result<Allocation, EngineError> {
        self.transition(id, AllocationState::InProgress, now).await
    }

    /// `in_progress -> completed`. The freed units go to the waitlist.
    pub async fn complete_allocation(&self, id: Ulid, now: Ms) -> Result<Allocation, EngineError> {
        self.transition(id, AllocationState::Completed, now).await
    }

    /// Cancel on behalf of the requester. A granted allocation cannot be
    /// cancelled inside the cutoff before its start.
    pub async fn cancel_allocation(&self, id: Ulid, now: Ms) -> Result<Allocation, EngineError> {
        self.transition(id, AllocationState::Cancelled, now).await
    }

    /// Attendant action; the sweep does the same for overdue allocations.
    pub async fn mark_no_show(&self, id: Ulid, now: Ms) -> Result<Allocation, EngineError> {
        self.transition(id, AllocationState::NoShow, now).await
    }

    async fn transition(&self, id: Ulid, to: AllocationState, now: Ms) -> Result<Allocation, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_row_write(Entity::Allocation, &id).await?;
        let (allocation, promoted) = self.transition_locked(&mut guard, id, to, now).await?;
        if to == AllocationState::NoShow {
            metrics::counter!(observability::NO_SHOWS_TOTAL, "source" => "manual").increment(1);
        }
        tracing::info!(
            allocation = %id,
            slot = %allocation.slot_id,
            "allocation {} ({} promoted)",
            to.label(),
            promoted.len()
        );
        Ok(allocation)
    }

    /// Move an allocation to `to` under the caller's slot lock. When units are freed,
    /// promotion runs in the same commit. Returns the updated allocation and the
    /// allocations promoted from the waitlist.
    pub(super) async fn transition_locked(
        &self,
        guard: &mut SlotBook,
        id: Ulid,
        to: AllocationState,
        now: Ms,
    ) -> Result<(Allocation, Vec<Allocation>), EngineError> {
        let (from, requester_id) = {
            let current = check_transition(guard, id, to)?;
            (current.state, current.requester_id)
        };

        if to == AllocationState::Cancelled
            && from == AllocationState::Granted
            && let Some(cutoff) = self.policy.cancel_cutoff
            && now > guard.slot.span.start - cutoff
        {
            return Err(EngineError::PolicyViolation(PolicyReason::CancellationWindowClosed { cutoff }));
        }

        let mut tx = SlotTx::begin(guard);
        tx.push(Event::AllocationStateChanged {
            id,
            slot_id: guard.slot.id,
            requester_id,
            state: to,
            at: now,
        });

        let promoted = if to.is_terminal() {
            let pool = self.pool_capacity(guard.slot.pool_id).await?;
            super::waitlist::plan_promotion(&mut tx, pool, now)
        } else {
            Vec::new()
        };

        let updated = tx
            .book
            .allocation(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Allocation, id))?;
        self.commit_slot(guard, tx).await?;
        if !promoted.is_empty() {
            metrics::counter!(observability::PROMOTIONS_TOTAL).increment(promoted.len() as u64);
        }
        Ok((updated, promoted))
    }
}
