use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::error::{EngineError, Entity, InvalidStateReason};
use super::ledger::{Ledger, PoolCapacity};
use super::{Engine, SlotTx};

/// Convert waiting entries into allocations, strictly in queue order.
///
/// Stops at the first entry that does not fit: a smaller request further back never
/// overtakes a larger one ahead of it. Positions of whoever is left are renumbered
/// densely as each entry leaves the queue.
///
/// Nothing is promoted once the slot has started; the sweep expires that queue.
pub(super) fn plan_promotion(tx: &mut SlotTx, pool: PoolCapacity, now: Ms) -> Vec<Allocation> {
    if tx.book.slot.span.start <= now {
        return Vec::new();
    }
    let order: Vec<(Ulid, RequesterId, LoadKind, u32)> = tx
        .book
        .queue()
        .into_iter()
        .map(|e| (e.id, e.requester_id, e.load_kind, e.units))
        .collect();

    let mut promoted = Vec::new();
    for (entry_id, requester_id, load_kind, units) in order {
        let available = Ledger::of(&tx.book, pool).available();
        if available == 0 || available < units {
            break;
        }
        let allocation = Allocation {
            id: Ulid::new(),
            requester_id,
            slot_id: tx.book.slot.id,
            load_kind,
            units,
            state: AllocationState::Granted,
            created_at: now,
            claimed_at: None,
            updated_at: now,
            promoted_from: Some(entry_id),
        };
        tx.push(Event::AllocationGranted { allocation: allocation.clone() });
        tx.push(Event::WaitlistClosed {
            id: entry_id,
            slot_id: tx.book.slot.id,
            requester_id,
            state: WaitlistState::Promoted,
            at: now,
        });
        promoted.push(allocation);
    }
    promoted
}

impl Engine {
    /// Leave the queue. Entries behind move up; if the leaving entry was blocking
    /// the head, promotion runs.
    pub async fn withdraw_waitlist(&self, entry_id: Ulid, now: Ms) -> Result<WaitlistEntry, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_row_write(Entity::WaitlistEntry, &entry_id).await?;
        let entry = guard
            .entry(entry_id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::WaitlistEntry, entry_id))?;
        if !entry.is_waiting() {
            return Err(EngineError::InvalidState(InvalidStateReason::EntryClosed {
                id: entry_id,
                state: entry.state,
            }));
        }

        let pool = self.pool_capacity(guard.slot.pool_id).await?;
        let mut tx = SlotTx::begin(&guard);
        tx.push(Event::WaitlistClosed {
            id: entry_id,
            slot_id: entry.slot_id,
            requester_id: entry.requester_id,
            state: WaitlistState::Withdrawn,
            at: now,
        });
        let promoted = plan_promotion(&mut tx, pool, now);
        let closed = tx
            .book
            .entry(entry_id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::WaitlistEntry, entry_id))?;
        self.commit_slot(&mut guard, tx).await?;

        if !promoted.is_empty() {
            metrics::counter!(observability::PROMOTIONS_TOTAL).increment(promoted.len() as u64);
        }
        tracing::info!(entry = %entry_id, slot = %entry.slot_id, "waitlist entry withdrawn");
        Ok(closed)
    }

    /// Run promotion for a slot. Normally triggered by the operation that frees
    /// capacity; exposed for operators and the unit-repair path.
    pub async fn promote(&self, slot_id: Ulid, now: Ms) -> Result<Vec<Allocation>, EngineError> {
        let _gate = self.write_gate.read().await;
        self.promote_unlocked(slot_id, now).await
    }

    /// Promotion for callers that already hold the write gate.
    pub(super) async fn promote_unlocked(&self, slot_id: Ulid, now: Ms) -> Result<Vec<Allocation>, EngineError> {
        let mut guard = self.lock_slot(slot_id).await?;
        if guard.queue_len() == 0 {
            return Ok(Vec::new());
        }
        let pool = self.pool_capacity(guard.slot.pool_id).await?;
        let mut tx = SlotTx::begin(&guard);
        let promoted = plan_promotion(&mut tx, pool, now);
        self.commit_slot(&mut guard, tx).await?;
        if !promoted.is_empty() {
            metrics::counter!(observability::PROMOTIONS_TOTAL).increment(promoted.len() as u64);
            tracing::info!(slot = %slot_id, "promoted {} waitlist entries", promoted.len());
        }
        Ok(promoted)
    }
}
