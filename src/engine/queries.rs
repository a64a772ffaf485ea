use std::collections::BTreeMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::error::{EngineError, Entity};
use super::ledger::Ledger;
use super::Engine;

impl Engine {
    /// All pools in facility order.
    pub async fn pools(&self) -> Vec<ResourcePool> {
        let shared: Vec<_> = self.pools.iter().map(|e| e.value().clone()).collect();
        let mut pools: Vec<ResourcePool> =
            futures::future::join_all(shared.iter().map(|p| async move { p.read().await.clone() })).await;
        pools.sort_by_key(|p| p.ordinal);
        pools
    }

    pub async fn pool(&self, id: Ulid) -> Result<ResourcePool, EngineError> {
        let pool = self.get_pool(&id).ok_or(EngineError::NotFound(Entity::Pool, id))?;
        let guard = pool.read().await;
        Ok(guard.clone())
    }

    pub async fn slot(&self, id: Ulid) -> Result<Slot, EngineError> {
        let book = self.get_slot(&id).ok_or(EngineError::NotFound(Entity::Slot, id))?;
        let guard = book.read().await;
        Ok(guard.slot.clone())
    }

    /// Capacity of a slot right now.
    pub async fn ledger(&self, slot_id: Ulid) -> Result<Ledger, EngineError> {
        let book = self
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(Entity::Slot, slot_id))?;
        let guard = book.read().await;
        let pool = self.pool_capacity(guard.slot.pool_id).await?;
        Ok(Ledger::of(&guard, pool))
    }

    /// Slots of a date with their availability, by start time.
    pub async fn list_slots(&self, date: NaiveDate, pool: Option<Ulid>) -> Vec<SlotView> {
        let mut refs: Vec<(Ms, Ulid)> = self
            .pool_slots
            .iter()
            .filter(|e| pool.is_none_or(|p| p == *e.key()))
            .flat_map(|e| {
                e.value()
                    .iter()
                    .filter(|r| r.date == date)
                    .map(|r| (r.span.start, r.id))
                    .collect::<Vec<_>>()
            })
            .collect();
        refs.sort();

        let combined = self.policy.load_units.units_for(LoadKind::Combined);
        let separated = self.policy.load_units.units_for(LoadKind::SeparateWhites);
        let mut views = Vec::with_capacity(refs.len());
        for (_, slot_id) in refs {
            let Some(book) = self.get_slot(&slot_id) else { continue };
            let guard = book.read().await;
            let Ok(pool) = self.pool_capacity(guard.slot.pool_id).await else { continue };
            let ledger = Ledger::of(&guard, pool);
            views.push(SlotView {
                slot: guard.slot.clone(),
                unit_count: ledger.unit_count,
                units_in_use: ledger.units_in_use,
                available: ledger.available(),
                waiting: guard.queue_len(),
                can_book_combined: ledger.shortfall(combined).is_none(),
                can_book_separate: ledger.shortfall(separated).is_none(),
            });
        }
        views
    }

    /// Every allocation of a slot plus its queue.
    pub async fn slot_roster(&self, slot_id: Ulid) -> Result<Roster, EngineError> {
        let book = self
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(Entity::Slot, slot_id))?;
        let guard = book.read().await;
        Ok(Roster {
            slot: guard.slot.clone(),
            allocations: guard.allocations.clone(),
            queue: guard.queue().into_iter().cloned().collect(),
        })
    }

    pub async fn allocation(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let slot_id = self
            .row_to_slot
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(Entity::Allocation, id))?;
        let book = self
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(Entity::Allocation, id))?;
        let guard = book.read().await;
        let allocation = guard
            .allocation(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Allocation, id))?;
        Ok(BookingInfo {
            allocation,
            slot: guard.slot.clone(),
        })
    }

    /// A requester's allocations, latest slot first. An empty `states` means all.
    pub async fn allocations_for_requester(
        &self,
        requester: RequesterId,
        states: &[AllocationState],
    ) -> Vec<BookingInfo> {
        let mut out = Vec::new();
        for (slot_id, rows) in self.rows_by_slot(&requester) {
            let Some(book) = self.get_slot(&slot_id) else { continue };
            let guard = book.read().await;
            for id in rows {
                if let Some(a) = guard.allocation(id)
                    && (states.is_empty() || states.contains(&a.state))
                {
                    out.push(BookingInfo {
                        allocation: a.clone(),
                        slot: guard.slot.clone(),
                    });
                }
            }
        }
        out.sort_by(|a, b| {
            b.slot
                .span
                .start
                .cmp(&a.slot.span.start)
                .then(b.allocation.created_at.cmp(&a.allocation.created_at))
        });
        out
    }

    /// A requester's waiting entries, soonest slot first.
    pub async fn waitlist_for_requester(&self, requester: RequesterId) -> Vec<QueueInfo> {
        let mut out = Vec::new();
        for (slot_id, rows) in self.rows_by_slot(&requester) {
            let Some(book) = self.get_slot(&slot_id) else { continue };
            let guard = book.read().await;
            for id in rows {
                if let Some(e) = guard.entry(id)
                    && e.is_waiting()
                {
                    out.push(QueueInfo {
                        entry: e.clone(),
                        slot: guard.slot.clone(),
                    });
                }
            }
        }
        out.sort_by_key(|q| (q.slot.span.start, q.entry.position));
        out
    }

    /// Attendant view of a date: active allocations ordered by start.
    pub async fn day_sheet(&self, date: NaiveDate) -> Vec<BookingInfo> {
        let slot_ids: Vec<Ulid> = self
            .pool_slots
            .iter()
            .flat_map(|e| {
                e.value()
                    .iter()
                    .filter(|r| r.date == date)
                    .map(|r| r.id)
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut out = Vec::new();
        for slot_id in slot_ids {
            let Some(book) = self.get_slot(&slot_id) else { continue };
            let guard = book.read().await;
            out.extend(guard.active_allocations().map(|a| BookingInfo {
                allocation: a.clone(),
                slot: guard.slot.clone(),
            }));
        }
        out.sort_by_key(|b| (b.slot.span.start, b.allocation.created_at, b.allocation.id));
        out
    }

    /// Ids a requester owns, grouped by slot so each slot is locked once.
    fn rows_by_slot(&self, requester: &RequesterId) -> BTreeMap<Ulid, Vec<Ulid>> {
        let ids = self
            .requester_rows
            .get(requester)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut grouped: BTreeMap<Ulid, Vec<Ulid>> = BTreeMap::new();
        for id in ids {
            if let Some(slot_id) = self.row_to_slot.get(&id).map(|e| *e.value()) {
                grouped.entry(slot_id).or_default().push(id);
            }
        }
        grouped
    }
}
