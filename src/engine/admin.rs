use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::config::OperatingWindow;
use crate::lattice::{self, date_of, LatticePool};
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::error::{ConflictReason, EngineError, Entity, InvalidStateReason};
use super::{apply_to_pool, Engine, SlotTx};

/// Outcome of generating slots over a date range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub created: Vec<Slot>,
    /// Windows that already had a slot at the same `(pool, start)`.
    pub existing: usize,
    /// Windows that would overlap a differently shaped slot of the same pool.
    pub skipped_overlapping: usize,
    pub closed_days: Vec<NaiveDate>,
    pub malformed_days: Vec<NaiveDate>,
}

impl Engine {
    pub async fn create_pool(&self, id: Ulid, name: Option<String>, unit_count: u32) -> Result<ResourcePool, EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("pool name too long"));
        }
        if unit_count == 0 || unit_count as usize > MAX_UNITS_PER_POOL {
            return Err(EngineError::LimitExceeded("unit count out of range"));
        }
        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.pools.len() >= MAX_POOLS {
            return Err(EngineError::LimitExceeded("too many pools"));
        }
        if self.pools.contains_key(&id) {
            return Err(EngineError::Conflict(ConflictReason::AlreadyExists(id)));
        }

        let pool = ResourcePool {
            id,
            name,
            ordinal: self.pools.len() as u32,
            units: (1..=unit_count)
                .map(|number| Unit {
                    id: Ulid::new(),
                    number,
                    status: UnitStatus::Available,
                })
                .collect(),
        };
        self.wal_append(Commit {
            events: vec![Event::PoolCreated { pool: pool.clone() }],
        })
        .await?;
        self.insert_pool(pool.clone());
        tracing::info!(pool = %id, "created pool #{} with {unit_count} units", pool.ordinal);
        Ok(pool)
    }

    /// Take a unit out of service or bring it back. A unit coming back runs
    /// promotion on every upcoming slot of its pool.
    pub async fn set_unit_availability(&self, unit_id: Ulid, status: UnitStatus, now: Ms) -> Result<Unit, EngineError> {
        let _gate = self.write_gate.read().await;
        let pool_id = self
            .unit_to_pool
            .get(&unit_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(Entity::Unit, unit_id))?;
        let pool = self
            .get_pool(&pool_id)
            .ok_or(EngineError::NotFound(Entity::Pool, pool_id))?;

        let (unit, returned) = {
            let mut guard = pool.write().await;
            let before = guard
                .units
                .iter()
                .find(|u| u.id == unit_id)
                .map(|u| u.status)
                .ok_or(EngineError::NotFound(Entity::Unit, unit_id))?;
            if before != status {
                let event = Event::UnitStatusChanged { pool_id, unit_id, status };
                self.wal_append(Commit { events: vec![event.clone()] }).await?;
                apply_to_pool(&mut guard, &event);
                metrics::counter!(observability::UNIT_STATUS_CHANGES_TOTAL, "status" => status.label()).increment(1);
                tracing::info!(unit = %unit_id, pool = %pool_id, "unit status {before:?} -> {status:?}");
            }
            let unit = guard
                .units
                .iter()
                .find(|u| u.id == unit_id)
                .cloned()
                .ok_or(EngineError::NotFound(Entity::Unit, unit_id))?;
            (unit, !before.is_available() && status.is_available())
        };

        // Pool lock released: slot locks come before the pool lock.
        if returned {
            let upcoming: Vec<Ulid> = self
                .pool_slots
                .get(&pool_id)
                .map(|refs| refs.iter().filter(|r| r.span.start > now).map(|r| r.id).collect())
                .unwrap_or_default();
            for slot_id in upcoming {
                if let Err(e) = self.promote_unlocked(slot_id, now).await {
                    tracing::warn!(slot = %slot_id, "promotion after unit repair failed: {e}");
                }
            }
        }
        Ok(unit)
    }

    /// Create the lattice of slots for `pools` on every date in `from..=to`.
    /// Idempotent per `(pool, start)`. Without an override each date uses its
    /// weekday's operating hours; closed and malformed days are reported.
    ///
    /// The stagger offset of a pool is its creation ordinal, not its index in
    /// `pool_ids`, so a pool's times are the same whichever subset is generated.
    pub async fn generate_slots(
        &self,
        pool_ids: &[Ulid],
        from: NaiveDate,
        to: NaiveDate,
        window_override: Option<OperatingWindow>,
    ) -> Result<GenerationReport, EngineError> {
        let mut report = GenerationReport::default();
        if to < from {
            return Ok(report);
        }
        if (to - from).num_days() + 1 > MAX_GENERATION_DAYS {
            return Err(EngineError::LimitExceeded("generation range too wide"));
        }

        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;

        let mut lattice_pools = Vec::with_capacity(pool_ids.len());
        for pool_id in pool_ids {
            let pool = self
                .get_pool(pool_id)
                .ok_or(EngineError::NotFound(Entity::Pool, *pool_id))?;
            lattice_pools.push(LatticePool {
                pool_id: *pool_id,
                stagger_index: pool.read().await.ordinal,
            });
        }

        for date in from.iter_days().take_while(|d| *d <= to) {
            let Some(window) = window_override.or_else(|| self.policy.hours.for_day(date.weekday())) else {
                report.closed_days.push(date);
                continue;
            };
            let specs = match lattice::generate(
                &lattice_pools,
                date,
                window,
                self.policy.slot_minutes,
                self.policy.stagger_minutes,
            ) {
                Ok(specs) => specs,
                Err(e) => {
                    tracing::warn!(%date, "no slots generated: {e}");
                    report.malformed_days.push(date);
                    continue;
                }
            };
            for spec in specs {
                if self.slot_keys.contains_key(&(spec.pool_id, spec.span.start)) {
                    report.existing += 1;
                    continue;
                }
                let clashes_existing = self.overlapping_slot(spec.pool_id, &spec.span).is_some();
                let clashes_new = report
                    .created
                    .iter()
                    .any(|s| s.pool_id == spec.pool_id && s.span.overlaps(&spec.span));
                if clashes_existing || clashes_new {
                    report.skipped_overlapping += 1;
                    continue;
                }
                report.created.push(Slot {
                    id: Ulid::new(),
                    pool_id: spec.pool_id,
                    date: spec.date,
                    span: spec.span,
                    enabled: true,
                });
            }
        }

        if !report.created.is_empty() {
            let events = report
                .created
                .iter()
                .map(|slot| Event::SlotCreated { slot: slot.clone() })
                .collect();
            self.wal_append(Commit { events }).await?;
            for slot in &report.created {
                self.insert_slot(slot.clone());
            }
            metrics::counter!(observability::SLOTS_GENERATED_TOTAL).increment(report.created.len() as u64);
        }
        if report.skipped_overlapping > 0 {
            tracing::warn!(
                "{} generated windows overlap existing slots and were skipped",
                report.skipped_overlapping
            );
        }
        tracing::info!(
            %from,
            %to,
            "generated {} slots ({} existing, {} closed days)",
            report.created.len(),
            report.existing,
            report.closed_days.len()
        );
        Ok(report)
    }

    /// Add a single slot outside the lattice. Its date is the date of `span.start`.
    pub async fn create_slot(&self, pool_id: Ulid, span: Span) -> Result<Slot, EngineError> {
        if span.end <= span.start {
            return Err(EngineError::LimitExceeded("slot must end after it starts"));
        }
        if span.duration_ms() < MIN_SLOT_MINUTES as Ms * MINUTE_MS {
            return Err(EngineError::LimitExceeded("slot too short"));
        }
        if span.duration_ms() > MAX_SLOT_DURATION_MS {
            return Err(EngineError::LimitExceeded("slot too long"));
        }
        if !self.pools.contains_key(&pool_id) {
            return Err(EngineError::NotFound(Entity::Pool, pool_id));
        }

        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if let Some(existing) = self.slot_keys.get(&(pool_id, span.start)).map(|e| *e.value()) {
            return Err(EngineError::Conflict(ConflictReason::AlreadyExists(existing)));
        }
        if let Some(other) = self.overlapping_slot(pool_id, &span) {
            return Err(EngineError::Conflict(ConflictReason::OverlappingSlot(other)));
        }

        let slot = Slot {
            id: Ulid::new(),
            pool_id,
            date: date_of(span.start),
            span,
            enabled: true,
        };
        self.wal_append(Commit {
            events: vec![Event::SlotCreated { slot: slot.clone() }],
        })
        .await?;
        self.insert_slot(slot.clone());
        Ok(slot)
    }

    /// Disabling forces the slot's capacity to zero without touching its bookings.
    /// Re-enabling runs promotion.
    pub async fn set_slot_enabled(&self, slot_id: Ulid, enabled: bool, now: Ms) -> Result<Slot, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.lock_slot(slot_id).await?;
        if guard.slot.enabled == enabled {
            return Ok(guard.slot.clone());
        }
        let mut tx = SlotTx::begin(&guard);
        tx.push(Event::SlotEnabledChanged { slot_id, enabled });
        let promoted = if enabled {
            let pool = self.pool_capacity(guard.slot.pool_id).await?;
            super::waitlist::plan_promotion(&mut tx, pool, now)
        } else {
            Vec::new()
        };
        self.commit_slot(&mut guard, tx).await?;
        if !promoted.is_empty() {
            metrics::counter!(observability::PROMOTIONS_TOTAL).increment(promoted.len() as u64);
        }
        tracing::info!(slot = %slot_id, enabled, "slot availability changed");
        Ok(guard.slot.clone())
    }

    /// Remove a slot that nobody holds. Queued requests are withdrawn with it.
    pub async fn delete_slot(&self, slot_id: Ulid, now: Ms) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let mut guard = self.lock_slot(slot_id).await?;
        let active = guard.active_allocations().count() as u32;
        if active > 0 {
            return Err(EngineError::InvalidState(InvalidStateReason::SlotInUse { slot_id, active }));
        }

        let mut tx = SlotTx::begin(&guard);
        let waiting: Vec<(Ulid, RequesterId)> =
            guard.queue().into_iter().map(|e| (e.id, e.requester_id)).collect();
        for (id, requester_id) in waiting {
            tx.push(Event::WaitlistClosed {
                id,
                slot_id,
                requester_id,
                state: WaitlistState::Withdrawn,
                at: now,
            });
        }
        tx.push(Event::SlotDeleted { slot_id });
        self.commit_slot(&mut guard, tx).await?;
        self.remove_slot(&guard);
        tracing::info!(slot = %slot_id, "slot deleted");
        Ok(())
    }

    /// Another slot of `pool_id` whose window overlaps `span`.
    fn overlapping_slot(&self, pool_id: Ulid, span: &Span) -> Option<Ulid> {
        self.pool_slots
            .get(&pool_id)
            .and_then(|refs| refs.iter().find(|r| r.span.overlaps(span)).map(|r| r.id))
    }
}
