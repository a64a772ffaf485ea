use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::error::EngineError;
use super::{Engine, SharedSlotBook, SlotTx};

/// What one sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Allocations moved to `no_show`.
    pub reclaimed: Vec<Ulid>,
    /// Allocations created by promotions the reclamations triggered.
    pub promoted: Vec<Ulid>,
    /// Waiting entries of slots that have started.
    pub expired_entries: Vec<Ulid>,
    /// Slots the sweep failed on; logged and skipped.
    pub failures: usize,
}

/// Granted allocations past their check-in deadline, and whether the slot has
/// started with people still queued.
fn overdue_in(book: &SlotBook, checkin_deadline: Ms, now: Ms) -> (Vec<Ulid>, bool) {
    let deadline = book.slot.span.start - checkin_deadline;
    let overdue = book
        .allocations
        .iter()
        .filter(|a| a.state == AllocationState::Granted && deadline <= now)
        .map(|a| a.id)
        .collect();
    let stale_queue = book.slot.span.start <= now && book.queue_len() > 0;
    (overdue, stale_queue)
}

impl Engine {
    /// Reclaim units of granted allocations nobody checked in for by
    /// `start - checkin_deadline`, promoting from the queue in the same commit, then
    /// expire queues of slots that have started.
    ///
    /// Safe against concurrent cancellation: every candidate is re-checked under
    /// the slot lock and terminal allocations are skipped.
    pub async fn reclaim_overdue(&self, now: Ms) -> SweepReport {
        let started = std::time::Instant::now();
        let mut report = SweepReport::default();

        // Collect first; DashMap refs must not live across awaits.
        let books: Vec<(Ulid, SharedSlotBook)> = self
            .slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        for (slot_id, book) in books {
            let (overdue, stale_queue) = {
                let guard = book.read().await;
                overdue_in(&guard, self.policy.checkin_deadline, now)
            };
            if overdue.is_empty() && !stale_queue {
                continue;
            }
            if let Err(e) = self.sweep_slot(slot_id, now, &mut report).await {
                report.failures += 1;
                metrics::counter!(observability::SWEEP_FAILURES_TOTAL).increment(1);
                tracing::warn!(slot = %slot_id, "sweep skipped slot: {e}");
            }
        }

        metrics::histogram!(observability::SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if !report.reclaimed.is_empty() {
            metrics::counter!(observability::NO_SHOWS_TOTAL, "source" => "sweep")
                .increment(report.reclaimed.len() as u64);
        }
        if !report.promoted.is_empty() {
            metrics::counter!(observability::PROMOTIONS_TOTAL).increment(report.promoted.len() as u64);
        }
        if !report.expired_entries.is_empty() {
            metrics::counter!(observability::WAITLIST_EXPIRED_TOTAL).increment(report.expired_entries.len() as u64);
        }
        if report != SweepReport::default() {
            tracing::info!(
                "sweep: {} no-shows, {} promoted, {} queue entries expired, {} failures",
                report.reclaimed.len(),
                report.promoted.len(),
                report.expired_entries.len(),
                report.failures
            );
        }
        report
    }

    /// One slot, one commit: all no-shows with their promotions, then queue expiry.
    async fn sweep_slot(&self, slot_id: Ulid, now: Ms, report: &mut SweepReport) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.lock_slot(slot_id).await?;
        let (overdue, _) = overdue_in(&guard, self.policy.checkin_deadline, now);

        let mut tx = SlotTx::begin(&guard);
        let mut reclaimed = Vec::new();
        for id in overdue {
            let Some(a) = tx.book.allocation(id) else { continue };
            // Cancelled or claimed since the scan.
            if a.state != AllocationState::Granted {
                continue;
            }
            let requester_id = a.requester_id;
            tx.push(Event::AllocationStateChanged {
                id,
                slot_id,
                requester_id,
                state: AllocationState::NoShow,
                at: now,
            });
            reclaimed.push(id);
        }

        let mut promoted = Vec::new();
        if !reclaimed.is_empty() {
            let pool = self.pool_capacity(guard.slot.pool_id).await?;
            promoted = super::waitlist::plan_promotion(&mut tx, pool, now);
        }

        let mut expired = Vec::new();
        if tx.book.slot.span.start <= now {
            let waiting: Vec<(Ulid, RequesterId)> =
                tx.book.queue().into_iter().map(|e| (e.id, e.requester_id)).collect();
            for (id, requester_id) in waiting {
                tx.push(Event::WaitlistClosed {
                    id,
                    slot_id,
                    requester_id,
                    state: WaitlistState::Expired,
                    at: now,
                });
                expired.push(id);
            }
        }

        self.commit_slot(&mut guard, tx).await?;
        for id in &reclaimed {
            tracing::info!(allocation = %id, slot = %slot_id, "no-show reclaimed");
        }
        report.reclaimed.extend(reclaimed);
        report.promoted.extend(promoted.iter().map(|a| a.id));
        report.expired_entries.extend(expired);
        Ok(())
    }
}
