mod admin;
mod allocation;
mod error;
mod expiry;
mod ledger;
mod queries;
mod waitlist;

pub use admin::GenerationReport;
pub use allocation::AllocationOutcome;
pub use error::{
    ConflictReason, EngineError, Entity, ErrorKind, ExhaustionReason, InvalidStateReason, PolicyReason,
};
pub use expiry::SweepReport;
pub use ledger::{Ledger, PoolCapacity, Shortfall};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::config::Policy;
use crate::model::*;
use crate::notify::{Notice, NotifyHub};
use crate::wal::Wal;

pub type SharedSlotBook = Arc<RwLock<SlotBook>>;
pub type SharedPool = Arc<RwLock<ResourcePool>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type Pending = (Commit, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("wal flush failed for {} commits: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Engine state ─────────────────────────────────────────

/// Immutable facts about a slot, indexed per pool without taking the slot lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct SlotRef {
    pub id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
}

/// An active allocation or a waiting entry, indexed per requester for the buffer
/// rule. Waiting entries count so that a later promotion can never land next to
/// an allocation granted while the entry was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Holding {
    pub row_id: Ulid,
    pub queued: bool,
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
}

pub struct Engine {
    pub(super) policy: Policy,
    pub(super) pools: DashMap<Ulid, SharedPool>,
    pub(super) slots: DashMap<Ulid, SharedSlotBook>,
    /// `(pool, start)` → slot. The uniqueness key of a slot.
    pub(super) slot_keys: DashMap<(Ulid, Ms), Ulid>,
    pub(super) pool_slots: DashMap<Ulid, Vec<SlotRef>>,
    pub(super) unit_to_pool: DashMap<Ulid, Ulid>,
    /// Allocation / waitlist entry id → slot id.
    pub(super) row_to_slot: DashMap<Ulid, Ulid>,
    /// Requester → every allocation and waitlist entry id they own.
    pub(super) requester_rows: DashMap<RequesterId, Vec<Ulid>>,
    pub(super) holdings: DashMap<RequesterId, Vec<Holding>>,
    pub(super) requester_locks: DashMap<RequesterId, Arc<Mutex<()>>>,
    /// Serializes pool and slot creation so uniqueness checks and inserts are atomic.
    pub(super) catalog_lock: Mutex<()>,
    /// Every mutation holds this shared; compaction holds it exclusively.
    pub(super) write_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Pending changes to one slot. Events are applied to a scratch copy as they are
/// planned so later decisions in the same transaction see earlier ones.
pub(super) struct SlotTx {
    pub book: SlotBook,
    pub events: Vec<Event>,
}

impl SlotTx {
    pub fn begin(book: &SlotBook) -> Self {
        Self {
            book: book.clone(),
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, event: Event) {
        apply_to_book(&mut self.book, &event);
        self.events.push(event);
    }
}

/// Apply a slot-scoped event to its book (caller holds the lock).
fn apply_to_book(book: &mut SlotBook, event: &Event) {
    match event {
        Event::SlotEnabledChanged { enabled, .. } => book.slot.enabled = *enabled,
        Event::AllocationGranted { allocation } => {
            book.allocations.retain(|a| a.id != allocation.id);
            book.allocations.push(allocation.clone());
        }
        Event::AllocationStateChanged { id, state, at, .. } => {
            if let Some(a) = book.allocation_mut(*id) {
                a.state = *state;
                a.updated_at = *at;
                if *state == AllocationState::Claimed {
                    a.claimed_at = Some(*at);
                }
            }
        }
        Event::WaitlistEnqueued { entry } => {
            book.waitlist.retain(|e| e.id != entry.id);
            book.waitlist.push(entry.clone());
            book.reindex_waitlist();
        }
        Event::WaitlistClosed { id, state, at, .. } => {
            if let Some(e) = book.entry_mut(*id) {
                e.state = *state;
                e.closed_at = Some(*at);
            }
            book.reindex_waitlist();
        }
        // Slot lifecycle and pool events are handled at the map level.
        Event::SlotCreated { .. }
        | Event::SlotDeleted { .. }
        | Event::PoolCreated { .. }
        | Event::UnitStatusChanged { .. } => {}
    }
}

fn apply_to_pool(pool: &mut ResourcePool, event: &Event) {
    if let Event::UnitStatusChanged { unit_id, status, .. } = event
        && let Some(unit) = pool.unit_mut(*unit_id)
    {
        unit.status = *status;
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, policy: Policy, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut engine = Self {
            policy,
            pools: DashMap::new(),
            slots: DashMap::new(),
            slot_keys: DashMap::new(),
            pool_slots: DashMap::new(),
            unit_to_pool: DashMap::new(),
            row_to_slot: DashMap::new(),
            requester_rows: DashMap::new(),
            holdings: DashMap::new(),
            requester_locks: DashMap::new(),
            catalog_lock: Mutex::new(()),
            write_gate: RwLock::new(()),
            wal_tx,
            notify,
        };

        let mut events = 0usize;
        for commit in &replay.commits {
            for event in &commit.events {
                engine.apply_replayed(event);
                events += 1;
            }
        }
        if events > 0 {
            tracing::info!(
                "replayed {} commits ({events} events): {} pools, {} slots",
                replay.commits.len(),
                engine.pools.len(),
                engine.slots.len()
            );
        }
        Ok(engine)
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Replay is single-threaded and owns every `Arc`, so state is reached through
    /// `get_mut` instead of locks.
    fn apply_replayed(&mut self, event: &Event) {
        match event {
            Event::PoolCreated { pool } => self.insert_pool(pool.clone()),
            Event::UnitStatusChanged { pool_id, .. } => {
                if let Some(mut entry) = self.pools.get_mut(pool_id)
                    && let Some(lock) = Arc::get_mut(entry.value_mut())
                {
                    apply_to_pool(lock.get_mut(), event);
                }
            }
            Event::SlotCreated { slot } => self.insert_slot(slot.clone()),
            Event::SlotDeleted { slot_id } => {
                let book = self
                    .slots
                    .get_mut(slot_id)
                    .and_then(|mut entry| Arc::get_mut(entry.value_mut()).map(|l| l.get_mut().clone()));
                if let Some(book) = book {
                    self.remove_slot(&book);
                }
            }
            other => {
                let Some(slot_id) = other.slot_id() else { return };
                let slot = match self.slots.get_mut(&slot_id) {
                    Some(mut entry) => match Arc::get_mut(entry.value_mut()) {
                        Some(lock) => {
                            let book = lock.get_mut();
                            apply_to_book(book, other);
                            book.slot.clone()
                        }
                        None => return,
                    },
                    None => return,
                };
                self.index_event(other, &slot);
            }
        }
    }

    // ── Map-level inserts and removals ───────────────────

    pub(super) fn insert_pool(&self, pool: ResourcePool) {
        for unit in &pool.units {
            self.unit_to_pool.insert(unit.id, pool.id);
        }
        self.pool_slots.entry(pool.id).or_default();
        self.pools.insert(pool.id, Arc::new(RwLock::new(pool)));
    }

    pub(super) fn insert_slot(&self, slot: Slot) {
        self.slot_keys.insert((slot.pool_id, slot.span.start), slot.id);
        self.pool_slots.entry(slot.pool_id).or_default().push(SlotRef {
            id: slot.id,
            date: slot.date,
            span: slot.span,
        });
        self.slots.insert(slot.id, Arc::new(RwLock::new(SlotBook::new(slot))));
    }

    pub(super) fn remove_slot(&self, book: &SlotBook) {
        let slot = &book.slot;
        self.slots.remove(&slot.id);
        self.slot_keys.remove(&(slot.pool_id, slot.span.start));
        if let Some(mut refs) = self.pool_slots.get_mut(&slot.pool_id) {
            refs.retain(|r| r.id != slot.id);
        }
        let rows = book
            .allocations
            .iter()
            .map(|a| (a.id, a.requester_id))
            .chain(book.waitlist.iter().map(|e| (e.id, e.requester_id)));
        for (row, requester) in rows {
            self.row_to_slot.remove(&row);
            if let Some(mut ids) = self.requester_rows.get_mut(&requester) {
                ids.retain(|id| *id != row);
            }
            if let Some(mut held) = self.holdings.get_mut(&requester) {
                held.retain(|h| h.row_id != row);
            }
        }
    }

    fn hold(&self, requester: RequesterId, holding: Holding) {
        let mut held = self.holdings.entry(requester).or_default();
        held.retain(|h| h.row_id != holding.row_id);
        held.push(holding);
    }

    fn release_hold(&self, requester: &RequesterId, row_id: Ulid) {
        let emptied = match self.holdings.get_mut(requester) {
            Some(mut held) => {
                held.retain(|h| h.row_id != row_id);
                held.is_empty()
            }
            None => false,
        };
        if emptied {
            self.holdings.remove_if(requester, |_, held| held.is_empty());
        }
    }

    /// Keep the secondary indexes in step with a slot-scoped event.
    fn index_event(&self, event: &Event, slot: &Slot) {
        match event {
            Event::AllocationGranted { allocation } => {
                self.row_to_slot.insert(allocation.id, allocation.slot_id);
                let mut rows = self.requester_rows.entry(allocation.requester_id).or_default();
                if !rows.contains(&allocation.id) {
                    rows.push(allocation.id);
                }
                drop(rows);
                if allocation.state.is_active() {
                    self.hold(
                        allocation.requester_id,
                        Holding {
                            row_id: allocation.id,
                            queued: false,
                            slot_id: slot.id,
                            date: slot.date,
                            span: slot.span,
                        },
                    );
                }
            }
            Event::AllocationStateChanged { id, requester_id, state, .. } if state.is_terminal() => {
                self.release_hold(requester_id, *id);
            }
            Event::WaitlistEnqueued { entry } => {
                self.row_to_slot.insert(entry.id, entry.slot_id);
                let mut rows = self.requester_rows.entry(entry.requester_id).or_default();
                if !rows.contains(&entry.id) {
                    rows.push(entry.id);
                }
                drop(rows);
                if entry.is_waiting() {
                    self.hold(
                        entry.requester_id,
                        Holding {
                            row_id: entry.id,
                            queued: true,
                            slot_id: slot.id,
                            date: slot.date,
                            span: slot.span,
                        },
                    );
                }
            }
            Event::WaitlistClosed { id, requester_id, .. } => {
                self.release_hold(requester_id, *id);
            }
            _ => {}
        }
    }

    // ── Persistence ──────────────────────────────────────

    /// Write a commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, commit: Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// Persist a slot transaction, then install its result and publish notices.
    /// On a WAL failure nothing is applied.
    pub(super) async fn commit_slot(&self, guard: &mut SlotBook, tx: SlotTx) -> Result<(), EngineError> {
        if tx.events.is_empty() {
            return Ok(());
        }
        self.wal_append(Commit { events: tx.events.clone() }).await?;
        *guard = tx.book;
        for event in &tx.events {
            self.index_event(event, &guard.slot);
            if let Some(notice) = Notice::from_event(event) {
                self.notify.send(notice);
            }
        }
        Ok(())
    }

    // ── Lookup helpers ───────────────────────────────────

    pub(super) fn get_slot(&self, id: &Ulid) -> Option<SharedSlotBook> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_pool(&self, id: &Ulid) -> Option<SharedPool> {
        self.pools.get(id).map(|e| e.value().clone())
    }

    /// Lock a slot for writing. Fails if the slot was deleted while waiting.
    pub(super) async fn lock_slot(&self, slot_id: Ulid) -> Result<OwnedRwLockWriteGuard<SlotBook>, EngineError> {
        let book = self
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(Entity::Slot, slot_id))?;
        let guard = book.write_owned().await;
        if !self.slots.contains_key(&slot_id) {
            return Err(EngineError::NotFound(Entity::Slot, slot_id));
        }
        Ok(guard)
    }

    /// Lookup row → slot, acquire the slot's write lock.
    pub(super) async fn resolve_row_write(
        &self,
        entity: Entity,
        row_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotBook>, EngineError> {
        let slot_id = self
            .row_to_slot
            .get(row_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(entity, *row_id))?;
        self.lock_slot(slot_id)
            .await
            .map_err(|_| EngineError::NotFound(entity, *row_id))
    }

    /// Unit counts of a pool at this instant.
    pub(super) async fn pool_capacity(&self, pool_id: Ulid) -> Result<PoolCapacity, EngineError> {
        let pool = self
            .get_pool(&pool_id)
            .ok_or(EngineError::NotFound(Entity::Pool, pool_id))?;
        let guard = pool.read().await;
        Ok(PoolCapacity {
            unit_count: guard.unit_count(),
            available_units: guard.available_units(),
        })
    }

    pub(super) fn requester_lock(&self, requester: RequesterId) -> Arc<Mutex<()>> {
        self.requester_locks.entry(requester).or_default().value().clone()
    }

    /// Forget a requester's lock once no task holds or waits on it.
    pub(super) fn release_requester_lock(&self, requester: &RequesterId) {
        self.requester_locks
            .remove_if(requester, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub(super) fn holdings_of(&self, requester: &RequesterId) -> Vec<Holding> {
        self.holdings
            .get(requester)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL as the minimal set of commits that recreates the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.write_gate.write().await;

        let mut snapshot = Vec::new();
        let mut pools: Vec<SharedPool> = self.pools.iter().map(|e| e.value().clone()).collect();
        let mut pool_rows = Vec::with_capacity(pools.len());
        for pool in pools.drain(..) {
            pool_rows.push(pool.read().await.clone());
        }
        pool_rows.sort_by_key(|p| p.ordinal);
        for pool in pool_rows {
            snapshot.push(Commit { events: vec![Event::PoolCreated { pool }] });
        }

        let books: Vec<SharedSlotBook> = self.slots.iter().map(|e| e.value().clone()).collect();
        for book in books {
            let guard = book.read().await;
            let mut events = vec![Event::SlotCreated { slot: guard.slot.clone() }];
            events.extend(guard.allocations.iter().map(|a| Event::AllocationGranted { allocation: a.clone() }));
            events.extend(guard.waitlist.iter().map(|e| Event::WaitlistEnqueued { entry: e.clone() }));
            snapshot.push(Commit { events });
        }

        let commits = snapshot.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!("compacted wal to {commits} commits");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
