use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use tracing::info;

use crate::engine::{Engine, EngineError, GenerationReport};
use crate::lattice::date_of;
use crate::model::now_ms;

/// Background task that periodically reclaims no-shows and expires stale queues.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        engine.reclaim_overdue(now_ms()).await;
    }
}

/// Keep `days` days of slots (today included) generated for every pool.
pub async fn run_slot_topup(engine: Arc<Engine>, days: u32, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match topup_once(&engine, date_of(now_ms()), days).await {
            Ok(report) if !report.created.is_empty() => {
                info!("top-up created {} slots", report.created.len());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("slot top-up failed: {e}"),
        }
    }
}

pub async fn topup_once(engine: &Engine, today: NaiveDate, days: u32) -> Result<GenerationReport, EngineError> {
    if days == 0 {
        return Ok(GenerationReport::default());
    }
    let pools: Vec<_> = engine.pools().await.into_iter().map(|p| p.id).collect();
    if pools.is_empty() {
        return Ok(GenerationReport::default());
    }
    let last = today
        .checked_add_days(Days::new(u64::from(days - 1)))
        .unwrap_or(today);
    engine.generate_slots(&pools, today, last, None).await
}

/// Background task that compacts the WAL once enough commits piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            tracing::error!("wal compaction failed: {e}");
        }
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted wal after {appends} commits");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::engine::AllocationOutcome;
    use crate::lattice::instant;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::wal::Wal;
    use chrono::NaiveTime;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotline_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
    }

    fn at(h: u32, m: u32) -> Ms {
        instant(day(), NaiveTime::from_hms_opt(h, m, 0).unwrap())
    }

    #[tokio::test]
    async fn sweep_reclaims_unclaimed_allocation() {
        let path = test_wal_path("sweep_reclaims.wal");
        let engine = Engine::new(path, Policy::default(), Arc::new(NotifyHub::new())).unwrap();
        let pool = engine.create_pool(Ulid::new(), None, 2).await.unwrap();
        let slot = engine.create_slot(pool.id, Span::new(at(9, 0), at(10, 0))).await.unwrap();

        let AllocationOutcome::Granted(a) = engine
            .request_allocation(Ulid::new(), slot.id, LoadKind::Combined, at(6, 0))
            .await
            .unwrap()
        else {
            panic!("expected a grant");
        };

        // before the deadline nothing happens
        let early = engine.reclaim_overdue(at(8, 54)).await;
        assert!(early.reclaimed.is_empty());

        let report = engine.reclaim_overdue(at(8, 55)).await;
        assert_eq!(report.reclaimed, vec![a.id]);
        assert_eq!(engine.allocation(a.id).await.unwrap().allocation.state, AllocationState::NoShow);

        // second pass skips the terminal allocation
        let again = engine.reclaim_overdue(at(8, 56)).await;
        assert!(again.reclaimed.is_empty());
        assert_eq!(again.failures, 0);
    }

    #[tokio::test]
    async fn topup_is_idempotent() {
        let path = test_wal_path("topup_idempotent.wal");
        let engine = Engine::new(path, Policy::default(), Arc::new(NotifyHub::new())).unwrap();
        for _ in 0..2 {
            engine.create_pool(Ulid::new(), None, 2).await.unwrap();
        }

        let first = topup_once(&engine, day(), 3).await.unwrap();
        assert_eq!(first.created.len(), 2 * 12 * 3);
        let second = topup_once(&engine, day(), 3).await.unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.existing, 2 * 12 * 3);

        // extending the horizon only adds the new day
        let third = topup_once(&engine, day(), 4).await.unwrap();
        assert_eq!(third.created.len(), 2 * 12);
    }

    #[tokio::test]
    async fn topup_without_pools_does_nothing() {
        let path = test_wal_path("topup_no_pools.wal");
        let engine = Engine::new(path, Policy::default(), Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(topup_once(&engine, day(), 7).await.unwrap(), GenerationReport::default());
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let path = test_wal_path("compactor_threshold.wal");
        let engine = Engine::new(path.clone(), Policy::default(), Arc::new(NotifyHub::new())).unwrap();
        let pool = engine.create_pool(Ulid::new(), None, 2).await.unwrap();
        for h in 8..12 {
            engine.create_slot(pool.id, Span::new(at(h, 0), at(h + 1, 0))).await.unwrap();
        }

        assert!(!compact_if_needed(&engine, 100).await.unwrap());
        assert!(compact_if_needed(&engine, 5).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // one pool commit, one commit per slot
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.commits.len(), 5);
    }
}
