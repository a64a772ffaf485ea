use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use ulid::Ulid;

use slotline::config::DaemonConfig;
use slotline::engine::Engine;
use slotline::notify::NotifyHub;
use slotline::reaper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = DaemonConfig::from_env()?;
    slotline::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("slotline.wal");

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(wal_path.clone(), config.policy.clone(), notify.clone())?);

    if engine.pools().await.is_empty() {
        for n in 1..=config.pools {
            engine
                .create_pool(Ulid::new(), Some(format!("pair {n}")), config.units_per_pool)
                .await?;
        }
        info!("bootstrapped {} pools of {} units", config.pools, config.units_per_pool);
    }

    info!("slotline started");
    info!("  wal: {}", wal_path.display());
    info!("  sweep every {:?}, top-up {} days", config.sweep_interval, config.topup_days);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let tasks = [
        tokio::spawn(reaper::run_reaper(engine.clone(), config.sweep_interval)),
        tokio::spawn(reaper::run_slot_topup(
            engine.clone(),
            config.topup_days,
            Duration::from_secs(3600),
        )),
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            config.compact_threshold,
            Duration::from_secs(60),
        )),
        tokio::spawn(log_notices(notify.clone())),
    ];

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping background tasks");
    for task in &tasks {
        task.abort();
    }
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction skipped: {e}");
    }
    info!("slotline stopped");
    Ok(())
}

/// Stand-in delivery channel: every notice goes to the log.
async fn log_notices(notify: Arc<NotifyHub>) {
    let mut rx = notify.subscribe_all();
    loop {
        match rx.recv().await {
            Ok(notice) => info!(requester = %notice.requester_id(), "notice {}: {notice:?}", notice.kind()),
            Err(RecvError::Lagged(n)) => tracing::warn!("notice log lagged, {n} notices dropped"),
            Err(RecvError::Closed) => break,
        }
    }
}
