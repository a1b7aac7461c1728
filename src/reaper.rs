use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};

/// Periodically move confirmed reservations that have ended to `completed`.
pub async fn run_completer(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_completions(&engine).await;
    }
}

/// One completion pass. Returns how many reservations were completed.
pub async fn sweep_completions(engine: &Engine) -> usize {
    let now = now_ms();
    let mut completed = 0;
    for id in engine.collect_due_completions(now) {
        match engine.complete_reservation(id, now).await {
            Ok(_) => completed += 1,
            // Cancelled or already completed between collect and complete.
            Err(e) => debug!("completion skip {id}: {e}"),
        }
    }
    if completed > 0 {
        info!("completed {completed} finished reservations");
    }
    completed
}

/// Compact the WAL once enough appends have accumulated since the last rewrite.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
