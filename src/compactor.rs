use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                info!("compacted WAL after {appends} appends");
                metrics::counter!(crate::observability::COMPACTIONS_TOTAL, "status" => "ok")
                    .increment(1);
            }
            Err(e) => {
                warn!("WAL compaction failed: {e}");
                metrics::counter!(crate::observability::COMPACTIONS_TOTAL, "status" => "error")
                    .increment(1);
            }
        }
    }
}
