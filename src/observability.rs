use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total HTTP requests handled. Labels: operation, status.
pub const REQUESTS_TOTAL: &str = "fieldledger_requests_total";

/// Histogram: request latency in seconds. Labels: operation.
pub const REQUEST_DURATION_SECONDS: &str = "fieldledger_request_duration_seconds";

// ── Ledger ──────────────────────────────────────────────────────

/// Counter: supplies crossing into a stock-driven state by allocation. Labels: state.
pub const STOCK_ALERTS_TOTAL: &str = "fieldledger_stock_alerts_total";

/// Counter: WAL compactions run by the background compactor. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "fieldledger_compactions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fieldledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fieldledger_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Status label for a finished operation.
pub fn status_label<T>(result: &Result<T, crate::engine::EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    }
}
