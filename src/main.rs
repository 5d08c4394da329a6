use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use fieldledger::config::Config;
use fieldledger::engine::{Engine, EngineOptions};
use fieldledger::http::{self, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    fieldledger::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::open(
        config.wal_path(),
        EngineOptions {
            lookup_retries: config.lookup_retries,
            lookup_backoff: config.lookup_backoff,
            directory: None,
        },
    )?);

    tokio::spawn(fieldledger::compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
        Duration::from_secs(30),
    ));

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("fieldledger listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!(
        "  request_timeout: {}",
        config
            .request_timeout
            .map_or("none".to_string(), |t| format!("{}ms", t.as_millis()))
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let state = Arc::new(AppState::new(engine, config.request_timeout));
    http::serve(listener, state, shutdown_signal()).await?;

    info!("fieldledger stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM. In-flight requests finish before `serve` returns.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
    info!("shutdown signal received, draining requests");
}
