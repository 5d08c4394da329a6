mod allocation;
mod catalog;
mod checks;
mod error;
mod maintenance;
mod reconcile;
mod store;
#[cfg(test)]
mod tests;

pub use allocation::{ReturnRequest, SupplyAllocation, ToolAllocation};
pub use catalog::{SupplySpec, ToolSpec};
pub use error::{EngineError, Entity};
pub use reconcile::ConservationBreach;
pub use store::{LedgerStore, MovementRef, SharedSupply, SharedTool};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::directory::{DirectoryError, LaborDirectory, LaborTable};
use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One fsync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch: Vec<Pending> = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        // every sender sees the error, so no part of the batch may replay
        warn!("WAL flush failed for batch of {}: {e}", batch.len());
        if let Err(e) = wal.rollback() {
            error!("could not roll back failed WAL batch: {e}");
        }
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

/// Tunables for an engine. `directory: None` resolves labors from the ledger's own table.
#[derive(Clone)]
pub struct EngineOptions {
    pub lookup_retries: u32,
    pub lookup_backoff: Duration,
    pub directory: Option<Arc<dyn LaborDirectory>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lookup_retries: 2,
            lookup_backoff: Duration::from_millis(25),
            directory: None,
        }
    }
}

pub struct Engine {
    pub(super) store: Arc<LedgerStore>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) directory: Arc<dyn LaborDirectory>,
    lookup_retries: u32,
    lookup_backoff: Duration,
    /// Serializes catalog/labor syncs and compaction. Allocations and returns never take it.
    pub(super) catalog_sync: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::open(wal_path, EngineOptions::default())
    }

    /// Replay the log at `wal_path` and start its writer task. Must run inside a Tokio runtime.
    pub fn open(wal_path: PathBuf, options: EngineOptions) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.torn_tail {
            warn!(
                "discarding torn tail of {} past byte {}",
                wal_path.display(),
                replay.valid_len
            );
            Wal::discard_torn_tail(&wal_path, replay.valid_len)?;
        }
        let labors = Arc::new(LaborTable::new());
        let store = Arc::new(LedgerStore::rebuild(&replay.events, labors.clone()));
        info!(
            "replayed {} events: {} tools, {} supplies, {} labors",
            replay.events.len(),
            store.tool_count(),
            store.supply_count(),
            labors.len()
        );

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let directory = options
            .directory
            .unwrap_or_else(|| labors.clone() as Arc<dyn LaborDirectory>);
        Ok(Self {
            store,
            wal_tx,
            directory,
            lookup_retries: options.lookup_retries,
            lookup_backoff: options.lookup_backoff,
            catalog_sync: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Write `event` to the log, then run `apply` against the store once it is durable.
    ///
    /// Runs on a detached task: once called, the log append and the in-memory
    /// change happen together even if the caller is dropped halfway.
    pub(super) async fn commit<R, F>(&self, event: Event, apply: F) -> Result<R, EngineError>
    where
        F: FnOnce(&LedgerStore, &Event) -> R + Send + 'static,
        R: Send + 'static,
    {
        let wal_tx = self.wal_tx.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            wal_append(&wal_tx, &event).await?;
            let out = apply(&store, &event);
            store.index_event(&event);
            Ok(out)
        })
        .await
        .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    /// Resolve a labor through the directory, retrying only unavailable lookups.
    pub(super) async fn resolve_labor(
        &self,
        labor_id: Ulid,
        deadline: Option<Instant>,
    ) -> Result<LaborFacts, EngineError> {
        let mut backoff = self.lookup_backoff;
        let mut attempt = 0u32;
        loop {
            let lookup = self.directory.labor(labor_id);
            let result = match deadline {
                Some(d) => tokio::time::timeout_at(d, lookup)
                    .await
                    .map_err(|_| EngineError::DeadlineExceeded)?,
                None => lookup.await,
            };
            match result {
                Ok(facts) => return Ok(facts),
                Err(DirectoryError::UnknownLabor(id)) => {
                    return Err(EngineError::NotFound(Entity::Labor, id));
                }
                Err(DirectoryError::Unavailable(msg)) => {
                    if attempt >= self.lookup_retries {
                        return Err(EngineError::DependencyUnavailable(msg));
                    }
                    attempt += 1;
                    warn!("labor lookup for {labor_id} failed (attempt {attempt}): {msg}");
                    if deadline.is_some_and(|d| Instant::now() + backoff >= d) {
                        return Err(EngineError::DeadlineExceeded);
                    }
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}
