mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
mod validate;

pub use conflict::ScopeReader;
pub use error::{EngineError, EntityKind, Violation, ViolationClass};
pub use queries::{LeaseDetails, LeaseFilter, PaymentFilter};
pub use store::{ScopeLocks, Store};
pub use validate::{Candidate, LeasePolicy, validate_lease};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

use crate::model::*;
use crate::wal::Wal;

pub type SharedScopeState = Arc<RwLock<ScopeState>>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends.
/// 4. One flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
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
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Lease engine: in-memory store, conflict scopes and the WAL writer.
///
/// Lock order, outermost first: `catalog` (apartment/tenant/payment writes),
/// scope write locks in `Scope` order, then `commit_gate`.
pub struct Engine {
    pub store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) policy: LeasePolicy,
    /// Serializes writes to apartments, tenants and payments so uniqueness and
    /// reference checks see a stable catalog.
    pub(super) catalog: Mutex<()>,
    /// Shared by every append+apply pair, exclusive while compacting, so a
    /// snapshot never sees an event that is in the WAL but not yet applied.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, policy: LeasePolicy) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let wal = Wal::open_after_replay(&wal_path, &replay)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            policy,
            catalog: Mutex::new(()),
            commit_gate: RwLock::new(()),
        };

        // Nothing else can see the store yet, so every try-lock succeeds.
        for event in &replay.events {
            let scopes = engine.store.event_scopes(event);
            let mut locks = engine
                .store
                .try_lock_scopes(scopes)
                .expect("replay: uncontended write");
            engine.store.apply_event(event, &mut locks);
        }
        tracing::info!(
            "replayed {} events from {}",
            replay.events.len(),
            wal_path.display()
        );

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
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

    /// Durably append `event`, then apply it. `locks` must cover every scope
    /// the event touches.
    pub(super) async fn persist_and_apply(
        &self,
        event: Event,
        locks: &mut ScopeLocks,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(&event).await?;
        self.store.apply_event(&event, locks);
        Ok(())
    }
}
