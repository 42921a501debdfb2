mod activity;
mod bookings;
mod compact;
mod error;
mod lifecycle;
mod reserve;
mod slots;

pub use activity::ActivityLog;
pub use error::{EngineError, ErrorKind};
pub use lifecycle::SlotPatch;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use bookings::BookingStore;
use slots::SlotStore;

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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
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

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Every caller in the batch is told it failed, so none of it may
        // survive on disk, not even records that were fully written.
        if let Err(e) = wal.rollback() {
            tracing::error!(
                path = %wal.path().display(),
                "WAL rollback failed, refusing writes until compaction: {e}"
            );
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            // Compaction is what clears a poisoned log, so ask for one.
            let appends = if wal.is_poisoned() {
                u64::MAX
            } else {
                wal.appends_since_compact()
            };
            let _ = response.send(appends);
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Held for the duration of one unit of work (WAL append + in-memory apply).
/// Compaction takes the gate exclusively, so it never snapshots a half-applied change.
pub(crate) type CommitPermit = OwnedRwLockReadGuard<()>;

/// Cloneable handle to the WAL writer task.
#[derive(Clone)]
pub(crate) struct WalHandle {
    tx: mpsc::Sender<WalCommand>,
    gate: Arc<RwLock<()>>,
}

impl WalHandle {
    /// Enter a unit of work. Must be taken before any slot row lock.
    pub(crate) async fn begin(&self) -> CommitPermit {
        self.gate.clone().read_owned().await
    }

    /// Durably append one event via the group-commit writer.
    pub(crate) async fn append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Append `event`, then run `apply`, on a task of its own. Once called, the
    /// change either lands in both the log and memory or in neither, even if
    /// the caller's future is dropped.
    pub(crate) async fn commit<T, F>(
        &self,
        permit: CommitPermit,
        event: Event,
        apply: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce(&Event) -> T + Send + 'static,
        T: Send + 'static,
    {
        let wal = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            wal.append(&event).await?;
            Ok(apply(&event))
        })
        .await
        .map_err(|e| EngineError::Storage(format!("commit task failed: {e}")))?
    }

    pub(crate) async fn compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub(crate) async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Exclusive side of the commit gate: no unit of work is in flight while held.
    pub(crate) async fn quiesce(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }
}

pub struct Engine {
    pub(super) slots: Arc<SlotStore>,
    pub(super) bookings: Arc<BookingStore>,
    pub(super) activity: ActivityLog,
    pub(super) wal: WalHandle,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must run inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        let wal = WalHandle {
            tx,
            gate: Arc::new(RwLock::new(())),
        };

        let engine = Self {
            slots: Arc::new(SlotStore::new()),
            bookings: Arc::new(BookingStore::new()),
            activity: ActivityLog::new(wal.clone()),
            wal,
        };
        for event in &events {
            engine.replay_event(event);
        }
        info!(
            path = %wal_path.display(),
            events = events.len(),
            slots = engine.slots.len(),
            "engine state restored"
        );
        Ok(engine)
    }

    // We're the sole owner of every row during replay, so try_write always
    // succeeds. Never block here: this may run inside an async context.
    fn replay_event(&self, event: &Event) {
        if let Event::SlotCreated { slot } = event {
            self.slots.restore(slot.clone());
            return;
        }
        if let Some(slot_id) = event.slot_id()
            && let Some(row) = self.slots.get(&slot_id)
            && let Ok(mut guard) = row.try_write()
        {
            let was_live = !guard.is_deleted();
            apply_to_slot(&mut guard, event);
            if was_live && guard.is_deleted() {
                self.slots.release_live(&guard.offer_id);
            }
        }
        self.bookings.apply(event);
        self.activity.apply(event);
    }

    // ── Activity log ─────────────────────────────────────────

    pub async fn emit_activity(
        &self,
        user_id: Ulid,
        title: &str,
        message: &str,
        kind: &str,
    ) -> Result<Activity, EngineError> {
        self.activity.emit(user_id, title, message, kind).await
    }

    pub fn list_activities(
        &self,
        user_id: Ulid,
        limit: Option<usize>,
    ) -> Result<Vec<Activity>, EngineError> {
        self.activity.list(&user_id, limit)
    }

    pub async fn expire_activities(&self, before: Ms) -> Result<usize, EngineError> {
        self.activity.expire(before).await
    }
}
