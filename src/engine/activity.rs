#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, WalHandle};

struct Inner {
    /// Per-user activities, ascending by `created_at`, insertion order on ties.
    by_user: DashMap<Ulid, Vec<Activity>>,
    #[cfg(test)]
    fail_emits: AtomicBool,
}

/// Append-only per-user notification log. Cheap to clone; clones share state,
/// so a detached task can emit without borrowing the engine.
#[derive(Clone)]
pub struct ActivityLog {
    inner: Arc<Inner>,
    wal: WalHandle,
}

impl ActivityLog {
    pub(crate) fn new(wal: WalHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                by_user: DashMap::new(),
                #[cfg(test)]
                fail_emits: AtomicBool::new(false),
            }),
            wal,
        }
    }

    #[cfg(test)]
    pub(crate) fn fail_emits(&self, fail: bool) {
        self.inner.fail_emits.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn emit_fault(&self) -> bool {
        self.inner.fail_emits.load(Ordering::SeqCst)
    }

    #[cfg(not(test))]
    fn emit_fault(&self) -> bool {
        false
    }

    pub async fn emit(
        &self,
        user_id: Ulid,
        title: &str,
        message: &str,
        kind: &str,
    ) -> Result<Activity, EngineError> {
        if title.is_empty() {
            return Err(EngineError::Validation("title must not be empty".into()));
        }
        if title.len() > MAX_TITLE_LEN {
            return Err(EngineError::LimitExceeded("title too long"));
        }
        if message.len() > MAX_MESSAGE_LEN {
            return Err(EngineError::LimitExceeded("message too long"));
        }
        if kind.len() > MAX_KIND_LEN {
            return Err(EngineError::LimitExceeded("type too long"));
        }
        if self.emit_fault() {
            return Err(EngineError::Storage("activity append failed".into()));
        }

        let activity = Activity {
            id: Ulid::new(),
            user_id,
            title: title.to_owned(),
            message: message.to_owned(),
            kind: kind.to_owned(),
            created_at: now_ms(),
            deleted_at: None,
        };
        let permit = self.wal.begin().await;
        let log = self.clone();
        self.wal
            .commit(permit, Event::ActivityEmitted { activity: activity.clone() }, move |event| {
                log.apply(event)
            })
            .await?;
        Ok(activity)
    }

    /// Most recent live activities for `user_id`, newest first.
    pub fn list(&self, user_id: &Ulid, limit: Option<usize>) -> Result<Vec<Activity>, EngineError> {
        let limit = limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
        if limit > MAX_ACTIVITY_LIMIT {
            return Err(EngineError::LimitExceeded("activity limit too large"));
        }
        let Some(entries) = self.inner.by_user.get(user_id) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .rev()
            .filter(|a| a.deleted_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    /// Soft-delete every live activity created before `before`. Returns how many.
    pub async fn expire(&self, before: Ms) -> Result<usize, EngineError> {
        let permit = self.wal.begin().await;
        if self.count_live_before(before) == 0 {
            return Ok(0);
        }
        let log = self.clone();
        let event = Event::ActivitiesExpired { before, at: now_ms() };
        self.wal
            .commit(permit, event, move |event| log.apply(event))
            .await
    }

    fn count_live_before(&self, before: Ms) -> usize {
        self.inner
            .by_user
            .iter()
            .map(|e| {
                e.value()
                    .iter()
                    .filter(|a| a.deleted_at.is_none() && a.created_at < before)
                    .count()
            })
            .sum()
    }

    /// Apply a committed event. Returns the number of rows it touched.
    pub(crate) fn apply(&self, event: &Event) -> usize {
        match event {
            Event::ActivityEmitted { activity } => {
                let mut entries = self.inner.by_user.entry(activity.user_id).or_default();
                let at = entries.partition_point(|a| a.created_at <= activity.created_at);
                entries.insert(at, activity.clone());
                1
            }
            Event::ActivitiesExpired { before, at } => {
                let mut touched = 0;
                for mut entry in self.inner.by_user.iter_mut() {
                    for a in entry.value_mut().iter_mut() {
                        if a.deleted_at.is_none() && a.created_at < *before {
                            a.deleted_at = Some(*at);
                            touched += 1;
                        }
                    }
                }
                touched
            }
            Event::SlotCreated { .. }
            | Event::SlotUpdated { .. }
            | Event::SlotDeleted { .. }
            | Event::SlotReserved { .. }
            | Event::BookingDeleted { .. }
            | Event::BookingRestored { .. } => 0,
        }
    }

    /// Live activities in per-user creation order, for compaction.
    pub(crate) fn snapshot_live(&self) -> Vec<Activity> {
        let mut out = Vec::new();
        for entry in self.inner.by_user.iter() {
            out.extend(entry.value().iter().filter(|a| a.deleted_at.is_none()).cloned());
        }
        out
    }
}
