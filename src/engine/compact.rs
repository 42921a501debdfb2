use tracing::info;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    /// Soft-deleted slots and bookings are kept; expired activities are dropped.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _quiet = self.wal.quiesce().await;

        let mut slots = Vec::with_capacity(self.slots.len());
        for row in self.slots.all_rows() {
            slots.push(row.read().await.clone());
        }
        slots.sort_by_key(|s| s.id);
        let mut events: Vec<Event> = slots
            .into_iter()
            .map(|slot| Event::SlotCreated { slot })
            .collect();
        for booking in self.bookings.snapshot() {
            events.push(Event::BookingRestored { booking });
        }
        for activity in self.activity.snapshot_live() {
            events.push(Event::ActivityEmitted { activity });
        }

        let written = events.len();
        self.wal.compact(events).await?;
        info!(events = written, "WAL compacted");
        Ok(written)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}
