use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::MAX_SLOTS_PER_OFFER;
use crate::model::Slot;

pub(crate) type SharedSlot = Arc<RwLock<Slot>>;

/// Slot rows plus an offer index. Rows are never removed; deletion is a
/// `deleted_at` marker set under the row lock.
pub(crate) struct SlotStore {
    rows: DashMap<Ulid, SharedSlot>,
    by_offer: DashMap<Ulid, Vec<Ulid>>,
    /// Live (not deleted) slots per offer, including creates still in flight.
    live_by_offer: DashMap<Ulid, usize>,
    max_live_per_offer: usize,
}

/// One unit of an offer's live-slot capacity, taken before the slot is
/// committed. Given back on drop unless `keep` is called.
pub(crate) struct CapacityClaim {
    store: Arc<SlotStore>,
    offer_id: Ulid,
    kept: bool,
}

impl CapacityClaim {
    pub fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for CapacityClaim {
    fn drop(&mut self) {
        if !self.kept {
            self.store.release_live(&self.offer_id);
        }
    }
}

impl SlotStore {
    pub fn new() -> Self {
        Self::with_limit(MAX_SLOTS_PER_OFFER)
    }

    pub fn with_limit(max_live_per_offer: usize) -> Self {
        Self {
            rows: DashMap::new(),
            by_offer: DashMap::new(),
            live_by_offer: DashMap::new(),
            max_live_per_offer,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, id: &Ulid) -> Option<SharedSlot> {
        self.rows.get(id).map(|e| e.value().clone())
    }

    /// Add a row. Live-slot accounting is the caller's: a claim on the create
    /// path, `restore` on replay.
    pub fn insert(&self, slot: Slot) {
        self.by_offer.entry(slot.offer_id).or_default().push(slot.id);
        self.rows.insert(slot.id, Arc::new(RwLock::new(slot)));
    }

    /// Replay-time insert that also counts the slot if it is live.
    pub fn restore(&self, slot: Slot) {
        if !slot.is_deleted() {
            *self.live_by_offer.entry(slot.offer_id).or_default() += 1;
        }
        self.insert(slot);
    }

    /// Take one unit of `offer_id`'s capacity. `None` once the offer is full.
    /// Compare and increment happen under the same map entry lock.
    pub fn claim(self: &Arc<Self>, offer_id: Ulid) -> Option<CapacityClaim> {
        let mut live = self.live_by_offer.entry(offer_id).or_default();
        if *live >= self.max_live_per_offer {
            return None;
        }
        *live += 1;
        Some(CapacityClaim {
            store: self.clone(),
            offer_id,
            kept: false,
        })
    }

    /// A live slot of `offer_id` was deleted.
    pub fn release_live(&self, offer_id: &Ulid) {
        if let Some(mut live) = self.live_by_offer.get_mut(offer_id) {
            *live = live.saturating_sub(1);
        }
    }

    pub fn live_for_offer(&self, offer_id: &Ulid) -> usize {
        self.live_by_offer.get(offer_id).map(|n| *n).unwrap_or(0)
    }

    /// Row handles for an offer. The index shard lock is released before returning.
    pub fn rows_for_offer(&self, offer_id: &Ulid) -> Vec<SharedSlot> {
        let ids = match self.by_offer.get(offer_id) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn all_rows(&self) -> Vec<SharedSlot> {
        self.rows.iter().map(|e| e.value().clone()).collect()
    }
}
