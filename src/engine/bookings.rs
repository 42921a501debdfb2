#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Booking rows with owner, offer and active-slot indexes.
///
/// Writers always hold the row lock of the referenced slot, so two
/// mutations touching the same slot never interleave here.
pub(crate) struct BookingStore {
    rows: DashMap<Ulid, Booking>,
    by_owner: DashMap<Ulid, Vec<Ulid>>,
    by_offer: DashMap<Ulid, Vec<Ulid>>,
    /// slot_id -> id of its one live booking.
    active_by_slot: DashMap<Ulid, Ulid>,
    #[cfg(test)]
    pub(super) fail_inserts: AtomicBool,
}

impl BookingStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            by_owner: DashMap::new(),
            by_offer: DashMap::new(),
            active_by_slot: DashMap::new(),
            #[cfg(test)]
            fail_inserts: AtomicBool::new(false),
        }
    }

    /// Would inserting `booking` succeed? Called on the staged change, before
    /// anything is written.
    pub fn check_insert(&self, booking: &Booking) -> Result<(), EngineError> {
        if self.insert_fault() {
            return Err(EngineError::Storage("booking insert failed".into()));
        }
        if self.rows.contains_key(&booking.id) {
            return Err(EngineError::Storage(format!("duplicate booking id {}", booking.id)));
        }
        if self.active_by_slot.contains_key(&booking.slot_id) {
            return Err(EngineError::AlreadyBooked(booking.slot_id));
        }
        Ok(())
    }

    #[cfg(test)]
    fn insert_fault(&self) -> bool {
        self.fail_inserts.load(Ordering::SeqCst)
    }

    #[cfg(not(test))]
    fn insert_fault(&self) -> bool {
        false
    }

    pub fn apply(&self, event: &Event) {
        match event {
            Event::SlotReserved { booking } | Event::BookingRestored { booking } => {
                self.insert(booking.clone());
            }
            Event::BookingDeleted { id, slot_id, at } => {
                if let Some(mut row) = self.rows.get_mut(id) {
                    row.deleted_at = Some(*at);
                    row.updated_at = *at;
                }
                self.active_by_slot.remove_if(slot_id, |_, active| active == id);
            }
            Event::SlotCreated { .. }
            | Event::SlotUpdated { .. }
            | Event::SlotDeleted { .. }
            | Event::ActivityEmitted { .. }
            | Event::ActivitiesExpired { .. } => {}
        }
    }

    fn insert(&self, booking: Booking) {
        self.by_owner.entry(booking.owner_id).or_default().push(booking.id);
        self.by_offer.entry(booking.offer_id).or_default().push(booking.id);
        if !booking.is_deleted() {
            self.active_by_slot.insert(booking.slot_id, booking.id);
        }
        self.rows.insert(booking.id, booking);
    }

    /// Point lookup, soft-deleted rows included.
    pub fn get(&self, id: &Ulid) -> Option<Booking> {
        self.rows.get(id).map(|e| e.value().clone())
    }

    pub fn active_for_slot(&self, slot_id: &Ulid) -> Option<Ulid> {
        self.active_by_slot.get(slot_id).map(|e| *e.value())
    }

    pub fn list_by_owner(&self, owner_id: &Ulid) -> Vec<Booking> {
        self.list_indexed(&self.by_owner, owner_id)
    }

    pub fn list_by_offer(&self, offer_id: &Ulid) -> Vec<Booking> {
        self.list_indexed(&self.by_offer, offer_id)
    }

    /// Live rows under `key`, newest first.
    fn list_indexed(&self, index: &DashMap<Ulid, Vec<Ulid>>, key: &Ulid) -> Vec<Booking> {
        let ids = match index.get(key) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };
        let mut out: Vec<Booking> = ids
            .iter()
            .filter_map(|id| self.get(id))
            .filter(|b| !b.is_deleted())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// Every row, soft-deleted ones included.
    pub fn snapshot(&self) -> Vec<Booking> {
        let mut out: Vec<Booking> = self.rows.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|b| b.id);
        out
    }
}
