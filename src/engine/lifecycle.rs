use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Fields to change on a slot. `None` leaves the current value in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub is_booked: Option<bool>,
}

impl SlotPatch {
    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.is_booked.is_none()
    }
}

pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation(
            "start_time must be before end_time".into(),
        ));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(EngineError::LimitExceeded("slot too long"));
    }
    Ok(span)
}

impl Engine {
    pub async fn create_slot(&self, offer_id: Ulid, start: Ms, end: Ms) -> Result<Slot, EngineError> {
        let span = validate_span(start, end)?;
        let permit = self.wal.begin().await;
        // Dropped unkept if the append fails, which hands the capacity back.
        let claim = self
            .slots
            .claim(offer_id)
            .ok_or(EngineError::LimitExceeded("too many slots on offer"))?;

        let slot = Slot::new(offer_id, span, now_ms());
        let slots = self.slots.clone();
        let row = slot.clone();
        let event = Event::SlotCreated { slot: slot.clone() };
        self.wal
            .commit(permit, event, move |_| {
                claim.keep();
                slots.insert(row);
            })
            .await?;
        Ok(slot)
    }

    /// Live slot by id. Soft-deleted slots are `NotFound`.
    pub async fn get_slot(&self, id: Ulid) -> Result<Slot, EngineError> {
        let slot = self.get_slot_including_deleted(id).await?;
        if slot.is_deleted() {
            return Err(EngineError::NotFound(id));
        }
        Ok(slot)
    }

    pub async fn get_slot_including_deleted(&self, id: Ulid) -> Result<Slot, EngineError> {
        let row = self.slots.get(&id).ok_or(EngineError::NotFound(id))?;
        let guard = row.read().await;
        Ok(guard.clone())
    }

    /// Live slots of `offer_id` starting in `[from, to)`, ascending by start.
    pub async fn list_slots(
        &self,
        offer_id: Ulid,
        only_available: bool,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Slot>, EngineError> {
        if from >= to {
            return Ok(Vec::new());
        }
        if to.saturating_sub(from) > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }

        let window = Span::new(from, to);
        let mut out = Vec::new();
        for row in self.slots.rows_for_offer(&offer_id) {
            let guard = row.read().await;
            if guard.is_deleted() || (only_available && guard.is_booked) {
                continue;
            }
            if window.contains_instant(guard.start) {
                out.push(guard.clone());
            }
        }
        out.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    pub async fn update_slot(&self, id: Ulid, patch: SlotPatch) -> Result<Slot, EngineError> {
        let permit = self.wal.begin().await;
        let row = self.slots.get(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = row.write_owned().await;
        if guard.is_deleted() {
            return Err(EngineError::NotFound(id));
        }
        if patch.is_empty() {
            return Ok(guard.clone());
        }

        let start = patch.start.unwrap_or(guard.start);
        let end = patch.end.unwrap_or(guard.end);
        validate_span(start, end)?;
        let is_booked = patch.is_booked.unwrap_or(guard.is_booked);
        if !is_booked && self.bookings.active_for_slot(&id).is_some() {
            return Err(EngineError::ActiveBooking(id));
        }

        let event = Event::SlotUpdated {
            id,
            start,
            end,
            is_booked,
            at: now_ms(),
        };
        self.wal
            .commit(permit, event, move |event| {
                apply_to_slot(&mut guard, event);
                guard.clone()
            })
            .await
    }

    /// Soft-delete. Fails while a live booking holds the slot.
    pub async fn delete_slot(&self, id: Ulid) -> Result<(), EngineError> {
        let permit = self.wal.begin().await;
        let row = self.slots.get(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = row.write_owned().await;
        if guard.is_deleted() {
            return Err(EngineError::NotFound(id));
        }
        if self.bookings.active_for_slot(&id).is_some() {
            return Err(EngineError::ActiveBooking(id));
        }

        let event = Event::SlotDeleted { id, at: now_ms() };
        let slots = self.slots.clone();
        self.wal
            .commit(permit, event, move |event| {
                apply_to_slot(&mut guard, event);
                slots.release_live(&guard.offer_id);
            })
            .await
    }
}
