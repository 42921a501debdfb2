use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{
    ACTIVITY_EMIT_FAILURES_TOTAL, RESERVATIONS_TOTAL, RESERVE_DURATION_SECONDS,
};

use super::{Engine, EngineError};

const CONFIRMATION_TITLE: &str = "Appointment confirmed";
const CONFIRMATION_KIND: &str = "appointment";

pub(crate) fn confirmation_message(start: Ms) -> String {
    let when = DateTime::<Utc>::from_timestamp_millis(start)
        .map(|dt| dt.format("%b %-d, %Y at %H:%M UTC").to_string())
        .unwrap_or_else(|| format_ms(start));
    format!("Your booking is confirmed for {when}.")
}

fn outcome_label(result: &Result<(Booking, Slot), EngineError>) -> &'static str {
    match result {
        Ok(_) => "reserved",
        Err(EngineError::AlreadyBooked(_)) => "already_booked",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::Cancelled) => "cancelled",
        Err(_) => "error",
    }
}

impl Engine {
    /// Book `slot_id` for `owner_id`. Exactly one concurrent caller per slot wins;
    /// the rest get `AlreadyBooked`.
    pub async fn reserve(
        &self,
        offer_id: Ulid,
        slot_id: Ulid,
        owner_id: Ulid,
    ) -> Result<Booking, EngineError> {
        self.reserve_with_cancel(offer_id, slot_id, owner_id, &CancellationToken::new())
            .await
    }

    /// `reserve` that gives up with `Cancelled` if it cannot reach the commit
    /// point within `timeout`.
    pub async fn reserve_within(
        &self,
        offer_id: Ulid,
        slot_id: Ulid,
        owner_id: Ulid,
        timeout: Duration,
    ) -> Result<Booking, EngineError> {
        let cancel = CancellationToken::new();
        let timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        };
        let result = self
            .reserve_with_cancel(offer_id, slot_id, owner_id, &cancel)
            .await;
        timer.abort();
        result
    }

    /// Cancellation is honoured up to the commit point. After it, the booking
    /// lands regardless and is returned.
    pub async fn reserve_with_cancel(
        &self,
        offer_id: Ulid,
        slot_id: Ulid,
        owner_id: Ulid,
        cancel: &CancellationToken,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.try_reserve(offer_id, slot_id, owner_id, cancel).await;
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        metrics::histogram!(RESERVE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        let (booking, slot) = result?;
        self.confirm_in_background(&booking, slot.start);
        Ok(booking)
    }

    async fn try_reserve(
        &self,
        offer_id: Ulid,
        slot_id: Ulid,
        owner_id: Ulid,
        cancel: &CancellationToken,
    ) -> Result<(Booking, Slot), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = self.wal.begin() => permit,
        };
        let row = self.slots.get(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            guard = row.write_owned() => guard,
        };

        if guard.is_deleted() || guard.offer_id != offer_id {
            return Err(EngineError::NotFound(slot_id));
        }
        if guard.is_booked {
            return Err(EngineError::AlreadyBooked(slot_id));
        }

        // Stage the whole change; nothing below touches shared state until commit.
        let booking = Booking::pending(offer_id, slot_id, owner_id, now_ms());
        let event = Event::SlotReserved {
            booking: booking.clone(),
        };
        let mut working = guard.clone();
        apply_to_slot(&mut working, &event);
        self.bookings.check_insert(&booking)?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let bookings = self.bookings.clone();
        let slot = self
            .wal
            .commit(permit, event, move |event| {
                *guard = working;
                bookings.apply(event);
                guard.clone()
            })
            .await?;
        debug!(%slot_id, booking_id = %booking.id, %owner_id, "slot reserved");
        Ok((booking, slot))
    }

    /// Record the owner's confirmation on a detached task. Failures are logged
    /// and counted, never reported to the caller.
    fn confirm_in_background(&self, booking: &Booking, slot_start: Ms) {
        let log = self.activity.clone();
        let booking_id = booking.id;
        let owner_id = booking.owner_id;
        let message = confirmation_message(slot_start);
        tokio::spawn(async move {
            if let Err(e) = log
                .emit(owner_id, CONFIRMATION_TITLE, &message, CONFIRMATION_KIND)
                .await
            {
                metrics::counter!(ACTIVITY_EMIT_FAILURES_TOTAL).increment(1);
                warn!(%booking_id, %owner_id, "confirmation activity not recorded: {e}");
            }
        });
    }

    /// Live booking by id.
    pub fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        match self.bookings.get(&id) {
            Some(b) if !b.is_deleted() => Ok(b),
            _ => Err(EngineError::NotFound(id)),
        }
    }

    pub fn list_bookings_by_owner(&self, owner_id: Ulid) -> Vec<Booking> {
        self.bookings.list_by_owner(&owner_id)
    }

    pub fn list_bookings_by_offer(&self, offer_id: Ulid) -> Vec<Booking> {
        self.bookings.list_by_offer(&offer_id)
    }

    /// Soft-delete a booking and free its slot in one step.
    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let permit = self.wal.begin().await;
        let slot_id = self.get_booking(id)?.slot_id;
        let row = self.slots.get(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = row.write_owned().await;
        // A concurrent delete may have won while we waited for the row.
        self.get_booking(id)?;

        let event = Event::BookingDeleted {
            id,
            slot_id,
            at: now_ms(),
        };
        let bookings = self.bookings.clone();
        self.wal
            .commit(permit, event, move |event| {
                apply_to_slot(&mut guard, event);
                bookings.apply(event);
            })
            .await
    }
}
