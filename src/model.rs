use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The engine's only time type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Render as RFC 3339 with millisecond precision, e.g. `2024-01-01T10:00:00.000Z`.
pub fn format_ms(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// A bookable interval on an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub offer_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub is_booked: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub deleted_at: Option<Ms>,
}

impl Slot {
    pub fn new(offer_id: Ulid, span: Span, now: Ms) -> Self {
        Self {
            id: Ulid::new(),
            offer_id,
            start: span.start,
            end: span.end,
            is_booked: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub offer_id: Ulid,
    pub slot_id: Ulid,
    pub owner_id: Ulid,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub deleted_at: Option<Ms>,
}

impl Booking {
    /// A fresh reservation. Bookings always start out pending.
    pub fn pending(offer_id: Ulid, slot_id: Ulid, owner_id: Ulid, now: Ms) -> Self {
        Self {
            id: Ulid::new(),
            offer_id,
            slot_id,
            owner_id,
            status: BookingStatus::Pending,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Append-only per-user notification record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Ulid,
    pub user_id: Ulid,
    pub title: String,
    pub message: String,
    /// Free-form category tag, e.g. `appointment`.
    pub kind: String,
    pub created_at: Ms,
    pub deleted_at: Option<Ms>,
}

/// The WAL record format. One record is one atomic state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        slot: Slot,
    },
    SlotUpdated {
        id: Ulid,
        start: Ms,
        end: Ms,
        is_booked: bool,
        at: Ms,
    },
    SlotDeleted {
        id: Ulid,
        at: Ms,
    },
    /// Slot flip and booking insert, committed together.
    SlotReserved {
        booking: Booking,
    },
    /// Soft-deletes the booking and releases its slot.
    BookingDeleted {
        id: Ulid,
        slot_id: Ulid,
        at: Ms,
    },
    /// Re-inserts a booking without touching its slot. Written by compaction only.
    BookingRestored {
        booking: Booking,
    },
    ActivityEmitted {
        activity: Activity,
    },
    /// Soft-deletes every live activity created before `before`.
    ActivitiesExpired {
        before: Ms,
        at: Ms,
    },
}

impl Event {
    /// The slot row this event mutates, if any.
    pub fn slot_id(&self) -> Option<Ulid> {
        match self {
            Event::SlotUpdated { id, .. } | Event::SlotDeleted { id, .. } => Some(*id),
            Event::SlotReserved { booking } => Some(booking.slot_id),
            Event::BookingDeleted { slot_id, .. } => Some(*slot_id),
            Event::SlotCreated { .. }
            | Event::BookingRestored { .. }
            | Event::ActivityEmitted { .. }
            | Event::ActivitiesExpired { .. } => None,
        }
    }
}

/// Apply an event to a slot row (no locking, caller holds the row lock).
/// Events that do not concern slot rows are ignored.
pub fn apply_to_slot(slot: &mut Slot, event: &Event) {
    match event {
        Event::SlotUpdated {
            start,
            end,
            is_booked,
            at,
            ..
        } => {
            slot.start = *start;
            slot.end = *end;
            slot.is_booked = *is_booked;
            slot.updated_at = *at;
        }
        Event::SlotDeleted { at, .. } => {
            slot.deleted_at = Some(*at);
            slot.updated_at = *at;
        }
        Event::SlotReserved { booking } => {
            slot.is_booked = true;
            slot.updated_at = booking.created_at;
        }
        Event::BookingDeleted { at, .. } => {
            slot.is_booked = false;
            slot.updated_at = *at;
        }
        Event::SlotCreated { .. }
        | Event::BookingRestored { .. }
        | Event::ActivityEmitted { .. }
        | Event::ActivitiesExpired { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn slot_at(start: Ms) -> Slot {
        Slot::new(Ulid::new(), Span::new(start, start + H), 0)
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn new_slot_is_free_and_live() {
        let slot = slot_at(10 * H);
        assert!(!slot.is_booked);
        assert!(!slot.is_deleted());
        assert_eq!(slot.span(), Span::new(10 * H, 11 * H));
    }

    #[test]
    fn reservation_flips_slot() {
        let mut slot = slot_at(10 * H);
        let booking = Booking::pending(slot.offer_id, slot.id, Ulid::new(), 42);
        assert_eq!(booking.status, BookingStatus::Pending);
        apply_to_slot(&mut slot, &Event::SlotReserved { booking });
        assert!(slot.is_booked);
        assert_eq!(slot.updated_at, 42);
    }

    #[test]
    fn booking_deletion_releases_slot() {
        let mut slot = slot_at(10 * H);
        slot.is_booked = true;
        let event = Event::BookingDeleted {
            id: Ulid::new(),
            slot_id: slot.id,
            at: 7,
        };
        apply_to_slot(&mut slot, &event);
        assert!(!slot.is_booked);
        assert!(!slot.is_deleted());
    }

    #[test]
    fn slot_delete_is_soft() {
        let mut slot = slot_at(10 * H);
        let id = slot.id;
        apply_to_slot(&mut slot, &Event::SlotDeleted { id, at: 99 });
        assert_eq!(slot.deleted_at, Some(99));
        assert_eq!(slot.start, 10 * H);
    }

    #[test]
    fn activity_events_do_not_touch_slots() {
        let mut slot = slot_at(10 * H);
        let before = slot.clone();
        let event = Event::ActivitiesExpired { before: 10, at: 11 };
        assert_eq!(event.slot_id(), None);
        apply_to_slot(&mut slot, &event);
        assert_eq!(slot, before);
    }

    #[test]
    fn event_slot_id() {
        let slot = slot_at(0);
        let booking = Booking::pending(slot.offer_id, slot.id, Ulid::new(), 0);
        assert_eq!(Event::SlotReserved { booking: booking.clone() }.slot_id(), Some(slot.id));
        assert_eq!(Event::BookingRestored { booking }.slot_id(), None);
    }

    #[test]
    fn format_ms_is_rfc3339_utc() {
        assert_eq!(format_ms(1_704_103_200_000), "2024-01-01T10:00:00.000Z");
    }

    #[test]
    fn status_labels() {
        assert_eq!(BookingStatus::Pending.to_string(), "pending");
        assert_eq!(BookingStatus::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SlotCreated { slot: slot_at(H) };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
