use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Whole currency units. No fractional cents anywhere in the engine.
pub type Money = i64;

/// Calendar day. The only date type.
pub type Day = NaiveDate;

/// Half-open range of calendar days `[start, end)`.
///
/// A well-formed range has `start < end`; the engine rejects anything else with
/// `InvalidRange` before it reaches a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Day,
    pub end: Day,
}

impl DateRange {
    pub fn new(start: Day, end: Day) -> Self {
        Self { start, end }
    }

    /// Number of booked days. Zero or negative for malformed ranges.
    pub fn length_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn is_well_formed(&self) -> bool {
        self.start < self.end
    }

    /// Touching endpoints do not overlap: a car returned on the 15th can be
    /// picked up again on the 15th.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        !(self.end <= other.start || self.start >= other.end)
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub asset_id: Ulid,
    pub owner_id: Ulid,
    pub range: DateRange,
    /// Rate captured when the reservation was created. Never re-read from the car.
    pub daily_rate: Money,
    pub amount: Money,
    pub status: ReservationStatus,
    /// Bumped by every committed reschedule and by cancellation.
    pub version: u64,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }
}

/// Produced when a reschedule costs more than the booking it replaces. Lives only
/// for the payment round trip; nothing about it is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReschedule {
    pub reservation_id: Ulid,
    pub new_range: DateRange,
    pub extra_amount: Money,
    /// Reservation version observed when this descriptor was produced.
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescheduleOutcome {
    /// Committed synchronously. `refund` may be zero.
    Applied { reservation: Reservation, refund: Money },
    /// Nothing committed yet; payment of `extra_amount` must succeed first.
    PendingPayment(PendingReschedule),
}

/// In-memory state of one car: its rate and every reservation ever made on it.
#[derive(Debug, Clone)]
pub struct AssetState {
    pub id: Ulid,
    pub name: Option<String>,
    pub daily_rate: Money,
    /// Confirmed and cancelled reservations, sorted by `range.start`.
    pub reservations: Vec<Reservation>,
    /// Set under the write lock when the car is deleted. Tasks that were already
    /// queued on the lock see it and back off.
    pub deleted: bool,
}

impl AssetState {
    pub fn new(id: Ulid, name: Option<String>, daily_rate: Money) -> Self {
        Self {
            id,
            name,
            daily_rate,
            reservations: Vec::new(),
            deleted: false,
        }
    }

    /// Insert maintaining sort order by range start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.range.start <= reservation.range.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn take_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Confirmed reservations whose range overlaps `query`, skipping `exclude`.
    /// Everything starting at or after `query.end` is cut off by binary search.
    pub fn overlapping_active<'a>(
        &'a self,
        query: &'a DateRange,
        exclude: Option<Ulid>,
    ) -> impl Iterator<Item = &'a Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.range.start < query.end);
        self.reservations[..right_bound].iter().filter(move |r| {
            r.is_active() && Some(r.id) != exclude && r.range.end > query.start
        })
    }

    /// Ranges of confirmed reservations, optionally skipping one.
    pub fn active_ranges(&self, exclude: Option<Ulid>) -> Vec<DateRange> {
        self.reservations
            .iter()
            .filter(|r| r.is_active() && Some(r.id) != exclude)
            .map(|r| r.range)
            .collect()
    }

    pub fn has_active_reservations(&self) -> bool {
        self.reservations.iter().any(Reservation::is_active)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AssetCreated {
        id: Ulid,
        name: Option<String>,
        daily_rate: Money,
    },
    AssetUpdated {
        id: Ulid,
        name: Option<String>,
        daily_rate: Money,
    },
    AssetDeleted {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        asset_id: Ulid,
        owner_id: Ulid,
        range: DateRange,
        daily_rate: Money,
        amount: Money,
    },
    ReservationRescheduled {
        id: Ulid,
        asset_id: Ulid,
        range: DateRange,
        amount: Money,
        version: u64,
    },
    ReservationCancelled {
        id: Ulid,
        asset_id: Ulid,
        version: u64,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub daily_rate: Money,
}
