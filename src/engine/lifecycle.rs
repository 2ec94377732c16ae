use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_no_conflict, validate_range};
use super::pricing::compute_amount;
use super::EngineError;

// Pure decisions over one car's state. The engine calls these under the car's
// write lock and turns each decision into a WAL event.

/// What a reschedule request turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RescheduleDecision {
    /// Cheaper or same price: commit now and hand back the difference.
    Apply { amount: Money, refund: Money },
    /// More expensive: nothing changes until the extra amount is paid.
    RequirePayment(PendingReschedule),
}

/// Amount for a new booking on `car`, or why it cannot be made.
pub(crate) fn plan_create(car: &AssetState, range: &DateRange) -> Result<Money, EngineError> {
    validate_range(range)?;
    check_no_conflict(car, range, None)?;
    compute_amount(range, car.daily_rate)
}

pub(crate) fn plan_reschedule(
    car: &AssetState,
    reservation_id: Ulid,
    new_range: &DateRange,
) -> Result<RescheduleDecision, EngineError> {
    let reservation = car
        .reservation(reservation_id)
        .filter(|r| r.is_active())
        .ok_or(EngineError::NotFound(reservation_id))?;
    validate_range(new_range)?;
    check_no_conflict(car, new_range, Some(reservation_id))?;

    let old_amount = reservation.amount;
    let new_amount = compute_amount(new_range, reservation.daily_rate)?;

    if new_amount > old_amount {
        Ok(RescheduleDecision::RequirePayment(PendingReschedule {
            reservation_id,
            new_range: *new_range,
            extra_amount: new_amount - old_amount,
            version: reservation.version,
        }))
    } else {
        Ok(RescheduleDecision::Apply {
            amount: new_amount,
            refund: old_amount - new_amount,
        })
    }
}

/// New amount for a quoted reschedule, without touching the calendar. The
/// reservation must still be exactly the one the descriptor was quoted against,
/// and the descriptor's extra amount must be what its dates actually cost.
pub(crate) fn check_quote(car: &AssetState, pending: &PendingReschedule) -> Result<Money, EngineError> {
    let id = pending.reservation_id;
    let reservation = car.reservation(id).ok_or(EngineError::NotFound(id))?;
    if !reservation.is_active() || reservation.version != pending.version {
        return Err(EngineError::StalePending(id));
    }
    validate_range(&pending.new_range)?;
    let new_amount = compute_amount(&pending.new_range, reservation.daily_rate)?;
    if pending.extra_amount <= 0 || new_amount - reservation.amount != pending.extra_amount {
        return Err(EngineError::QuoteMismatch(id));
    }
    Ok(new_amount)
}

/// Amount to commit for a paid reschedule: a valid quote whose new dates are
/// still free.
pub(crate) fn plan_completion(
    car: &AssetState,
    pending: &PendingReschedule,
) -> Result<Money, EngineError> {
    let new_amount = check_quote(car, pending)?;
    check_no_conflict(car, &pending.new_range, Some(pending.reservation_id))?;
    Ok(new_amount)
}

/// `None` when the reservation is already cancelled (idempotent no-op).
pub(crate) fn plan_cancel(car: &AssetState, reservation_id: Ulid) -> Result<Option<u64>, EngineError> {
    let reservation = car
        .reservation(reservation_id)
        .ok_or(EngineError::NotFound(reservation_id))?;
    match reservation.status {
        ReservationStatus::Cancelled => Ok(None),
        ReservationStatus::Confirmed => Ok(Some(reservation.version + 1)),
    }
}
