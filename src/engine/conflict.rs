use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Reject malformed ranges before anything else looks at them.
pub(crate) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    if !range.is_well_formed() {
        return Err(EngineError::InvalidRange(*range));
    }
    if range.start < min_valid_day() || range.end > max_valid_day() {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if range.length_days() > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("range too long"));
    }
    Ok(())
}

/// True if `candidate` overlaps any of `active`. Pure; the caller supplies a
/// consistent snapshot (the engine does so under the car's write lock).
pub fn has_conflict(candidate: &DateRange, active: &[DateRange]) -> bool {
    active.iter().any(|r| r.overlaps(candidate))
}

/// Conflict check against the live state of one car, naming the first
/// reservation in the way.
pub(crate) fn check_no_conflict(
    car: &AssetState,
    candidate: &DateRange,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match car.overlapping_active(candidate, exclude).next() {
        Some(existing) => {
            metrics::counter!(crate::observability::DATE_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::DateConflict(existing.id))
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn r(a: (i32, u32, u32), b: (i32, u32, u32)) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(a.0, a.1, a.2).unwrap(),
            NaiveDate::from_ymd_opt(b.0, b.1, b.2).unwrap(),
        )
    }

    #[test]
    fn empty_snapshot_never_conflicts() {
        assert!(!has_conflict(&r((2025, 1, 10), (2025, 1, 15)), &[]));
    }

    #[test]
    fn overlap_on_single_day() {
        let existing = [r((2025, 1, 10), (2025, 1, 15))];
        assert!(has_conflict(&r((2025, 1, 14), (2025, 1, 20)), &existing));
    }

    #[test]
    fn adjacent_ranges_do_not_conflict() {
        let existing = [r((2025, 1, 10), (2025, 1, 15)), r((2025, 1, 20), (2025, 1, 25))];
        assert!(!has_conflict(&r((2025, 1, 15), (2025, 1, 20)), &existing));
        assert!(!has_conflict(&r((2025, 1, 1), (2025, 1, 10)), &existing));
    }

    #[test]
    fn candidate_covering_existing_conflicts() {
        let existing = [r((2025, 1, 10), (2025, 1, 11))];
        assert!(has_conflict(&r((2025, 1, 1), (2025, 2, 1)), &existing));
    }

    #[test]
    fn validate_rejects_zero_and_inverted() {
        let zero = r((2025, 1, 10), (2025, 1, 10));
        let inverted = r((2025, 1, 15), (2025, 1, 10));
        assert_eq!(validate_range(&zero), Err(EngineError::InvalidRange(zero)));
        assert_eq!(validate_range(&inverted), Err(EngineError::InvalidRange(inverted)));
        assert!(validate_range(&r((2025, 1, 10), (2025, 1, 11))).is_ok());
    }

    #[test]
    fn validate_rejects_out_of_bounds() {
        assert!(matches!(
            validate_range(&r((1999, 12, 30), (2000, 1, 2))),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_range(&r((2025, 1, 1), (2027, 1, 1))),
            Err(EngineError::LimitExceeded("range too long"))
        ));
    }

    #[test]
    fn check_no_conflict_names_blocker() {
        let mut car = AssetState::new(Ulid::new(), None, 100);
        let id = Ulid::new();
        car.insert_reservation(Reservation {
            id,
            asset_id: car.id,
            owner_id: Ulid::new(),
            range: r((2025, 1, 10), (2025, 1, 15)),
            daily_rate: 100,
            amount: 500,
            status: ReservationStatus::Confirmed,
            version: 1,
        });
        let candidate = r((2025, 1, 12), (2025, 1, 13));
        assert_eq!(
            check_no_conflict(&car, &candidate, None),
            Err(EngineError::DateConflict(id))
        );
        assert!(check_no_conflict(&car, &candidate, Some(id)).is_ok());
    }
}
