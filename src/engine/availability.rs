use crate::model::*;

/// Free windows of `car` inside `window`: the window minus every confirmed
/// reservation, clamped to the window.
pub fn free_windows(car: &AssetState, window: &DateRange) -> Vec<DateRange> {
    let mut booked: Vec<DateRange> = car
        .overlapping_active(window, None)
        .map(|r| r.range)
        .collect();
    booked.sort_by_key(|r| r.start);
    let booked = merge_overlapping(&booked);
    subtract_ranges(&[*window], &booked)
}

/// Merge sorted ranges into disjoint ranges. Touching ranges are joined.
pub fn merge_overlapping(sorted: &[DateRange]) -> Vec<DateRange> {
    let mut merged: Vec<DateRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted and disjoint.
pub fn subtract_ranges(base: &[DateRange], to_remove: &[DateRange]) -> Vec<DateRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = to_remove[j];
            if r.start > cursor {
                result.push(DateRange::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(DateRange::new(cursor, b.end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn jan(a: u32, b: u32) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2025, 1, a).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, b).unwrap(),
        )
    }

    fn car_with(bookings: &[(DateRange, ReservationStatus)]) -> AssetState {
        let mut car = AssetState::new(Ulid::new(), None, 50);
        for (range, status) in bookings {
            car.insert_reservation(Reservation {
                id: Ulid::new(),
                asset_id: car.id,
                owner_id: Ulid::new(),
                range: *range,
                daily_rate: 50,
                amount: 50 * range.length_days(),
                status: *status,
                version: 1,
            });
        }
        car
    }

    #[test]
    fn empty_car_is_free_all_window() {
        let car = car_with(&[]);
        assert_eq!(free_windows(&car, &jan(1, 31)), vec![jan(1, 31)]);
    }

    #[test]
    fn bookings_split_window() {
        let car = car_with(&[
            (jan(5, 10), ReservationStatus::Confirmed),
            (jan(15, 20), ReservationStatus::Confirmed),
        ]);
        assert_eq!(
            free_windows(&car, &jan(1, 31)),
            vec![jan(1, 5), jan(10, 15), jan(20, 31)]
        );
    }

    #[test]
    fn cancelled_bookings_free_their_days() {
        let car = car_with(&[
            (jan(5, 10), ReservationStatus::Cancelled),
            (jan(15, 20), ReservationStatus::Confirmed),
        ]);
        assert_eq!(free_windows(&car, &jan(1, 31)), vec![jan(1, 15), jan(20, 31)]);
    }

    #[test]
    fn back_to_back_bookings_leave_no_gap() {
        let car = car_with(&[
            (jan(5, 10), ReservationStatus::Confirmed),
            (jan(10, 15), ReservationStatus::Confirmed),
        ]);
        assert_eq!(free_windows(&car, &jan(1, 20)), vec![jan(1, 5), jan(15, 20)]);
    }

    #[test]
    fn booking_straddling_window_edge_is_clamped() {
        let car = car_with(&[(jan(1, 8), ReservationStatus::Confirmed)]);
        assert_eq!(free_windows(&car, &jan(5, 12)), vec![jan(8, 12)]);
    }

    #[test]
    fn fully_booked_window() {
        let car = car_with(&[(jan(1, 31), ReservationStatus::Confirmed)]);
        assert!(free_windows(&car, &jan(5, 12)).is_empty());
    }

    #[test]
    fn merge_joins_touching() {
        assert_eq!(
            merge_overlapping(&[jan(1, 5), jan(5, 8), jan(10, 12)]),
            vec![jan(1, 8), jan(10, 12)]
        );
    }

    #[test]
    fn subtract_nothing() {
        assert_eq!(subtract_ranges(&[jan(1, 10)], &[]), vec![jan(1, 10)]);
        assert!(subtract_ranges(&[], &[jan(1, 10)]).is_empty());
    }
}
