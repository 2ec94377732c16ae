use chrono::NaiveDate;

use crate::model::{Day, Money};

pub const MAX_ASSETS_PER_TENANT: usize = 100_000;
pub const MAX_RESERVATIONS_PER_ASSET: usize = 50_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DAILY_RATE: Money = 10_000_000;

/// Longest single booking.
pub const MAX_RANGE_DAYS: i64 = 366;
/// Widest availability query.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3 * 366;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub fn min_valid_day() -> Day {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn max_valid_day() -> Day {
    NaiveDate::from_ymd_opt(2200, 1, 1).unwrap_or(NaiveDate::MAX)
}
