use crate::model::{DateRange, Money};

use super::EngineError;

/// Flat per-day pricing: `length_days * daily_rate`.
pub fn compute_amount(range: &DateRange, daily_rate: Money) -> Result<Money, EngineError> {
    range
        .length_days()
        .checked_mul(daily_rate)
        .ok_or(EngineError::LimitExceeded("amount overflow"))
}
