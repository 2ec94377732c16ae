use ulid::Ulid;

use crate::model::DateRange;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Zero-length or inverted range.
    InvalidRange(DateRange),
    /// Overlaps the confirmed reservation with this id.
    DateConflict(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The reservation changed after the pending reschedule was produced.
    StalePending(Ulid),
    /// The descriptor's dates and extra amount disagree with the reservation's rate.
    QuoteMismatch(Ulid),
    PaymentFailed(String),
    HasActiveReservations(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange(range) => {
                write!(f, "invalid range {range}: end must be after start")
            }
            EngineError::DateConflict(id) => {
                write!(f, "dates conflict with reservation: {id}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::StalePending(id) => write!(
                f,
                "reservation {id} changed since the reschedule was quoted; start over"
            ),
            EngineError::QuoteMismatch(id) => write!(
                f,
                "reschedule terms for reservation {id} do not match its quote"
            ),
            EngineError::PaymentFailed(reason) => write!(f, "payment failed: {reason}"),
            EngineError::HasActiveReservations(id) => {
                write!(f, "cannot delete car {id}: has confirmed reservations")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
