use async_trait::async_trait;
use tracing::info;
use ulid::Ulid;

use crate::model::Money;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    /// The provider refused the charge or refund.
    Declined(String),
    /// The provider could not be reached or answered nonsense.
    Unavailable(String),
}

impl std::fmt::Display for PaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentError::Declined(reason) => write!(f, "declined: {reason}"),
            PaymentError::Unavailable(reason) => write!(f, "provider unavailable: {reason}"),
        }
    }
}

impl std::error::Error for PaymentError {}

/// Payment provider. Only the booking service calls it; the engine never sees
/// money leave or arrive.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Capture `amount` against a reservation. Called with no engine lock held.
    async fn charge(&self, reservation_id: Ulid, amount: Money) -> Result<(), PaymentError>;

    /// Return `amount` for a reservation.
    async fn refund(&self, reservation_id: Ulid, amount: Money) -> Result<(), PaymentError>;
}

/// Accepts everything. Stands in for a real provider in the server binary.
#[derive(Debug, Default)]
pub struct StubGateway;

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn charge(&self, reservation_id: Ulid, amount: Money) -> Result<(), PaymentError> {
        if amount < 0 {
            return Err(PaymentError::Declined(format!("negative charge {amount}")));
        }
        info!("stub payment: charged {amount} for reservation {reservation_id}");
        Ok(())
    }

    async fn refund(&self, reservation_id: Ulid, amount: Money) -> Result<(), PaymentError> {
        if amount < 0 {
            return Err(PaymentError::Declined(format!("negative refund {amount}")));
        }
        info!("stub payment: refunded {amount} for reservation {reservation_id}");
        Ok(())
    }
}
