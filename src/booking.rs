use std::sync::Arc;

use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{
    PAYMENTS_TOTAL, REFUNDS_UNSETTLED_TOTAL, RESCHEDULES_TOTAL, RESERVATIONS_CANCELLED_TOTAL,
    RESERVATIONS_CREATED_TOTAL,
};
use crate::payment::PaymentGateway;

/// A reschedule as seen by the caller. `refund_settled` is false only when a
/// refund was owed and the gateway failed to pay it; the new dates are committed
/// either way and the caller owns the retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescheduleResult {
    pub outcome: RescheduleOutcome,
    pub refund_settled: bool,
}

/// Sequences engine commits and gateway calls. No engine lock is held across
/// a payment call.
pub struct BookingService {
    engine: Arc<Engine>,
    payments: Arc<dyn PaymentGateway>,
}

impl BookingService {
    pub fn new(engine: Arc<Engine>, payments: Arc<dyn PaymentGateway>) -> Self {
        Self { engine, payments }
    }

    /// Registry and query operations go straight to the engine.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn create(
        &self,
        id: Ulid,
        asset_id: Ulid,
        owner_id: Ulid,
        range: DateRange,
    ) -> Result<Reservation, EngineError> {
        let reservation = self
            .engine
            .create_reservation(id, asset_id, owner_id, range)
            .await?;
        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
        Ok(reservation)
    }

    pub async fn reschedule(
        &self,
        id: Ulid,
        new_range: DateRange,
    ) -> Result<RescheduleResult, EngineError> {
        let outcome = self.engine.reschedule(id, new_range).await?;
        let refund_settled = match &outcome {
            RescheduleOutcome::Applied { refund, .. } if *refund > 0 => {
                metrics::counter!(RESCHEDULES_TOTAL, "outcome" => "applied").increment(1);
                self.settle_refund(id, *refund).await
            }
            RescheduleOutcome::Applied { .. } => {
                metrics::counter!(RESCHEDULES_TOTAL, "outcome" => "applied").increment(1);
                true
            }
            RescheduleOutcome::PendingPayment(pending) => {
                metrics::counter!(RESCHEDULES_TOTAL, "outcome" => "pending").increment(1);
                debug!(
                    "reservation {id} awaits {} before moving to {}",
                    pending.extra_amount, pending.new_range
                );
                true
            }
        };
        Ok(RescheduleResult { outcome, refund_settled })
    }

    /// Charge the extra amount, then commit. A declined charge leaves the
    /// reservation untouched. If the commit fails after the charge went through,
    /// the charge is refunded and the commit error is returned.
    pub async fn pay_and_complete(
        &self,
        pending: &PendingReschedule,
    ) -> Result<Reservation, EngineError> {
        let id = pending.reservation_id;
        // A stale or doctored quote is never charged.
        self.engine.verify_quote(pending).await?;

        match self.payments.charge(id, pending.extra_amount).await {
            Ok(()) => {
                metrics::counter!(PAYMENTS_TOTAL, "kind" => "charge", "status" => "ok").increment(1);
            }
            Err(e) => {
                metrics::counter!(PAYMENTS_TOTAL, "kind" => "charge", "status" => "failed")
                    .increment(1);
                warn!("charge of {} for reservation {id} failed: {e}", pending.extra_amount);
                return Err(EngineError::PaymentFailed(e.to_string()));
            }
        }

        match self.engine.complete_pending_reschedule(pending).await {
            Ok(reservation) => {
                metrics::counter!(RESCHEDULES_TOTAL, "outcome" => "completed").increment(1);
                Ok(reservation)
            }
            Err(commit_err) => {
                warn!("reservation {id}: paid reschedule did not commit ({commit_err}), refunding");
                self.settle_refund(id, pending.extra_amount).await;
                Err(commit_err)
            }
        }
    }

    /// Commit a reschedule whose payment was confirmed elsewhere.
    pub async fn complete_pending_reschedule(
        &self,
        pending: &PendingReschedule,
    ) -> Result<Reservation, EngineError> {
        let reservation = self.engine.complete_pending_reschedule(pending).await?;
        metrics::counter!(RESCHEDULES_TOTAL, "outcome" => "completed").increment(1);
        Ok(reservation)
    }

    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let reservation = self.engine.cancel_reservation(id).await?;
        metrics::counter!(RESERVATIONS_CANCELLED_TOTAL).increment(1);
        Ok(reservation)
    }

    async fn settle_refund(&self, id: Ulid, amount: Money) -> bool {
        match self.payments.refund(id, amount).await {
            Ok(()) => {
                metrics::counter!(PAYMENTS_TOTAL, "kind" => "refund", "status" => "ok").increment(1);
                true
            }
            Err(e) => {
                metrics::counter!(PAYMENTS_TOTAL, "kind" => "refund", "status" => "failed")
                    .increment(1);
                metrics::counter!(REFUNDS_UNSETTLED_TOTAL).increment(1);
                error!("refund of {amount} for reservation {id} failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::PaymentError;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn jan(a: u32, b: u32) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2025, 1, a).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, b).unwrap(),
        )
    }

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("autobook_test_booking");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    /// Records every call; optionally declines charges or fails refunds.
    #[derive(Default)]
    struct RecordingGateway {
        decline_charges: bool,
        fail_refunds: bool,
        charges: Mutex<Vec<(Ulid, Money)>>,
        refunds: Mutex<Vec<(Ulid, Money)>>,
    }

    #[async_trait]
    impl PaymentGateway for RecordingGateway {
        async fn charge(&self, id: Ulid, amount: Money) -> Result<(), PaymentError> {
            if self.decline_charges {
                return Err(PaymentError::Declined("insufficient funds".into()));
            }
            self.charges.lock().unwrap().push((id, amount));
            Ok(())
        }

        async fn refund(&self, id: Ulid, amount: Money) -> Result<(), PaymentError> {
            if self.fail_refunds {
                return Err(PaymentError::Unavailable("timeout".into()));
            }
            self.refunds.lock().unwrap().push((id, amount));
            Ok(())
        }
    }

    /// Cancels the reservation while the charge is in flight.
    struct CancellingGateway {
        engine: Arc<Engine>,
        inner: RecordingGateway,
    }

    #[async_trait]
    impl PaymentGateway for CancellingGateway {
        async fn charge(&self, id: Ulid, amount: Money) -> Result<(), PaymentError> {
            self.engine
                .cancel_reservation(id)
                .await
                .map_err(|e| PaymentError::Unavailable(e.to_string()))?;
            self.inner.charge(id, amount).await
        }

        async fn refund(&self, id: Ulid, amount: Money) -> Result<(), PaymentError> {
            self.inner.refund(id, amount).await
        }
    }

    async fn setup(wal: &str, gateway: Arc<RecordingGateway>) -> (BookingService, Ulid) {
        let engine = Arc::new(Engine::new(test_wal_path(wal)).unwrap());
        let car = Ulid::new();
        engine.create_asset(car, None, 100).await.unwrap();
        (BookingService::new(engine, gateway), car)
    }

    #[tokio::test]
    async fn shorter_reschedule_refunds_after_commit() {
        let gw = Arc::new(RecordingGateway::default());
        let (svc, car) = setup("refund.wal", gw.clone()).await;
        let r = svc.create(Ulid::new(), car, Ulid::new(), jan(10, 15)).await.unwrap();

        let result = svc.reschedule(r.id, jan(10, 13)).await.unwrap();
        assert!(result.refund_settled);
        assert!(matches!(
            result.outcome,
            RescheduleOutcome::Applied { refund: 200, .. }
        ));
        assert_eq!(*gw.refunds.lock().unwrap(), vec![(r.id, 200)]);
    }

    #[tokio::test]
    async fn zero_refund_skips_gateway() {
        let gw = Arc::new(RecordingGateway::default());
        let (svc, car) = setup("no_refund.wal", gw.clone()).await;
        let r = svc.create(Ulid::new(), car, Ulid::new(), jan(10, 15)).await.unwrap();
        svc.reschedule(r.id, jan(20, 25)).await.unwrap();
        assert!(gw.refunds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_refund_keeps_commit() {
        let gw = Arc::new(RecordingGateway {
            fail_refunds: true,
            ..Default::default()
        });
        let (svc, car) = setup("refund_fails.wal", gw).await;
        let r = svc.create(Ulid::new(), car, Ulid::new(), jan(10, 15)).await.unwrap();

        let result = svc.reschedule(r.id, jan(10, 12)).await.unwrap();
        assert!(!result.refund_settled);
        let stored = svc.engine().get_reservation(r.id).await.unwrap();
        assert_eq!(stored.range, jan(10, 12));
    }

    #[tokio::test]
    async fn pay_and_complete_charges_then_commits() {
        let gw = Arc::new(RecordingGateway::default());
        let (svc, car) = setup("pay.wal", gw.clone()).await;
        let r = svc.create(Ulid::new(), car, Ulid::new(), jan(10, 15)).await.unwrap();

        let RescheduleOutcome::PendingPayment(pending) =
            svc.reschedule(r.id, jan(10, 17)).await.unwrap().outcome
        else {
            panic!("expected pending");
        };
        assert_eq!(pending.extra_amount, 200);

        let done = svc.pay_and_complete(&pending).await.unwrap();
        assert_eq!(done.range, jan(10, 17));
        assert_eq!(done.amount, 700);
        assert_eq!(*gw.charges.lock().unwrap(), vec![(r.id, 200)]);

        // Same descriptor again: stale, and never charged twice.
        assert_eq!(
            svc.pay_and_complete(&pending).await,
            Err(EngineError::StalePending(r.id))
        );
        assert_eq!(gw.charges.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn doctored_quote_is_never_charged() {
        let gw = Arc::new(RecordingGateway::default());
        let (svc, car) = setup("doctored.wal", gw.clone()).await;
        let r = svc.create(Ulid::new(), car, Ulid::new(), jan(1, 6)).await.unwrap();

        let forged = PendingReschedule {
            reservation_id: r.id,
            new_range: jan(1, 21),
            extra_amount: 1,
            version: r.version,
        };
        assert_eq!(
            svc.pay_and_complete(&forged).await,
            Err(EngineError::QuoteMismatch(r.id))
        );
        assert!(gw.charges.lock().unwrap().is_empty());
        assert_eq!(svc.engine().get_reservation(r.id).await.unwrap(), r);
    }

    #[tokio::test]
    async fn declined_charge_leaves_reservation_alone() {
        let gw = Arc::new(RecordingGateway {
            decline_charges: true,
            ..Default::default()
        });
        let (svc, car) = setup("declined.wal", gw).await;
        let r = svc.create(Ulid::new(), car, Ulid::new(), jan(10, 15)).await.unwrap();
        let RescheduleOutcome::PendingPayment(pending) =
            svc.reschedule(r.id, jan(10, 17)).await.unwrap().outcome
        else {
            panic!("expected pending");
        };

        assert!(matches!(
            svc.pay_and_complete(&pending).await,
            Err(EngineError::PaymentFailed(_))
        ));
        assert_eq!(svc.engine().get_reservation(r.id).await.unwrap(), r);
    }

    #[tokio::test]
    async fn stale_commit_after_charge_is_refunded() {
        let engine = Arc::new(Engine::new(test_wal_path("compensate.wal")).unwrap());
        let car = Ulid::new();
        engine.create_asset(car, None, 100).await.unwrap();
        let gw = Arc::new(CancellingGateway {
            engine: engine.clone(),
            inner: RecordingGateway::default(),
        });
        let svc = BookingService::new(engine, gw.clone());

        let r = svc.create(Ulid::new(), car, Ulid::new(), jan(10, 15)).await.unwrap();
        let RescheduleOutcome::PendingPayment(pending) =
            svc.reschedule(r.id, jan(10, 17)).await.unwrap().outcome
        else {
            panic!("expected pending");
        };

        assert_eq!(
            svc.pay_and_complete(&pending).await,
            Err(EngineError::StalePending(r.id))
        );
        assert_eq!(*gw.inner.charges.lock().unwrap(), vec![(r.id, 200)]);
        assert_eq!(*gw.inner.refunds.lock().unwrap(), vec![(r.id, 200)]);
    }

    #[tokio::test]
    async fn out_of_band_completion_and_cancel() {
        let gw = Arc::new(RecordingGateway::default());
        let (svc, car) = setup("out_of_band.wal", gw.clone()).await;
        let r = svc.create(Ulid::new(), car, Ulid::new(), jan(10, 15)).await.unwrap();
        let RescheduleOutcome::PendingPayment(pending) =
            svc.reschedule(r.id, jan(10, 16)).await.unwrap().outcome
        else {
            panic!("expected pending");
        };

        let moved = svc.complete_pending_reschedule(&pending).await.unwrap();
        assert_eq!(moved.amount, 600);
        assert!(gw.charges.lock().unwrap().is_empty());

        let cancelled = svc.cancel(r.id).await.unwrap();
        assert_eq!(cancelled.status, ReservationStatus::Cancelled);
        assert_eq!(svc.cancel(r.id).await.unwrap(), cancelled);
        assert!(gw.refunds.lock().unwrap().is_empty());
    }
}
