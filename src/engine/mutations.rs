use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::lifecycle::{self, RescheduleDecision};
use super::{Engine, EngineError, WalCommand};

fn validate_car_fields(name: &Option<String>, daily_rate: Money) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("car name too long"));
    }
    if !(0..=MAX_DAILY_RATE).contains(&daily_rate) {
        return Err(EngineError::LimitExceeded("daily rate out of range"));
    }
    Ok(())
}

impl Engine {
    // ── Car registry ─────────────────────────────────────────

    pub async fn create_asset(
        &self,
        id: Ulid,
        name: Option<String>,
        daily_rate: Money,
    ) -> Result<(), EngineError> {
        validate_car_fields(&name, daily_rate)?;
        let _gate = self.commit_gate.read().await;
        if self.state.len() >= MAX_ASSETS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many cars"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::AssetCreated { id, name: name.clone(), daily_rate };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(AssetState::new(id, name, daily_rate))));
        debug!("car {id} registered at {daily_rate}/day");
        Ok(())
    }

    /// Change a car's name and/or rate; `None` keeps the current value. A new
    /// rate applies to future bookings only, existing reservations keep their
    /// snapshot.
    pub async fn update_asset(
        &self,
        id: Ulid,
        name: Option<String>,
        daily_rate: Option<Money>,
    ) -> Result<AssetInfo, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_asset(id).await?;

        let name = name.or_else(|| guard.name.clone());
        let daily_rate = daily_rate.unwrap_or(guard.daily_rate);
        validate_car_fields(&name, daily_rate)?;

        let event = Event::AssetUpdated { id, name, daily_rate };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("car {id} now at {}/day", guard.daily_rate);
        Ok(AssetInfo {
            id,
            name: guard.name.clone(),
            daily_rate: guard.daily_rate,
        })
    }

    pub async fn delete_asset(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_asset(id).await?;
        if guard.has_active_reservations() {
            return Err(EngineError::HasActiveReservations(id));
        }
        let event = Event::AssetDeleted { id };
        self.wal_append(&event).await?;
        self.forget_asset(&mut guard);
        debug!("car {id} deleted");
        Ok(())
    }

    // ── Reservations ─────────────────────────────────────────

    /// Book `range` on a car. The car's current rate is read once here and
    /// snapshotted onto the reservation.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        asset_id: Ulid,
        owner_id: Ulid,
        range: DateRange,
    ) -> Result<Reservation, EngineError> {
        let _gate = self.commit_gate.read().await;
        if self.reservation_to_asset.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.lock_asset(asset_id).await?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ASSET {
            return Err(EngineError::LimitExceeded("too many reservations on car"));
        }

        let amount = lifecycle::plan_create(&guard, &range)?;
        let event = Event::ReservationCreated {
            id,
            asset_id,
            owner_id,
            range,
            daily_rate: guard.daily_rate,
            amount,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("reservation {id} on car {asset_id} for {range}: {amount}");

        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Move a reservation to `new_range`. Cheaper (or equal) changes commit now;
    /// dearer ones come back as a `PendingReschedule` and commit nothing.
    pub async fn reschedule(
        &self,
        id: Ulid,
        new_range: DateRange,
    ) -> Result<RescheduleOutcome, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (asset_id, mut guard) = self.resolve_reservation_write(&id).await?;

        match lifecycle::plan_reschedule(&guard, id, &new_range)? {
            RescheduleDecision::RequirePayment(pending) => {
                debug!(
                    "reservation {id} reschedule to {new_range} needs {} more",
                    pending.extra_amount
                );
                Ok(RescheduleOutcome::PendingPayment(pending))
            }
            RescheduleDecision::Apply { amount, refund } => {
                let version = guard
                    .reservation(id)
                    .map(|r| r.version + 1)
                    .ok_or(EngineError::NotFound(id))?;
                let event = Event::ReservationRescheduled {
                    id,
                    asset_id,
                    range: new_range,
                    amount,
                    version,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                debug!("reservation {id} moved to {new_range}, refund {refund}");
                let reservation = guard
                    .reservation(id)
                    .cloned()
                    .ok_or(EngineError::NotFound(id))?;
                Ok(RescheduleOutcome::Applied { reservation, refund })
            }
        }
    }

    /// Commit a reschedule whose extra amount has been paid. Fails `StalePending`
    /// if the reservation moved or was cancelled since the quote.
    pub async fn complete_pending_reschedule(
        &self,
        pending: &PendingReschedule,
    ) -> Result<Reservation, EngineError> {
        let id = pending.reservation_id;
        let _gate = self.commit_gate.read().await;
        let (asset_id, mut guard) = self.resolve_reservation_write(&id).await?;

        let amount = lifecycle::plan_completion(&guard, pending)?;
        let event = Event::ReservationRescheduled {
            id,
            asset_id,
            range: pending.new_range,
            amount,
            version: pending.version + 1,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("reservation {id} moved to {} after payment", pending.new_range);

        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Idempotent. Cancelling a cancelled reservation writes nothing.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (asset_id, mut guard) = self.resolve_reservation_write(&id).await?;

        if let Some(version) = lifecycle::plan_cancel(&guard, id)? {
            let event = Event::ReservationCancelled { id, asset_id, version };
            self.persist_and_apply(&mut guard, &event).await?;
            debug!("reservation {id} cancelled");
        }

        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to rebuild current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();
        let cars: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();

        for car in cars {
            let guard = car.read().await;
            events.push(Event::AssetCreated {
                id: guard.id,
                name: guard.name.clone(),
                daily_rate: guard.daily_rate,
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    asset_id: guard.id,
                    owner_id: r.owner_id,
                    range: r.range,
                    daily_rate: r.daily_rate,
                    amount: r.amount,
                });
                match r.status {
                    ReservationStatus::Cancelled => events.push(Event::ReservationCancelled {
                        id: r.id,
                        asset_id: guard.id,
                        version: r.version,
                    }),
                    // Replay starts every reservation at version 1; carry the
                    // real version forward so pending quotes stay valid.
                    ReservationStatus::Confirmed if r.version > 1 => {
                        events.push(Event::ReservationRescheduled {
                            id: r.id,
                            asset_id: guard.id,
                            range: r.range,
                            amount: r.amount,
                            version: r.version,
                        })
                    }
                    ReservationStatus::Confirmed => {}
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
