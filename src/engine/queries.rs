use tokio::sync::OwnedRwLockReadGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_windows;
#[cfg(test)]
use super::conflict::{has_conflict, validate_range};
use super::lifecycle::check_quote;
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_assets(&self) -> Vec<AssetInfo> {
        let cars: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(cars.len());
        for car in cars {
            let guard = car.read().await;
            if guard.deleted {
                continue;
            }
            out.push(AssetInfo {
                id: guard.id,
                name: guard.name.clone(),
                daily_rate: guard.daily_rate,
            });
        }
        out.sort_by_key(|c| c.id);
        out
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let asset_id = self
            .get_asset_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.read_asset(asset_id).await.ok_or(EngineError::NotFound(id))?;
        guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every reservation on a car, cancelled ones included, ordered by start.
    pub async fn list_reservations(&self, asset_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let guard = self
            .read_asset(asset_id)
            .await
            .ok_or(EngineError::NotFound(asset_id))?;
        Ok(guard.reservations.clone())
    }

    /// Every reservation across all cars, ordered by id (creation order for ULIDs).
    pub async fn list_all_reservations(&self) -> Vec<Reservation> {
        let cars: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for car in cars {
            let guard = car.read().await;
            if !guard.deleted {
                out.extend(guard.reservations.iter().cloned());
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }

    /// Free `[start, end)` windows on a car within `[from, to)`, keeping only
    /// windows of at least `min_days` when given.
    pub async fn compute_availability(
        &self,
        asset_id: Ulid,
        from: Day,
        to: Day,
        min_days: Option<i64>,
    ) -> Result<Vec<DateRange>, EngineError> {
        let window = DateRange::new(from, to);
        if !window.is_well_formed() {
            return Err(EngineError::InvalidRange(window));
        }
        if window.length_days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let guard = self
            .read_asset(asset_id)
            .await
            .ok_or(EngineError::NotFound(asset_id))?;

        let mut free = free_windows(&guard, &window);
        if let Some(min) = min_days {
            free.retain(|r| r.length_days() >= min);
        }
        Ok(free)
    }

    /// Would `range` be bookable on this car right now? Non-binding.
    #[cfg(test)]
    pub(crate) async fn is_available(&self, asset_id: Ulid, range: DateRange) -> Result<bool, EngineError> {
        validate_range(&range)?;
        let guard = self
            .read_asset(asset_id)
            .await
            .ok_or(EngineError::NotFound(asset_id))?;
        Ok(!has_conflict(&range, &guard.active_ranges(None)))
    }

    /// Check a reschedule descriptor against the reservation as it is now and
    /// return the amount it would commit. Nothing is held afterwards; the
    /// commit checks again under the write lock.
    pub async fn verify_quote(&self, pending: &PendingReschedule) -> Result<Money, EngineError> {
        let id = pending.reservation_id;
        let asset_id = self
            .get_asset_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.read_asset(asset_id).await.ok_or(EngineError::NotFound(id))?;
        check_quote(&guard, pending)
    }

    /// Read lock on a car that is still registered.
    async fn read_asset(&self, asset_id: Ulid) -> Option<OwnedRwLockReadGuard<AssetState>> {
        let guard = self.get_asset(&asset_id)?.read_owned().await;
        (!guard.deleted).then_some(guard)
    }
}
