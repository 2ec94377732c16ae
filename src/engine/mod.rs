mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod pricing;
mod queries;

pub use availability::{free_windows, merge_overlapping, subtract_ranges};
pub use conflict::has_conflict;
pub use error::EngineError;
pub use pricing::compute_amount;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedAssetState = Arc<RwLock<AssetState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that are already queued when one arrives ride along in
/// the same fsync; everyone in the batch gets the same result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't bleed into
    // the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The reservation store: one lock per car, so bookings on different cars never
/// wait on each other.
pub struct Engine {
    pub state: DashMap<Ulid, SharedAssetState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → car id.
    pub(super) reservation_to_asset: DashMap<Ulid, Ulid>,
    /// Shared by every mutation, exclusive for compaction, so a compacted WAL
    /// never misses an event committed while it was being written.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply an event to one car. The caller holds the car's write lock.
fn apply_to_asset(car: &mut AssetState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated {
            id,
            asset_id,
            owner_id,
            range,
            daily_rate,
            amount,
        } => {
            car.insert_reservation(Reservation {
                id: *id,
                asset_id: *asset_id,
                owner_id: *owner_id,
                range: *range,
                daily_rate: *daily_rate,
                amount: *amount,
                status: ReservationStatus::Confirmed,
                version: 1,
            });
            index.insert(*id, *asset_id);
        }
        Event::ReservationRescheduled {
            id,
            range,
            amount,
            version,
            ..
        } => {
            // Re-insert so the list stays sorted by start.
            if let Some(mut reservation) = car.take_reservation(*id) {
                reservation.range = *range;
                reservation.amount = *amount;
                reservation.version = *version;
                car.insert_reservation(reservation);
            }
        }
        Event::ReservationCancelled { id, version, .. } => {
            if let Some(reservation) = car.reservation_mut(*id) {
                reservation.status = ReservationStatus::Cancelled;
                reservation.version = *version;
            }
        }
        Event::AssetUpdated { name, daily_rate, .. } => {
            car.name = name.clone();
            car.daily_rate = *daily_rate;
        }
        // Created/Deleted are handled at the DashMap level.
        Event::AssetCreated { .. } | Event::AssetDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            reservation_to_asset: DashMap::new(),
            commit_gate: RwLock::new(()),
        };

        // We own every Arc during replay, so try_write never contends. Blocking
        // lock variants are off limits: this can run inside an async context.
        for event in &events {
            match event {
                Event::AssetCreated { id, name, daily_rate } => {
                    let car = AssetState::new(*id, name.clone(), *daily_rate);
                    engine.state.insert(*id, Arc::new(RwLock::new(car)));
                }
                Event::AssetDeleted { id } => {
                    if let Some(car) = engine.get_asset(id) {
                        let mut guard = car.try_write().expect("replay: uncontended write");
                        engine.forget_asset(&mut guard);
                    }
                }
                other => {
                    let Some(asset_id) = event_asset_id(other) else { continue };
                    if let Some(entry) = engine.state.get(&asset_id) {
                        let car = entry.clone();
                        let mut guard = car.try_write().expect("replay: uncontended write");
                        apply_to_asset(&mut guard, other, &engine.reservation_to_asset);
                    }
                }
            }
        }

        tracing::debug!(
            "replayed {} events: {} cars, {} reservations",
            events.len(),
            engine.state.len(),
            engine.reservation_to_asset.len()
        );
        Ok(engine)
    }

    /// Durably append one event via the group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_asset(&self, id: &Ulid) -> Option<SharedAssetState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_asset_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_asset.get(reservation_id).map(|e| *e.value())
    }

    /// WAL append, then apply. Memory is untouched if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        car: &mut AssetState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_asset(car, event, &self.reservation_to_asset);
        Ok(())
    }

    /// Reservation id → car id → that car's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<AssetState>), EngineError> {
        let asset_id = self
            .get_asset_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let car = self
            .get_asset(&asset_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let guard = car.write_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(*reservation_id));
        }
        Ok((asset_id, guard))
    }

    /// Unregister a car and its reservations. The caller holds the car's write
    /// lock, so anyone queued behind it finds `deleted` set.
    pub(super) fn forget_asset(&self, car: &mut AssetState) {
        car.deleted = true;
        for r in &car.reservations {
            self.reservation_to_asset.remove(&r.id);
        }
        self.state.remove(&car.id);
    }

    /// Write lock on a car that is still registered.
    pub(super) async fn lock_asset(
        &self,
        asset_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<AssetState>, EngineError> {
        let car = self
            .get_asset(&asset_id)
            .ok_or(EngineError::NotFound(asset_id))?;
        let guard = car.write_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(asset_id));
        }
        Ok(guard)
    }
}

/// The car an event belongs to (not meaningful for create/delete).
fn event_asset_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationCreated { asset_id, .. }
        | Event::ReservationRescheduled { asset_id, .. }
        | Event::ReservationCancelled { asset_id, .. } => Some(*asset_id),
        Event::AssetUpdated { id, .. } => Some(*id),
        Event::AssetCreated { .. } | Event::AssetDeleted { .. } => None,
    }
}
