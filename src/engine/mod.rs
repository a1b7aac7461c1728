mod availability;
mod conflict;
mod error;
mod mutations;
mod pricing;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::build_availability;
pub use conflict::{first_conflict, is_occupied};
pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use pricing::{price_for_slot, total_price};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::effects::{EffectSender, SideEffect};
use crate::model::*;
use crate::wal::Wal;

pub type SharedFacilityState = Arc<RwLock<FacilityState>>;

/// An entity id held in the reverse index by an in-flight create.
pub(super) struct IdClaim<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    facility_id: Ulid,
    committed: bool,
}

impl IdClaim<'_> {
    pub(super) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let facility_id = self.facility_id;
            self.index.remove_if(&self.id, |_, fid| *fid == facility_id);
        }
    }
}

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

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is queued, then issues
/// one fsync for the whole batch before answering every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
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

pub struct Engine {
    pub state: DashMap<Ulid, SharedFacilityState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) effects: EffectSender,
    /// Reverse lookup: reservation or pricing rule id → facility id
    pub(super) entity_to_facility: DashMap<Ulid, Ulid>,
}

/// Apply an event to a FacilityState (no locking; the caller holds the lock).
fn apply_to_facility(fs: &mut FacilityState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ScheduleSet {
            day_type,
            open_time,
            close_time,
            ..
        } => {
            fs.set_schedule(ScheduleRule {
                day_type: *day_type,
                open_time: open_time.clone(),
                close_time: close_time.clone(),
            });
        }
        Event::ScheduleRemoved { day_type, .. } => {
            fs.remove_schedule(*day_type);
        }
        Event::PricingAdded {
            id,
            facility_id,
            day_type,
            start_hour,
            end_hour,
            price_per_hour,
        } => {
            fs.insert_pricing(PricingRule {
                id: *id,
                day_type: *day_type,
                start_hour: start_hour.clone(),
                end_hour: end_hour.clone(),
                price_per_hour: *price_per_hour,
            });
            entity_map.insert(*id, *facility_id);
        }
        Event::PricingRemoved { id, .. } => {
            fs.remove_pricing(*id);
            entity_map.remove(id);
        }
        Event::ReservationCreated {
            id,
            user_id,
            facility_id,
            span,
            status,
            total_price,
            created_at,
        } => {
            fs.insert_reservation(Reservation {
                id: *id,
                user_id: *user_id,
                facility_id: *facility_id,
                span: *span,
                status: *status,
                total_price: *total_price,
                created_at: *created_at,
                calendar_event_id: None,
            });
            entity_map.insert(*id, *facility_id);
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(r) = fs.reservation_mut(*id) {
                r.status = *status;
            }
        }
        Event::CalendarEventLinked { id, event_id, .. } => {
            if let Some(r) = fs.reservation_mut(*id) {
                r.calendar_event_id = Some(event_id.clone());
            }
        }
        // Handled at the DashMap level
        Event::FacilityCreated { .. } | Event::FacilityDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, effects: EffectSender) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            effects,
            entity_to_facility: DashMap::new(),
        };

        // Sole owner of these Arcs during replay, so try_write never contends.
        // blocking_write would panic here when replay runs inside the runtime.
        for event in &events {
            match event {
                Event::FacilityCreated { id, name } => {
                    let fs = FacilityState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(fs)));
                }
                Event::FacilityDeleted { id } => {
                    engine.forget_facility(*id);
                }
                other => {
                    let Some(entry) = engine.state.get(&other.facility_id()) else {
                        continue;
                    };
                    let fs_arc = entry.clone();
                    drop(entry);
                    let Ok(mut guard) = fs_arc.try_write() else {
                        return Err(io::Error::other("replay: facility lock contended"));
                    };
                    apply_to_facility(&mut guard, other, &engine.entity_to_facility);
                }
            }
        }

        tracing::info!(
            "replayed {} events into {} facilities",
            events.len(),
            engine.state.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    pub fn get_facility(&self, id: &Ulid) -> Option<SharedFacilityState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_facility_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_facility.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append then apply. The caller holds the facility write lock across
    /// its checks and this call, which makes check-then-write atomic.
    pub(super) async fn persist_and_apply(
        &self,
        fs: &mut FacilityState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_facility(fs, event, &self.entity_to_facility);
        Ok(())
    }

    /// Hand a committed change to the side-effect worker.
    pub(super) fn emit(&self, effect: SideEffect) {
        self.effects.send(effect);
    }

    /// Lookup entity → facility, get facility, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<FacilityState>, EngineError> {
        let facility_id = self
            .get_facility_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.write_owned().await;
        // Deleted while we waited for the lock.
        if !self.state.contains_key(&facility_id) {
            return Err(EngineError::NotFound(facility_id));
        }
        Ok(guard)
    }

    /// Take a client-chosen entity id for `facility_id` in the reverse index.
    /// The claim is released on drop unless the create commits.
    pub(super) fn claim_id(&self, id: Ulid, facility_id: Ulid) -> Result<IdClaim<'_>, EngineError> {
        match self.entity_to_facility.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(facility_id);
                Ok(IdClaim {
                    index: &self.entity_to_facility,
                    id,
                    facility_id,
                    committed: false,
                })
            }
        }
    }

    /// Drop a facility and every reverse-index entry pointing at it.
    fn forget_facility(&self, id: Ulid) {
        self.state.remove(&id);
        self.entity_to_facility.retain(|_, fid| *fid != id);
    }
}
