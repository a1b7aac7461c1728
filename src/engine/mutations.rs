use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::calendar;
use crate::effects::SideEffect;
use crate::limits::*;
use crate::model::*;
use crate::observability as obs;

use super::conflict::{check_no_conflict, now_ms, validate_request};
use super::pricing::total_price;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Facility configuration ───────────────────────────────────

    pub async fn create_facility(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.state.len() >= MAX_FACILITIES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many facilities"));
        }
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("facility name too long"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::FacilityCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(FacilityState::new(id, name))));
        info!(facility = %id, "facility created");
        Ok(())
    }

    /// Refused while any reservation is still pending or confirmed.
    pub async fn delete_facility(&self, id: Ulid) -> Result<(), EngineError> {
        let fs = self.get_facility(&id).ok_or(EngineError::NotFound(id))?;
        let guard = fs.write().await;
        if guard.live_reservation_count() > 0 {
            return Err(EngineError::HasLiveReservations(id));
        }

        self.wal_append(&Event::FacilityDeleted { id }).await?;
        self.forget_facility(id);
        drop(guard);
        info!(facility = %id, "facility deleted");
        Ok(())
    }

    pub async fn set_schedule(
        &self,
        facility_id: Ulid,
        day_type: DayType,
        open_time: &str,
        close_time: &str,
    ) -> Result<(), EngineError> {
        let open_time = calendar::normalize_time_of_day(open_time)?;
        let close_time = calendar::normalize_time_of_day(close_time)?;
        if open_time >= close_time {
            return Err(EngineError::Validation(
                "close_time must be after open_time".into(),
            ));
        }

        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let mut guard = fs.write().await;
        if guard.schedule_for(day_type).is_some() {
            return Err(EngineError::ScheduleExists(facility_id, day_type));
        }

        let event = Event::ScheduleSet {
            facility_id,
            day_type,
            open_time,
            close_time,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_schedule(&self, facility_id: Ulid, day_type: DayType) -> Result<(), EngineError> {
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let mut guard = fs.write().await;
        if guard.schedule_for(day_type).is_none() {
            return Err(EngineError::NotFound(facility_id));
        }

        let event = Event::ScheduleRemoved { facility_id, day_type };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn add_pricing(
        &self,
        id: Ulid,
        facility_id: Ulid,
        day_type: DayType,
        start_hour: &str,
        end_hour: &str,
        price_per_hour: f64,
    ) -> Result<(), EngineError> {
        let start_hour = calendar::normalize_time_of_day(start_hour)?;
        let end_hour = calendar::normalize_time_of_day(end_hour)?;
        if start_hour >= end_hour {
            return Err(EngineError::Validation(
                "end_hour must be after start_hour".into(),
            ));
        }
        if !price_per_hour.is_finite() || price_per_hour < 0.0 {
            return Err(EngineError::Validation(
                "price_per_hour must be a non-negative number".into(),
            ));
        }
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let claim = self.claim_id(id, facility_id)?;
        let mut guard = fs.write().await;
        if !self.state.contains_key(&facility_id) {
            return Err(EngineError::NotFound(facility_id));
        }
        if guard.pricing.len() >= MAX_PRICING_RULES_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many pricing rules on facility"));
        }

        let event = Event::PricingAdded {
            id,
            facility_id,
            day_type,
            start_hour,
            end_hour,
            price_per_hour,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        claim.commit();
        Ok(())
    }

    pub async fn remove_pricing(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let facility_id = guard.id;
        if !guard.pricing.iter().any(|p| p.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::PricingRemoved { id, facility_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(facility_id)
    }

    // ── Reservations ─────────────────────────────────────────────

    /// Book `[start, end)` for `user_id`.
    ///
    /// Checks run in order: interval shape, not in the past, no conflict;
    /// then the price is fixed from the start instant's rate, 0.0 when no
    /// pricing row covers it. The facility write lock is held from the conflict
    /// check until the event is durable and applied, so two overlapping
    /// requests can never both commit.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        user_id: Ulid,
        facility_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Reservation, EngineError> {
        let now = now_ms();
        let span = validate_request(start, end, now)?;
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let claim = self.claim_id(id, facility_id)?;
        let mut guard = fs.write().await;
        // Deleted while we waited for the lock.
        if !self.state.contains_key(&facility_id) {
            return Err(EngineError::NotFound(facility_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many reservations on facility"));
        }

        if let Err(e) = check_no_conflict(&guard, &span) {
            metrics::counter!(obs::RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let total_price = total_price(&span, &guard.pricing)?;
        if total_price == 0.0 {
            warn!(
                facility = %facility_id,
                start = %calendar::format_rfc3339(start),
                "reservation priced at 0.0; no pricing row covers its start"
            );
        }

        let event = Event::ReservationCreated {
            id,
            user_id,
            facility_id,
            span,
            status: ReservationStatus::Pending,
            total_price,
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        claim.commit();
        let reservation = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        drop(guard);

        metrics::counter!(obs::RESERVATIONS_CREATED_TOTAL).increment(1);
        debug!(reservation = %id, facility = %facility_id, total_price, "reservation created");
        self.emit(SideEffect::ReservationCreated(reservation.clone()));
        Ok(reservation)
    }

    /// Cancel a reservation owned by `user_id`.
    ///
    /// Missing and already-cancelled rows both report `NotFound`, so a repeat
    /// cancel never writes a second transition or emits a second side effect.
    pub async fn cancel_reservation(&self, id: Ulid, user_id: Ulid) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.reservation(id).ok_or(EngineError::NotFound(id))?;
        if current.user_id != user_id {
            return Err(EngineError::Unauthorized(id));
        }
        if current.status == ReservationStatus::Cancelled {
            return Err(EngineError::NotFound(id));
        }

        let reservation = self
            .transition(&mut guard, id, ReservationStatus::Cancelled)
            .await?;
        drop(guard);

        metrics::counter!(obs::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        debug!(reservation = %id, "reservation cancelled");
        self.emit(SideEffect::ReservationCancelled(reservation.clone()));
        Ok(reservation)
    }

    /// Payment completed: `pending` → `confirmed`.
    ///
    /// A reservation that is already paid is returned unchanged.
    pub async fn confirm_reservation(&self, id: Ulid, user_id: Ulid) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.reservation(id).ok_or(EngineError::NotFound(id))?;
        if current.user_id != user_id {
            return Err(EngineError::Unauthorized(id));
        }
        match current.status {
            ReservationStatus::Cancelled => {
                return Err(EngineError::Validation("reservation is cancelled".into()));
            }
            ReservationStatus::Confirmed | ReservationStatus::Completed => {
                return Ok(current.clone());
            }
            ReservationStatus::Pending => {}
        }

        let reservation = self
            .transition(&mut guard, id, ReservationStatus::Confirmed)
            .await?;
        drop(guard);

        debug!(reservation = %id, "reservation confirmed");
        self.emit(SideEffect::ReservationConfirmed(reservation.clone()));
        Ok(reservation)
    }

    /// `confirmed` → `completed` once the reservation has ended.
    pub async fn complete_reservation(&self, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let current = guard.reservation(id).ok_or(EngineError::NotFound(id))?;
        match current.status {
            ReservationStatus::Completed => return Ok(current.clone()),
            ReservationStatus::Confirmed if current.span.end <= now => {}
            ReservationStatus::Confirmed => {
                return Err(EngineError::Validation("reservation has not ended yet".into()));
            }
            ReservationStatus::Pending | ReservationStatus::Cancelled => {
                return Err(EngineError::Validation(format!(
                    "cannot complete a {} reservation",
                    current.status
                )));
            }
        }
        self.transition(&mut guard, id, ReservationStatus::Completed)
            .await
    }

    pub async fn link_calendar_event(&self, id: Ulid, event_id: String) -> Result<(), EngineError> {
        if event_id.is_empty() {
            return Err(EngineError::Validation("calendar event id is empty".into()));
        }
        if event_id.len() > MAX_CALENDAR_EVENT_ID_LEN {
            return Err(EngineError::LimitExceeded("calendar event id too long"));
        }
        let mut guard = self.resolve_entity_write(&id).await?;
        let facility_id = guard.id;
        if guard.reservation(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::CalendarEventLinked {
            id,
            facility_id,
            event_id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    async fn transition(
        &self,
        fs: &mut FacilityState,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        let event = Event::ReservationStatusChanged {
            id,
            facility_id: fs.id,
            status,
        };
        self.persist_and_apply(fs, &event).await?;
        fs.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    // ── Maintenance ──────────────────────────────────────────────

    /// Confirmed reservations whose end has passed. Facilities locked by a
    /// writer are skipped and picked up on the next sweep.
    pub fn collect_due_completions(&self, now: Ms) -> Vec<Ulid> {
        let mut due = Vec::new();
        for entry in self.state.iter() {
            let fs = entry.value().clone();
            if let Ok(guard) = fs.try_read() {
                due.extend(
                    guard
                        .reservations
                        .iter()
                        .filter(|r| r.status == ReservationStatus::Confirmed && r.span.end <= now)
                        .map(|r| r.id),
                );
            }
        }
        due
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let facilities: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();

        for fs in facilities {
            let guard = fs.read().await;
            events.push(Event::FacilityCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            for s in &guard.schedules {
                events.push(Event::ScheduleSet {
                    facility_id: guard.id,
                    day_type: s.day_type,
                    open_time: s.open_time.clone(),
                    close_time: s.close_time.clone(),
                });
            }
            for p in &guard.pricing {
                events.push(Event::PricingAdded {
                    id: p.id,
                    facility_id: guard.id,
                    day_type: p.day_type,
                    start_hour: p.start_hour.clone(),
                    end_hour: p.end_hour.clone(),
                    price_per_hour: p.price_per_hour,
                });
            }
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    user_id: r.user_id,
                    facility_id: guard.id,
                    span: r.span,
                    status: r.status,
                    total_price: r.total_price,
                    created_at: r.created_at,
                });
                if let Some(event_id) = &r.calendar_event_id {
                    events.push(Event::CalendarEventLinked {
                        id: r.id,
                        facility_id: guard.id,
                        event_id: event_id.clone(),
                    });
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
