use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::build_availability;
use super::{Engine, EngineError};

impl Engine {
    /// Slot calendar for `[start_date, end_date]`. Date defaults are the
    /// caller's business; this takes the range as given.
    pub async fn get_availability(
        &self,
        facility_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        if (end_date - start_date).num_days() + 1 > MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("availability range too wide"));
        }
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.read().await;
        build_availability(&guard, start_date, end_date)
    }

    pub async fn list_facilities(&self) -> Vec<FacilityInfo> {
        let facilities: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(facilities.len());
        for fs in facilities {
            let guard = fs.read().await;
            out.push(FacilityInfo {
                id: guard.id,
                name: guard.name.clone(),
                configured: guard.is_configured(),
            });
        }
        out.sort_by_key(|f| f.id);
        out
    }

    pub async fn get_schedules(&self, facility_id: Ulid) -> Result<Vec<ScheduleRule>, EngineError> {
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        Ok(fs.read().await.schedules.clone())
    }

    /// Pricing rows in lookup order.
    pub async fn get_pricing(&self, facility_id: Ulid) -> Result<Vec<PricingRule>, EngineError> {
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        Ok(fs.read().await.pricing.clone())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        let facility_id = self.get_facility_for_entity(&id)?;
        let fs = self.get_facility(&facility_id)?;
        let guard = fs.read().await;
        guard.reservation(id).cloned()
    }

    /// Every reservation on the facility (cancelled included), by start time.
    /// With `within`, only those lying entirely inside it.
    pub async fn get_facility_reservations(
        &self,
        facility_id: Ulid,
        within: Option<Span>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.read().await;
        Ok(guard
            .reservations
            .iter()
            .filter(|r| within.is_none_or(|w| r.span.start >= w.start && r.span.end <= w.end))
            .cloned()
            .collect())
    }

    async fn collect_user_reservations(
        &self,
        user_id: Ulid,
        keep: impl Fn(&Reservation) -> bool,
    ) -> Vec<Reservation> {
        let facilities: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for fs in facilities {
            let guard = fs.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.user_id == user_id && keep(r))
                    .cloned(),
            );
        }
        out
    }

    /// All of a user's reservations, latest start first.
    pub async fn get_user_reservations(&self, user_id: Ulid) -> Vec<Reservation> {
        let mut out = self.collect_user_reservations(user_id, |_| true).await;
        out.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(b.id.cmp(&a.id)));
        out
    }

    /// Pending or confirmed reservations starting after `now`, soonest first.
    pub async fn get_upcoming_reservations(&self, user_id: Ulid, now: Ms) -> Vec<Reservation> {
        let mut out = self
            .collect_user_reservations(user_id, |r| {
                matches!(
                    r.status,
                    ReservationStatus::Pending | ReservationStatus::Confirmed
                ) && r.span.start > now
            })
            .await;
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        out
    }

    /// Unpaid reservations that can still be paid for.
    pub async fn count_pending_reservations(&self, user_id: Ulid, now: Ms) -> usize {
        self.collect_user_reservations(user_id, |r| {
            r.status == ReservationStatus::Pending && r.span.start > now
        })
        .await
        .len()
    }
}
