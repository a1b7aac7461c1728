use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::Reservation;

/// Work handed off after a reservation mutation has committed.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    ReservationCreated(Reservation),
    ReservationConfirmed(Reservation),
    ReservationCancelled(Reservation),
}

impl SideEffect {
    fn label(&self) -> &'static str {
        match self {
            SideEffect::ReservationCreated(_) => "calendar_create",
            SideEffect::ReservationConfirmed(_) => "confirmation",
            SideEffect::ReservationCancelled(_) => "calendar_delete",
        }
    }
}

/// Non-blocking handle the engine pushes side effects into.
#[derive(Debug, Clone)]
pub struct EffectSender {
    tx: mpsc::UnboundedSender<SideEffect>,
}

impl EffectSender {
    /// Queue an effect. A closed queue drops it silently.
    pub fn send(&self, effect: SideEffect) {
        if self.tx.send(effect).is_err() {
            debug!("side-effect queue closed, dropping effect");
        }
    }
}

pub fn channel() -> (EffectSender, mpsc::UnboundedReceiver<SideEffect>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EffectSender { tx }, rx)
}

#[derive(Debug)]
pub struct CollaboratorError(pub String);

impl std::fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CollaboratorError {}

/// External calendar (e.g. a user's linked Google Calendar).
#[async_trait]
pub trait CalendarSync: Send + Sync {
    /// Returns the created event id, or `None` if the user has no linked calendar.
    async fn create_event(&self, reservation: &Reservation) -> Result<Option<String>, CollaboratorError>;

    async fn delete_event(&self, reservation: &Reservation, event_id: &str) -> Result<(), CollaboratorError>;
}

/// Booking confirmation delivery (e.g. email).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_confirmation(&self, reservation: &Reservation) -> Result<(), CollaboratorError>;
}

/// Calendar stand-in that records nothing and reports no linked calendar.
pub struct LoggingCalendar;

#[async_trait]
impl CalendarSync for LoggingCalendar {
    async fn create_event(&self, reservation: &Reservation) -> Result<Option<String>, CollaboratorError> {
        debug!(reservation = %reservation.id, user = %reservation.user_id, "no calendar linked");
        Ok(None)
    }

    async fn delete_event(&self, reservation: &Reservation, event_id: &str) -> Result<(), CollaboratorError> {
        debug!(reservation = %reservation.id, event_id, "calendar delete skipped");
        Ok(())
    }
}

pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send_confirmation(&self, reservation: &Reservation) -> Result<(), CollaboratorError> {
        info!(
            reservation = %reservation.id,
            user = %reservation.user_id,
            total_price = reservation.total_price,
            "reservation confirmed"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub calendar: Arc<dyn CalendarSync>,
    pub notifier: Arc<dyn Notifier>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            calendar: Arc::new(LoggingCalendar),
            notifier: Arc::new(LoggingNotifier),
        }
    }
}

/// Drain the side-effect queue until every sender is gone.
///
/// Effects are handled one at a time in commit order, so a cancellation is
/// never processed before the calendar link of the same reservation.
pub async fn run_effects(
    engine: Arc<Engine>,
    mut rx: mpsc::UnboundedReceiver<SideEffect>,
    collaborators: Collaborators,
) {
    while let Some(effect) = rx.recv().await {
        let label = effect.label();
        if let Err(e) = handle(&engine, &collaborators, effect).await {
            warn!("side effect {label} failed: {e}");
            metrics::counter!(crate::observability::SIDE_EFFECT_FAILURES_TOTAL, "kind" => label)
                .increment(1);
        }
    }
}

async fn handle(
    engine: &Engine,
    collaborators: &Collaborators,
    effect: SideEffect,
) -> Result<(), CollaboratorError> {
    match effect {
        SideEffect::ReservationCreated(reservation) => {
            // Cancelled before we got to it: nothing to sync.
            if engine
                .get_reservation(reservation.id)
                .await
                .is_none_or(|current| !current.status.blocks())
            {
                return Ok(());
            }
            let Some(event_id) = collaborators.calendar.create_event(&reservation).await? else {
                return Ok(());
            };
            info!(reservation = %reservation.id, event_id, "calendar event created");
            engine
                .link_calendar_event(reservation.id, event_id)
                .await
                .map_err(|e| CollaboratorError(format!("failed to record calendar event: {e}")))
        }
        SideEffect::ReservationConfirmed(reservation) => {
            collaborators.notifier.send_confirmation(&reservation).await
        }
        SideEffect::ReservationCancelled(reservation) => {
            // Re-read: the link may have been written after the cancel snapshot.
            let linked = engine
                .get_reservation(reservation.id)
                .await
                .and_then(|r| r.calendar_event_id)
                .or(reservation.calendar_event_id.clone());
            let Some(event_id) = linked else {
                return Ok(());
            };
            collaborators
                .calendar
                .delete_event(&reservation, &event_id)
                .await?;
            info!(reservation = %reservation.id, event_id, "calendar event deleted");
            Ok(())
        }
    }
}
