use super::*;
use crate::calendar;
use crate::effects::{self, SideEffect};
use crate::limits::*;

use chrono::NaiveDate;
use tokio::sync::mpsc::UnboundedReceiver;

const H: Ms = HOUR_MS;
const M: Ms = 60_000; // 1 minute in ms

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("courtbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(path: PathBuf) -> (Engine, UnboundedReceiver<SideEffect>) {
    let (tx, rx) = effects::channel();
    (Engine::new(path, tx).unwrap(), rx)
}

/// First date after today with the given day type.
fn next(day_type: DayType) -> NaiveDate {
    let today = calendar::today(now_ms()).unwrap();
    (1..=7)
        .map(|n| calendar::add_days(today, n))
        .find(|d| calendar::day_type_of(*d) == day_type)
        .unwrap()
}

fn at(date: NaiveDate, hour: i64) -> Ms {
    calendar::start_of_day(date) + hour * H
}

/// Weekday 08:00-22:00 at 10/h then 15/h from 18:00; weekend 09:00-20:00 at 25/h.
async fn configured_facility(engine: &Engine) -> Ulid {
    let fid = Ulid::new();
    engine.create_facility(fid, Some("Court 1".into())).await.unwrap();
    engine
        .set_schedule(fid, DayType::Weekday, "08:00", "22:00")
        .await
        .unwrap();
    engine
        .set_schedule(fid, DayType::Weekend, "09:00", "20:00")
        .await
        .unwrap();
    engine
        .add_pricing(Ulid::new(), fid, DayType::Weekday, "18:00", "22:00", 15.0)
        .await
        .unwrap();
    engine
        .add_pricing(Ulid::new(), fid, DayType::Weekday, "08:00", "18:00", 10.0)
        .await
        .unwrap();
    engine
        .add_pricing(Ulid::new(), fid, DayType::Weekend, "09:00", "20:00", 25.0)
        .await
        .unwrap();
    fid
}

fn drain(rx: &mut UnboundedReceiver<SideEffect>) -> Vec<SideEffect> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

// ── Facility configuration ───────────────────────────────

#[tokio::test]
async fn engine_create_and_list_facility() {
    let (engine, _rx) = new_engine(test_wal_path("create_list.wal"));
    let fid = Ulid::new();
    engine.create_facility(fid, Some("Court A".into())).await.unwrap();

    let list = engine.list_facilities().await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, fid);
    assert_eq!(list[0].name.as_deref(), Some("Court A"));
    assert!(!list[0].configured);
}

#[tokio::test]
async fn engine_duplicate_facility_rejected() {
    let (engine, _rx) = new_engine(test_wal_path("dup_facility.wal"));
    let fid = Ulid::new();
    engine.create_facility(fid, None).await.unwrap();
    let result = engine.create_facility(fid, None).await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(id)) if id == fid));
}

#[tokio::test]
async fn engine_facility_name_limit() {
    let (engine, _rx) = new_engine(test_wal_path("name_limit.wal"));
    let long = "x".repeat(MAX_NAME_LEN + 1);
    let result = engine.create_facility(Ulid::new(), Some(long)).await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn engine_schedule_one_per_day_type() {
    let (engine, _rx) = new_engine(test_wal_path("schedule_unique.wal"));
    let fid = Ulid::new();
    engine.create_facility(fid, None).await.unwrap();
    engine
        .set_schedule(fid, DayType::Weekday, "08:00", "22:00")
        .await
        .unwrap();

    let result = engine.set_schedule(fid, DayType::Weekday, "09:00", "21:00").await;
    assert!(matches!(result, Err(EngineError::ScheduleExists(_, DayType::Weekday))));

    engine.remove_schedule(fid, DayType::Weekday).await.unwrap();
    engine
        .set_schedule(fid, DayType::Weekday, "09:00", "21:00")
        .await
        .unwrap();

    let schedules = engine.get_schedules(fid).await.unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].open_time, "09:00:00");
    assert_eq!(schedules[0].close_time, "21:00:00");
}

#[tokio::test]
async fn engine_schedule_validation() {
    let (engine, _rx) = new_engine(test_wal_path("schedule_validation.wal"));
    let fid = Ulid::new();
    engine.create_facility(fid, None).await.unwrap();

    let result = engine.set_schedule(fid, DayType::Weekday, "22:00", "08:00").await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
    let result = engine.set_schedule(fid, DayType::Weekday, "8 o'clock", "22:00").await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
    let result = engine
        .set_schedule(Ulid::new(), DayType::Weekday, "08:00", "22:00")
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
    let result = engine.remove_schedule(fid, DayType::Weekend).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn engine_pricing_kept_in_lookup_order() {
    let (engine, _rx) = new_engine(test_wal_path("pricing_order.wal"));
    let fid = configured_facility(&engine).await;

    let pricing = engine.get_pricing(fid).await.unwrap();
    let keys: Vec<(DayType, &str)> = pricing
        .iter()
        .map(|p| (p.day_type, p.start_hour.as_str()))
        .collect();
    assert_eq!(
        keys,
        vec![
            (DayType::Weekday, "08:00:00"),
            (DayType::Weekday, "18:00:00"),
            (DayType::Weekend, "09:00:00"),
        ]
    );
}

#[tokio::test]
async fn engine_pricing_validation() {
    let (engine, _rx) = new_engine(test_wal_path("pricing_validation.wal"));
    let fid = Ulid::new();
    engine.create_facility(fid, None).await.unwrap();

    let bad_range = engine
        .add_pricing(Ulid::new(), fid, DayType::Weekday, "18:00", "08:00", 10.0)
        .await;
    assert!(matches!(bad_range, Err(EngineError::Validation(_))));

    let negative = engine
        .add_pricing(Ulid::new(), fid, DayType::Weekday, "08:00", "18:00", -1.0)
        .await;
    assert!(matches!(negative, Err(EngineError::Validation(_))));

    let nan = engine
        .add_pricing(Ulid::new(), fid, DayType::Weekday, "08:00", "18:00", f64::NAN)
        .await;
    assert!(matches!(nan, Err(EngineError::Validation(_))));

    let pid = Ulid::new();
    engine
        .add_pricing(pid, fid, DayType::Weekday, "08:00", "18:00", 0.0)
        .await
        .unwrap();
    let dup = engine
        .add_pricing(pid, fid, DayType::Weekday, "08:00", "18:00", 5.0)
        .await;
    assert!(matches!(dup, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn engine_remove_pricing_unconfigures_facility() {
    let (engine, _rx) = new_engine(test_wal_path("remove_pricing.wal"));
    let fid = Ulid::new();
    engine.create_facility(fid, None).await.unwrap();
    engine
        .set_schedule(fid, DayType::Weekday, "08:00", "22:00")
        .await
        .unwrap();
    let pid = Ulid::new();
    engine
        .add_pricing(pid, fid, DayType::Weekday, "08:00", "22:00", 10.0)
        .await
        .unwrap();

    let date = next(DayType::Weekday);
    engine.get_availability(fid, date, date).await.unwrap();

    assert_eq!(engine.remove_pricing(pid).await.unwrap(), fid);
    let result = engine.get_availability(fid, date, date).await;
    assert!(matches!(result, Err(EngineError::NotConfigured(_))));

    let again = engine.remove_pricing(pid).await;
    assert!(matches!(again, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn engine_delete_facility_with_live_reservation_fails() {
    let (engine, _rx) = new_engine(test_wal_path("delete_live.wal"));
    let fid = configured_facility(&engine).await;
    let user = Ulid::new();
    let rid = Ulid::new();
    let day = next(DayType::Weekday);
    engine
        .create_reservation(rid, user, fid, at(day, 10), at(day, 11))
        .await
        .unwrap();

    let result = engine.delete_facility(fid).await;
    assert!(matches!(result, Err(EngineError::HasLiveReservations(_))));

    engine.cancel_reservation(rid, user).await.unwrap();
    engine.delete_facility(fid).await.unwrap();
    assert!(engine.get_facility(&fid).is_none());
    assert!(engine.get_reservation(rid).await.is_none());
    assert!(engine.list_facilities().await.is_empty());
}

// ── Availability through the engine ──────────────────────

#[tokio::test]
async fn engine_availability_marks_reserved_slots() {
    let (engine, _rx) = new_engine(test_wal_path("availability_marks.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, at(day, 10), at(day, 11) + 30 * M)
        .await
        .unwrap();

    let days = engine.get_availability(fid, day, day).await.unwrap();
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].slots.len(), 14);
    let taken: Vec<&str> = days[0]
        .slots
        .iter()
        .filter(|s| !s.available)
        .map(|s| s.start_time.as_str())
        .collect();
    assert_eq!(taken, vec!["10:00", "11:00"]);
    assert_eq!(days[0].slots[10].price_per_hour, 15.0);
}

#[tokio::test]
async fn engine_availability_weekend_schedule() {
    let (engine, _rx) = new_engine(test_wal_path("availability_weekend.wal"));
    let fid = configured_facility(&engine).await;
    let saturday = next(DayType::Weekend);

    let days = engine.get_availability(fid, saturday, saturday).await.unwrap();
    assert_eq!(days[0].slots.len(), 11);
    assert_eq!(days[0].slots[0].start_time, "09:00");
    assert!(days[0].slots.iter().all(|s| s.price_per_hour == 25.0));
}

#[tokio::test]
async fn engine_availability_limits_and_unknown_facility() {
    let (engine, _rx) = new_engine(test_wal_path("availability_limits.wal"));
    let fid = configured_facility(&engine).await;
    let start = next(DayType::Weekday);

    let too_wide = engine
        .get_availability(fid, start, calendar::add_days(start, MAX_QUERY_DAYS))
        .await;
    assert!(matches!(too_wide, Err(EngineError::LimitExceeded(_))));

    let widest = engine
        .get_availability(fid, start, calendar::add_days(start, MAX_QUERY_DAYS - 1))
        .await
        .unwrap();
    assert_eq!(widest.len() as i64, MAX_QUERY_DAYS);

    let unknown = engine.get_availability(Ulid::new(), start, start).await;
    assert!(matches!(unknown, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn engine_availability_requires_configuration() {
    let (engine, _rx) = new_engine(test_wal_path("availability_unconfigured.wal"));
    let fid = Ulid::new();
    engine.create_facility(fid, None).await.unwrap();
    engine
        .add_pricing(Ulid::new(), fid, DayType::Weekday, "08:00", "22:00", 10.0)
        .await
        .unwrap();
    let day = next(DayType::Weekday);
    let result = engine.get_availability(fid, day, day).await;
    assert!(matches!(result, Err(EngineError::NotConfigured(id)) if id == fid));
}

// ── Reservation creation ─────────────────────────────────

#[tokio::test]
async fn engine_create_reservation_pending_with_price() {
    let (engine, mut rx) = new_engine(test_wal_path("create_pending.wal"));
    let fid = configured_facility(&engine).await;
    let user = Ulid::new();
    let rid = Ulid::new();
    let day = next(DayType::Weekday);

    // 17:00-19:00 is priced at the 17:00 rate for both hours.
    let r = engine
        .create_reservation(rid, user, fid, at(day, 17), at(day, 19))
        .await
        .unwrap();
    assert_eq!(r.id, rid);
    assert_eq!(r.user_id, user);
    assert_eq!(r.facility_id, fid);
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.total_price, 20.0);
    assert!(r.created_at <= now_ms());

    assert_eq!(engine.get_reservation(rid).await, Some(r.clone()));
    assert_eq!(drain(&mut rx), vec![SideEffect::ReservationCreated(r)]);
}

#[tokio::test]
async fn engine_create_reservation_weekend_rate() {
    let (engine, _rx) = new_engine(test_wal_path("create_weekend.wal"));
    let fid = configured_facility(&engine).await;
    let saturday = next(DayType::Weekend);
    let r = engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, at(saturday, 10), at(saturday, 11) + 30 * M)
        .await
        .unwrap();
    assert_eq!(r.total_price, 37.5);
}

#[tokio::test]
async fn engine_create_reservation_outside_pricing_is_free() {
    let (engine, _rx) = new_engine(test_wal_path("create_unpriced.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let r = engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, at(day, 6), at(day, 7))
        .await
        .unwrap();
    assert_eq!(r.total_price, 0.0);
}

#[tokio::test]
async fn engine_create_reservation_validation_order() {
    let (engine, _rx) = new_engine(test_wal_path("create_validation.wal"));
    let fid = configured_facility(&engine).await;
    let now = now_ms();

    let inverted = engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, now - 2 * H, now - 3 * H)
        .await;
    match inverted {
        Err(EngineError::Validation(msg)) => assert!(msg.contains("end time")),
        other => panic!("expected validation error, got {other:?}"),
    }

    let past = engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, now - 2 * H, now - H)
        .await;
    match past {
        Err(EngineError::Validation(msg)) => assert!(msg.contains("past")),
        other => panic!("expected validation error, got {other:?}"),
    }

    let unknown = engine
        .create_reservation(Ulid::new(), Ulid::new(), Ulid::new(), now + H, now + 2 * H)
        .await;
    assert!(matches!(unknown, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn engine_create_reservation_without_pricing_is_free() {
    let (engine, mut rx) = new_engine(test_wal_path("create_unpriced.wal"));
    let fid = Ulid::new();
    engine.create_facility(fid, None).await.unwrap();
    engine
        .set_schedule(fid, DayType::Weekday, "08:00", "22:00")
        .await
        .unwrap();
    let day = next(DayType::Weekday);
    let r = engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, at(day, 10), at(day, 11))
        .await
        .unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.total_price, 0.0);
    assert_eq!(drain(&mut rx).len(), 1);
}

#[tokio::test]
async fn engine_duplicate_reservation_id_rejected() {
    let (engine, _rx) = new_engine(test_wal_path("dup_reservation.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let rid = Ulid::new();
    engine
        .create_reservation(rid, Ulid::new(), fid, at(day, 10), at(day, 11))
        .await
        .unwrap();
    let result = engine
        .create_reservation(rid, Ulid::new(), fid, at(day, 12), at(day, 13))
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn engine_concurrent_same_reservation_id_one_wins() {
    let (engine, _rx) = new_engine(test_wal_path("dup_reservation_race.wal"));
    let engine = Arc::new(engine);
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let rid = Ulid::new();
    let user = Ulid::new();

    let mut handles = Vec::new();
    for i in 0..8 {
        let eng = engine.clone();
        // Disjoint hours, so only the shared id can make them collide.
        let start = at(day, 8 + i);
        handles.push(tokio::spawn(async move {
            eng.create_reservation(rid, user, fid, start, start + H).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::AlreadyExists(id)) => assert_eq!(id, rid),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);

    let all = engine.get_facility_reservations(fid, None).await.unwrap();
    assert_eq!(all.iter().filter(|r| r.id == rid).count(), 1);

    engine.cancel_reservation(rid, user).await.unwrap();
    let days = engine.get_availability(fid, day, day).await.unwrap();
    assert!(days[0].slots.iter().all(|s| s.available));
}

#[tokio::test]
async fn engine_concurrent_same_pricing_id_one_wins() {
    let (engine, _rx) = new_engine(test_wal_path("dup_pricing_race.wal"));
    let engine = Arc::new(engine);
    let fid = Ulid::new();
    engine.create_facility(fid, None).await.unwrap();
    let pid = Ulid::new();

    let mut handles = Vec::new();
    for i in 0..8 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.add_pricing(pid, fid, DayType::Weekday, "08:00", "22:00", 10.0 + i as f64)
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.get_pricing(fid).await.unwrap().len(), 1);
}

#[tokio::test]
async fn engine_rejected_create_releases_id() {
    let (engine, _rx) = new_engine(test_wal_path("dup_released.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, at(day, 10), at(day, 11))
        .await
        .unwrap();

    let rid = Ulid::new();
    let clash = engine
        .create_reservation(rid, Ulid::new(), fid, at(day, 10), at(day, 11))
        .await;
    assert!(matches!(clash, Err(EngineError::Conflict(_))));
    assert_eq!(engine.get_facility_for_entity(&rid), None);

    engine
        .create_reservation(rid, Ulid::new(), fid, at(day, 12), at(day, 13))
        .await
        .unwrap();
}

#[tokio::test]
async fn engine_cancel_racing_facility_delete_is_not_found() {
    let (engine, mut rx) = new_engine(test_wal_path("cancel_vs_delete.wal"));
    let engine = Arc::new(engine);
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let user = Ulid::new();
    let rid = Ulid::new();
    engine
        .create_reservation(rid, user, fid, at(day, 10), at(day, 11))
        .await
        .unwrap();
    drain(&mut rx);

    let held = engine.get_facility(&fid).unwrap().write_owned().await;
    let eng = engine.clone();
    let cancel = tokio::spawn(async move { eng.cancel_reservation(rid, user).await });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    engine.forget_facility(fid);
    drop(held);

    let result = cancel.await.unwrap();
    assert!(matches!(result, Err(EngineError::NotFound(id)) if id == fid));
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn engine_touching_reservations_do_not_conflict() {
    let (engine, _rx) = new_engine(test_wal_path("touching.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let first = Ulid::new();
    engine
        .create_reservation(first, Ulid::new(), fid, at(day, 10), at(day, 11))
        .await
        .unwrap();

    engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, at(day, 11), at(day, 12))
        .await
        .unwrap();

    let overlapping = engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, at(day, 9), at(day, 10) + 30 * M)
        .await;
    assert!(matches!(overlapping, Err(EngineError::Conflict(id)) if id == first));
}

#[tokio::test]
async fn engine_cancelled_reservation_frees_slot() {
    let (engine, _rx) = new_engine(test_wal_path("cancel_frees.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let user = Ulid::new();
    let rid = Ulid::new();
    engine
        .create_reservation(rid, user, fid, at(day, 10), at(day, 11))
        .await
        .unwrap();
    engine.cancel_reservation(rid, user).await.unwrap();

    let days = engine.get_availability(fid, day, day).await.unwrap();
    assert!(days[0].slots.iter().all(|s| s.available));

    engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, at(day, 10), at(day, 11))
        .await
        .unwrap();
}

#[tokio::test]
async fn engine_concurrent_overlapping_creates_one_wins() {
    let (engine, _rx) = new_engine(test_wal_path("concurrent_creates.wal"));
    let engine = Arc::new(engine);
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);

    let n = 16;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        // Staggered by 3 minutes: every pair overlaps.
        let start = at(day, 10) + i * 3 * M;
        handles.push(tokio::spawn(async move {
            eng.create_reservation(Ulid::new(), Ulid::new(), fid, start, start + H)
                .await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);

    let live: Vec<Reservation> = engine
        .get_facility_reservations(fid, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.status.blocks())
        .collect();
    assert_eq!(live.len(), 1);
}

#[tokio::test]
async fn engine_no_overlap_invariant_holds() {
    let (engine, _rx) = new_engine(test_wal_path("no_overlap.wal"));
    let engine = Arc::new(engine);
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);

    let mut handles = Vec::new();
    for i in 0..40 {
        let eng = engine.clone();
        let start = at(day, 8) + (i % 20) * 30 * M;
        let len = H + (i % 3) * 15 * M;
        handles.push(tokio::spawn(async move {
            eng.create_reservation(Ulid::new(), Ulid::new(), fid, start, start + len)
                .await
        }));
    }
    for h in handles {
        let _ = h.await.unwrap();
    }

    let live: Vec<Reservation> = engine
        .get_facility_reservations(fid, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.status.blocks())
        .collect();
    assert!(!live.is_empty());
    for (i, a) in live.iter().enumerate() {
        for b in &live[i + 1..] {
            assert!(
                a.span.end <= b.span.start || b.span.end <= a.span.start,
                "{a:?} overlaps {b:?}"
            );
        }
    }
}

// ── Reservation lifecycle ────────────────────────────────

#[tokio::test]
async fn engine_cancel_is_idempotent() {
    let (engine, mut rx) = new_engine(test_wal_path("cancel_idempotent.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let user = Ulid::new();
    let rid = Ulid::new();
    engine
        .create_reservation(rid, user, fid, at(day, 10), at(day, 11))
        .await
        .unwrap();
    drain(&mut rx);

    let cancelled = engine.cancel_reservation(rid, user).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);

    let again = engine.cancel_reservation(rid, user).await;
    assert!(matches!(again, Err(EngineError::NotFound(_))));

    let effects = drain(&mut rx);
    assert_eq!(effects, vec![SideEffect::ReservationCancelled(cancelled)]);
    assert_eq!(engine.wal_appends_since_compact().await, 8);
}

#[tokio::test]
async fn engine_cancel_by_other_user_unauthorized() {
    let (engine, _rx) = new_engine(test_wal_path("cancel_unauthorized.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let owner = Ulid::new();
    let rid = Ulid::new();
    engine
        .create_reservation(rid, owner, fid, at(day, 10), at(day, 11))
        .await
        .unwrap();

    let result = engine.cancel_reservation(rid, Ulid::new()).await;
    assert!(matches!(result, Err(EngineError::Unauthorized(id)) if id == rid));
    assert_eq!(
        engine.get_reservation(rid).await.unwrap().status,
        ReservationStatus::Pending
    );

    let unknown = engine.cancel_reservation(Ulid::new(), owner).await;
    assert!(matches!(unknown, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn engine_confirm_transitions_once() {
    let (engine, mut rx) = new_engine(test_wal_path("confirm_once.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let user = Ulid::new();
    let rid = Ulid::new();
    engine
        .create_reservation(rid, user, fid, at(day, 10), at(day, 11))
        .await
        .unwrap();
    drain(&mut rx);

    let unauthorized = engine.confirm_reservation(rid, Ulid::new()).await;
    assert!(matches!(unauthorized, Err(EngineError::Unauthorized(_))));

    let confirmed = engine.confirm_reservation(rid, user).await.unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);
    let again = engine.confirm_reservation(rid, user).await.unwrap();
    assert_eq!(again, confirmed);

    assert_eq!(drain(&mut rx), vec![SideEffect::ReservationConfirmed(confirmed)]);
}

#[tokio::test]
async fn engine_confirm_cancelled_fails() {
    let (engine, _rx) = new_engine(test_wal_path("confirm_cancelled.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let user = Ulid::new();
    let rid = Ulid::new();
    engine
        .create_reservation(rid, user, fid, at(day, 10), at(day, 11))
        .await
        .unwrap();
    engine.cancel_reservation(rid, user).await.unwrap();

    let result = engine.confirm_reservation(rid, user).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn engine_completion_sweep() {
    let (engine, _rx) = new_engine(test_wal_path("completion_sweep.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let user = Ulid::new();
    let paid = Ulid::new();
    let unpaid = Ulid::new();
    engine
        .create_reservation(paid, user, fid, at(day, 10), at(day, 11))
        .await
        .unwrap();
    engine
        .create_reservation(unpaid, user, fid, at(day, 12), at(day, 13))
        .await
        .unwrap();
    engine.confirm_reservation(paid, user).await.unwrap();

    assert!(engine.collect_due_completions(at(day, 11) - 1).is_empty());
    let too_early = engine.complete_reservation(paid, at(day, 10)).await;
    assert!(matches!(too_early, Err(EngineError::Validation(_))));

    let due = engine.collect_due_completions(at(day, 14));
    assert_eq!(due, vec![paid]);

    let completed = engine.complete_reservation(paid, at(day, 14)).await.unwrap();
    assert_eq!(completed.status, ReservationStatus::Completed);
    assert!(engine.collect_due_completions(at(day, 14)).is_empty());

    let pending = engine.complete_reservation(unpaid, at(day, 14)).await;
    assert!(matches!(pending, Err(EngineError::Validation(_))));

    // Completed still occupies its interval.
    let overlap = engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, at(day, 10), at(day, 11))
        .await;
    assert!(matches!(overlap, Err(EngineError::Conflict(id)) if id == paid));
}

#[tokio::test]
async fn engine_link_calendar_event() {
    let (engine, _rx) = new_engine(test_wal_path("link_calendar.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let rid = Ulid::new();
    engine
        .create_reservation(rid, Ulid::new(), fid, at(day, 10), at(day, 11))
        .await
        .unwrap();

    engine.link_calendar_event(rid, "evt-1".into()).await.unwrap();
    assert_eq!(
        engine.get_reservation(rid).await.unwrap().calendar_event_id.as_deref(),
        Some("evt-1")
    );

    let empty = engine.link_calendar_event(rid, String::new()).await;
    assert!(matches!(empty, Err(EngineError::Validation(_))));
    let unknown = engine.link_calendar_event(Ulid::new(), "evt-2".into()).await;
    assert!(matches!(unknown, Err(EngineError::NotFound(_))));
}

// ── Listings ─────────────────────────────────────────────

#[tokio::test]
async fn engine_user_listings() {
    let (engine, _rx) = new_engine(test_wal_path("user_listings.wal"));
    let fid = configured_facility(&engine).await;
    let other_fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    let user = Ulid::new();

    let a = Ulid::new();
    let b = Ulid::new();
    let c = Ulid::new();
    engine
        .create_reservation(b, user, other_fid, at(day, 14), at(day, 15))
        .await
        .unwrap();
    engine
        .create_reservation(a, user, fid, at(day, 10), at(day, 11))
        .await
        .unwrap();
    engine
        .create_reservation(c, user, fid, at(day, 16), at(day, 17))
        .await
        .unwrap();
    engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, at(day, 12), at(day, 13))
        .await
        .unwrap();
    engine.confirm_reservation(b, user).await.unwrap();
    engine.cancel_reservation(c, user).await.unwrap();

    let all: Vec<Ulid> = engine.get_user_reservations(user).await.iter().map(|r| r.id).collect();
    assert_eq!(all, vec![c, b, a]);

    let now = now_ms();
    let upcoming: Vec<Ulid> = engine
        .get_upcoming_reservations(user, now)
        .await
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(upcoming, vec![a, b]);

    assert_eq!(engine.count_pending_reservations(user, now).await, 1);
    assert_eq!(engine.count_pending_reservations(user, at(day, 11)).await, 0);
    assert!(engine.get_user_reservations(Ulid::new()).await.is_empty());
}

#[tokio::test]
async fn engine_facility_reservations_range_filter() {
    let (engine, _rx) = new_engine(test_wal_path("facility_range.wal"));
    let fid = configured_facility(&engine).await;
    let day = next(DayType::Weekday);
    for hour in [9, 11, 13] {
        engine
            .create_reservation(Ulid::new(), Ulid::new(), fid, at(day, hour), at(day, hour + 1))
            .await
            .unwrap();
    }

    let all = engine.get_facility_reservations(fid, None).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].span.start <= w[1].span.start));

    let window = Span::new(at(day, 10), at(day, 13) + 30 * M);
    let within = engine
        .get_facility_reservations(fid, Some(window))
        .await
        .unwrap();
    assert_eq!(within.len(), 1);
    assert_eq!(within[0].span.start, at(day, 11));

    let unknown = engine.get_facility_reservations(Ulid::new(), None).await;
    assert!(matches!(unknown, Err(EngineError::NotFound(_))));
}

// ── WAL replay & compaction ──────────────────────────────

#[tokio::test]
async fn engine_wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let day = next(DayType::Weekday);
    let user = Ulid::new();
    let (fid, kept, dropped, pricing_before) = {
        let (engine, _rx) = new_engine(path.clone());
        let fid = configured_facility(&engine).await;
        let kept = Ulid::new();
        let dropped = Ulid::new();
        engine
            .create_reservation(kept, user, fid, at(day, 10), at(day, 11))
            .await
            .unwrap();
        engine
            .create_reservation(dropped, user, fid, at(day, 12), at(day, 13))
            .await
            .unwrap();
        engine.confirm_reservation(kept, user).await.unwrap();
        engine.link_calendar_event(kept, "evt-kept".into()).await.unwrap();
        engine.cancel_reservation(dropped, user).await.unwrap();
        engine.remove_schedule(fid, DayType::Weekend).await.unwrap();
        let pricing = engine.get_pricing(fid).await.unwrap();
        (fid, kept, dropped, pricing)
    };

    let (engine, mut rx) = new_engine(path);
    let kept_r = engine.get_reservation(kept).await.unwrap();
    assert_eq!(kept_r.status, ReservationStatus::Confirmed);
    assert_eq!(kept_r.calendar_event_id.as_deref(), Some("evt-kept"));
    assert_eq!(kept_r.total_price, 10.0);
    assert_eq!(
        engine.get_reservation(dropped).await.unwrap().status,
        ReservationStatus::Cancelled
    );
    assert_eq!(engine.get_pricing(fid).await.unwrap(), pricing_before);
    assert_eq!(engine.get_schedules(fid).await.unwrap().len(), 1);

    // Replay never re-emits side effects.
    assert!(drain(&mut rx).is_empty());

    let conflict = engine
        .create_reservation(Ulid::new(), Ulid::new(), fid, at(day, 10), at(day, 11))
        .await;
    assert!(matches!(conflict, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn engine_replay_skips_deleted_facility() {
    let path = test_wal_path("replay_deleted.wal");
    let fid = Ulid::new();
    let pid = Ulid::new();
    {
        let (engine, _rx) = new_engine(path.clone());
        engine.create_facility(fid, None).await.unwrap();
        engine
            .add_pricing(pid, fid, DayType::Weekday, "08:00", "22:00", 10.0)
            .await
            .unwrap();
        engine.delete_facility(fid).await.unwrap();
    }
    let (engine, _rx) = new_engine(path);
    assert!(engine.get_facility(&fid).is_none());
    assert!(engine.get_facility_for_entity(&pid).is_none());
}

#[tokio::test]
async fn engine_compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let day = next(DayType::Weekday);
    let user = Ulid::new();
    let rid = Ulid::new();
    let fid = {
        let (engine, _rx) = new_engine(path.clone());
        let fid = configured_facility(&engine).await;
        // Churn that compaction should fold away.
        for _ in 0..5 {
            let pid = Ulid::new();
            engine
                .add_pricing(pid, fid, DayType::Weekend, "06:00", "07:00", 1.0)
                .await
                .unwrap();
            engine.remove_pricing(pid).await.unwrap();
        }
        engine
            .create_reservation(rid, user, fid, at(day, 10), at(day, 11))
            .await
            .unwrap();
        engine.confirm_reservation(rid, user).await.unwrap();
        engine.link_calendar_event(rid, "evt-9".into()).await.unwrap();

        assert!(engine.wal_appends_since_compact().await > 10);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        fid
    };

    let (engine, _rx) = new_engine(path);
    assert_eq!(engine.get_pricing(fid).await.unwrap().len(), 3);
    assert_eq!(engine.get_schedules(fid).await.unwrap().len(), 2);
    let r = engine.get_reservation(rid).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert_eq!(r.calendar_event_id.as_deref(), Some("evt-9"));
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let (engine, _rx) = new_engine(path.clone());
    let engine = Arc::new(engine);

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_facility(Ulid::new(), Some(format!("Court {i}"))).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_facilities().await.len(), n);

    let (engine2, _rx2) = new_engine(path);
    assert_eq!(engine2.list_facilities().await.len(), n);
}
