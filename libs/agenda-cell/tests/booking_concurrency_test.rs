use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{NaiveDate, NaiveTime};

use agenda_cell::models::{BookingError, PatientIdentity, Slot, SlotKey, SlotOrigin};
use agenda_cell::services::{BookingService, InMemorySlotRepository, SlotRepository, TracingAuditSink};

fn key() -> SlotKey {
    SlotKey {
        center_id: "center-1".into(),
        professional_id: "p1".into(),
        date: NaiveDate::from_ymd_opt(2024, 11, 4).unwrap(),
        time: NaiveTime::from_hms_opt(15, 20, 0).unwrap(),
    }
}

fn patient(n: usize) -> PatientIdentity {
    PatientIdentity {
        name: format!("Paciente {}", n),
        rut: "11.111.111-1".into(),
        phone: format!("5691234{:04}", n),
    }
}

async fn service_with_open_slot() -> (Arc<InMemorySlotRepository>, Arc<BookingService>) {
    let repo = Arc::new(InMemorySlotRepository::with_slots([Slot::available(&key(), SlotOrigin::Generated)]).await);
    let booking = Arc::new(BookingService::new("center-1", repo.clone(), Arc::new(TracingAuditSink)));
    (repo, booking)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_concurrent_bookings_have_exactly_one_winner() {
    let (repo, booking) = service_with_open_slot().await;
    let id = key().id();

    let first = {
        let booking = booking.clone();
        let id = id.clone();
        tokio::spawn(async move { booking.book(&id, &patient(1)).await })
    };
    let second = {
        let booking = booking.clone();
        let id = id.clone();
        tokio::spawn(async move { booking.book(&id, &patient(2)).await })
    };

    let results = [first.await.unwrap(), second.await.unwrap()];
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(BookingError::SlotTaken))));

    let stored = repo.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.patient_name, winners[0].patient_name);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_callers_racing_for_a_missing_slot() {
    let repo = Arc::new(InMemorySlotRepository::new());
    let booking = Arc::new(BookingService::new("center-1", repo.clone(), Arc::new(TracingAuditSink)));
    let id = key().id();

    let handles: Vec<_> = (0..16)
        .map(|n| {
            let booking = booking.clone();
            let id = id.clone();
            tokio::spawn(async move { booking.book(&id, &patient(n)).await })
        })
        .collect();

    let mut booked = 0;
    let mut taken = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => booked += 1,
            Err(BookingError::SlotTaken) => taken += 1,
            Err(other) => panic!("unexpected booking error: {other}"),
        }
    }

    assert_eq!(booked, 1);
    assert_eq!(taken, 15);
    assert_eq!(repo.len().await, 1);
}

#[tokio::test]
async fn cancelled_slot_can_be_rebooked_once() {
    let (_repo, booking) = service_with_open_slot().await;
    let id = key().id();

    booking.book(&id, &patient(1)).await.unwrap();
    booking.cancel(&id).await.unwrap();

    assert!(booking.book(&id, &patient(2)).await.is_ok());
    assert_matches!(booking.book(&id, &patient(3)).await, Err(BookingError::SlotTaken));
}
