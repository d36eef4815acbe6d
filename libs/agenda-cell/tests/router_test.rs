use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use agenda_cell::models::{AgendaConfig, Professional};
use agenda_cell::router::{agenda_routes, AgendaState};
use agenda_cell::services::{
    AgendaService, BookingService, InMemorySlotRepository, StaticDirectory,
    TracingAuditSink,
};
use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestUser};

struct Harness {
    app: Router,
    repo: Arc<InMemorySlotRepository>,
    config: TestConfig,
}

fn harness() -> Harness {
    let config = TestConfig::default();
    let repo = Arc::new(InMemorySlotRepository::new());
    let directory = StaticDirectory::new().with_professional(
        Professional {
            id: "p1".into(),
            center_id: config.center_id.clone(),
            name: "Dra. Soto".into(),
            specialty: Some("Pediatría".into()),
        },
        Some(AgendaConfig::new(20, "08:00", "09:00").unwrap()),
    );
    let audit = Arc::new(TracingAuditSink);

    let state = AgendaState {
        config: config.to_arc(),
        agenda: Arc::new(AgendaService::new(&config.center_id, repo.clone(), Arc::new(directory), audit.clone())),
        booking: Arc::new(BookingService::new(&config.center_id, repo.clone(), audit)),
    };

    Harness { app: agenda_routes(state), repo, config }
}

async fn send(app: &Router, method: &str, uri: &str, auth: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        request = request.header("authorization", auth);
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn requests_without_a_token_are_rejected() {
    let h = harness();
    let (status, _) = send(&h.app, "GET", "/agenda/p1/2024-09-02", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn patients_cannot_edit_agendas() {
    let h = harness();
    let token = JwtTestUtils::bearer(&TestUser::patient("p@example.com"), &h.config);
    let (status, _) = send(&h.app, "GET", "/agenda/p1/2024-09-02", Some(&token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn staff_toggle_commit_and_view() {
    let h = harness();
    let token = JwtTestUtils::bearer(&TestUser::staff("s@example.com"), &h.config);

    let (status, view) = send(&h.app, "GET", "/agenda/p1/2024-09-02", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let times: Vec<_> = view["cells"].as_array().unwrap().iter().map(|c| c["time"].clone()).collect();
    assert_eq!(times, vec![json!("08:00"), json!("08:20"), json!("08:40")]);

    let (status, view) = send(
        &h.app,
        "POST",
        "/agenda/p1/2024-09-02/toggle",
        Some(&token),
        Some(json!({ "time": "08:20" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["has_pending_changes"], true);
    assert_eq!(view["cells"][1]["state"], "pending_open");

    let (status, summary) = send(&h.app, "POST", "/agenda/p1/2024-09-02/commit", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["opened"], 1);
    assert_eq!(h.repo.len().await, 1);

    let (_, view) = send(&h.app, "GET", "/agenda/p1/2024-09-02", Some(&token), None).await;
    assert_eq!(view["cells"][1]["state"], "open");
    assert_eq!(view["has_pending_changes"], false);
}

#[tokio::test]
async fn discarding_pending_edits_clears_them() {
    let h = harness();
    let token = JwtTestUtils::bearer(&TestUser::staff("s@example.com"), &h.config);

    send(&h.app, "POST", "/agenda/p1/2024-09-02/toggle", Some(&token), Some(json!({ "time": "08:00" }))).await;
    let (status, _) = send(&h.app, "DELETE", "/agenda/p1/2024-09-02/pending", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, view) = send(&h.app, "GET", "/agenda/p1/2024-09-02", Some(&token), None).await;
    assert_eq!(view["has_pending_changes"], false);
    assert!(h.repo.is_empty().await);
}

#[tokio::test]
async fn second_booking_gets_slot_taken() {
    let h = harness();
    let token = JwtTestUtils::bearer(&TestUser::staff("s@example.com"), &h.config);
    let uri = "/slots/slot_center-1_p1_2024-09-02_08:40/book";
    let body = json!({
        "patient_name": "Ana Rojas",
        "patient_rut": "12.345.678-5",
        "patient_phone": "+56911112222"
    });

    let (status, booked) = send(&h.app, "POST", uri, Some(&token), Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(booked["slot"]["status"], "booked");

    let (status, error) = send(&h.app, "POST", uri, Some(&token), Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"], "SLOT_TAKEN");

    let (status, cancelled) = send(&h.app, "POST", "/slots/slot_center-1_p1_2024-09-02_08:40/cancel", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["cancelled"], true);
}

#[tokio::test]
async fn invalid_patient_and_range_are_bad_requests() {
    let h = harness();
    let token = JwtTestUtils::bearer(&TestUser::admin("a@example.com"), &h.config);

    let (status, _) = send(
        &h.app,
        "POST",
        "/slots/slot_center-1_p1_2024-09-02_08:40/book",
        Some(&token),
        Some(json!({ "patient_name": "Ana", "patient_rut": "1-1", "patient_phone": "123" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &h.app,
        "POST",
        "/agenda/p1/bulk",
        Some(&token),
        Some(json!({ "date_from": "2024-09-10", "date_to": "2024-09-01" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bulk_then_sync_is_a_no_op() {
    let h = harness();
    let token = JwtTestUtils::bearer(&TestUser::staff("s@example.com"), &h.config);

    let (status, summary) = send(
        &h.app,
        "POST",
        "/agenda/p1/bulk",
        Some(&token),
        Some(json!({ "date_from": "2024-09-02", "date_to": "2024-09-08" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["created"], 15);

    let (status, summary) = send(
        &h.app,
        "POST",
        "/agenda/p1/sync",
        Some(&token),
        Some(json!({ "date_from": "2024-09-02", "date_to": "2024-09-06" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["upserted"], 0);
    assert_eq!(summary["deactivated"], 0);
}
