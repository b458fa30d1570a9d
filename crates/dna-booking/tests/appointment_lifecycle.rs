//! End-to-end journeys through the public facade and HTTP router: a paid facility
//! appointment from booking to results, and a reservation converted into an appointment.

mod common {
    use std::io::Cursor;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    use dna_booking::booking::{
        booking_router, parse_roster, BookingConfig, BookingService, MemoryBackend,
    };

    pub(super) const ROSTER: &str = "\
id,name,role,active,slots
stf-lan,Lan,staff,true,slot-am;slot-pm
stf-hoa,Hoa,staff,yes,slot-am
tech-minh,Minh,lab_technician,true,
mgr-an,An,manager,true,slot-am
";

    pub(super) const KITS: &str = "\
id,code
kit-a,DNA-0001
kit-b,DNA-0002
kit-c,DNA-0003
";

    pub(super) struct App {
        pub(super) backend: MemoryBackend,
        pub(super) router: Router,
    }

    pub(super) fn app() -> App {
        let backend = MemoryBackend::default();
        for member in parse_roster(Cursor::new(ROSTER)).expect("roster parses") {
            backend.staff.add(member);
        }
        let service = Arc::new(BookingService::new(
            backend.stores(),
            BookingConfig::default(),
        ));
        let import = service
            .import_kits(Cursor::new(KITS))
            .expect("kits import");
        assert_eq!(import.added, 3);

        let router = booking_router(service);
        App { backend, router }
    }

    impl App {
        pub(super) async fn send(
            &self,
            method: &str,
            uri: &str,
            actor: (&str, &str),
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut request = Request::builder()
                .method(method)
                .uri(uri)
                .header("x-actor-id", actor.0)
                .header("x-actor-role", actor.1);
            let body = match body {
                Some(json) => {
                    request = request.header("content-type", "application/json");
                    Body::from(serde_json::to_vec(&json).expect("serialize body"))
                }
                None => Body::empty(),
            };

            let response = self
                .router
                .clone()
                .oneshot(request.body(body).expect("request"))
                .await
                .expect("router dispatch");
            let status = response.status();
            let bytes = to_bytes(response.into_body(), 1024 * 1024)
                .await
                .expect("body");
            let payload = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).expect("json")
            };
            (status, payload)
        }
    }
}

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use serde_json::json;

use dna_booking::booking::AuditSubject;

use common::app;

const CUSTOMER: (&str, &str) = ("cus-77", "customer");
const DESK: (&str, &str) = ("stf-lan", "staff");
const MANAGER: (&str, &str) = ("mgr-an", "manager");
const TECHNICIAN: (&str, &str) = ("tech-minh", "lab_technician");

fn id_of(payload: &serde_json::Value) -> String {
    payload["value"]["id"]
        .as_str()
        .expect("id in payload")
        .to_string()
}

#[tokio::test]
async fn paid_facility_appointment_runs_from_booking_to_results() {
    let app = app();
    let today = Utc::now().date_naive();

    let (status, created) = app
        .send(
            "POST",
            "/api/v1/appointments",
            CUSTOMER,
            Some(json!({
                "customer_id": "cus-77",
                "type": "facility",
                "appointment_date": today + Duration::days(3),
                "total_amount": 500_000,
                "deposit_amount": 150_000,
                "slot_id": "slot-am",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let appointment = id_of(&created);
    let base = format!("/api/v1/appointments/{appointment}");

    let (status, _) = app
        .send(
            "POST",
            &format!("{base}/staff"),
            MANAGER,
            Some(json!({ "candidates": ["stf-lan"] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app
        .send(
            "POST",
            &format!("{base}/technician"),
            MANAGER,
            Some(json!({ "technician_id": "tech-minh" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, confirmed) = app
        .send(
            "POST",
            &format!("{base}/transitions"),
            DESK,
            Some(json!({ "status": "confirmed" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["value"]["status"], "confirmed");

    for (stage, amount) in [("deposit", 150_000), ("remaining", 350_000)] {
        let (status, opened) = app
            .send(
                "POST",
                "/api/v1/payments",
                CUSTOMER,
                Some(json!({
                    "target": { "kind": "appointment", "id": appointment },
                    "stage": stage,
                    "method": "bank_transfer",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{opened}");
        assert_eq!(opened["value"]["amount"], amount);
        let payment = id_of(&opened);
        let (status, _) = app
            .send(
                "POST",
                &format!("/api/v1/payments/{payment}/complete"),
                DESK,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, allocated) = app
        .send(
            "POST",
            &format!("{base}/samples"),
            CUSTOMER,
            Some(json!({
                "sample_types": ["saliva", "saliva"],
                "person_info": [
                    { "name": "Nguyen Van A", "relationship": "alleged father" },
                    { "name": "Nguyen Van B", "relationship": "child" },
                ],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{allocated}");
    let samples: Vec<String> = allocated["value"]
        .as_array()
        .expect("samples")
        .iter()
        .map(|sample| sample["id"].as_str().expect("sample id").to_string())
        .collect();
    assert_eq!(samples.len(), 2);

    for sample in &samples {
        let (status, _) = app
            .send(
                "POST",
                &format!("/api/v1/samples/{sample}/submit"),
                CUSTOMER,
                Some(json!({ "collection_date": today })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    for sample in &samples {
        let (status, _) = app
            .send(
                "POST",
                &format!("/api/v1/samples/{sample}/receive"),
                DESK,
                Some(json!({ "received_date": today })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    for target in ["testing", "completed"] {
        let (status, moved) = app
            .send(
                "POST",
                &format!("{base}/transitions"),
                TECHNICIAN,
                Some(json!({ "status": target })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{moved}");
    }

    let (status, finished) = app.send("GET", &base, CUSTOMER, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(finished["status"], "completed");
    assert_eq!(finished["payment_stage"], "paid");
    assert_eq!(finished["amount_paid"], 500_000);

    let (status, kits) = app.send("GET", "/api/v1/kits", DESK, None).await;
    assert_eq!(status, StatusCode::OK);
    let used = kits
        .as_array()
        .expect("kits")
        .iter()
        .filter(|kit| kit["status"] == "used")
        .count();
    assert_eq!(used, 2);

    let transitions: Vec<(Option<String>, Option<String>)> = app
        .backend
        .audit
        .entries()
        .into_iter()
        .filter(|entry| matches!(entry.subject, AuditSubject::Appointment(_)))
        .filter(|entry| entry.from_status.is_some())
        .map(|entry| (entry.from_status, entry.to_status))
        .collect();
    let expected = [
        ("none", "pending"),
        ("pending", "confirmed"),
        ("confirmed", "sample_collected"),
        ("sample_collected", "sample_received"),
        ("sample_received", "testing"),
        ("testing", "completed"),
    ];
    assert_eq!(transitions.len(), expected.len());
    for ((from, to), (want_from, want_to)) in transitions.iter().zip(expected) {
        assert_eq!(from.as_deref(), Some(want_from));
        assert_eq!(to.as_deref(), Some(want_to));
    }
}

#[tokio::test]
async fn reservation_converts_once_and_the_sweep_leaves_it_alone() {
    let app = app();
    let preferred = Utc::now().date_naive() + Duration::days(10);

    let (status, created) = app
        .send(
            "POST",
            "/api/v1/reservations",
            CUSTOMER,
            Some(json!({
                "customer_id": "cus-77",
                "testing_need": "immigration kinship test",
                "preferred_collection_type": "facility",
                "preferred_date": preferred,
                "total_amount": 3_000_000,
                "deposit_amount": 1_000_000,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let reservation = id_of(&created);
    let base = format!("/api/v1/reservations/{reservation}");

    let (status, _) = app
        .send("POST", &format!("{base}/confirm"), DESK, None)
        .await;
    assert_eq!(status, StatusCode::OK);

    for stage in ["deposit", "remaining"] {
        let (status, opened) = app
            .send(
                "POST",
                "/api/v1/payments",
                CUSTOMER,
                Some(json!({
                    "target": { "kind": "reservation", "id": reservation },
                    "stage": stage,
                    "method": "card",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{opened}");
        let payment = id_of(&opened);
        app.send(
            "POST",
            &format!("/api/v1/payments/{payment}/complete"),
            DESK,
            None,
        )
        .await;
    }

    let (status, converted) = app
        .send("POST", &format!("{base}/convert"), DESK, None)
        .await;
    assert_eq!(status, StatusCode::CREATED, "{converted}");
    assert_eq!(converted["value"]["status"], "pending");
    assert_eq!(converted["value"]["payment_stage"], "paid");

    let (status, again) = app
        .send("POST", &format!("{base}/convert"), DESK, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(again["current_status"], "converted");

    let (status, sweep) = app
        .send("POST", "/api/v1/reservations/expire", MANAGER, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sweep["expired"], json!([]));

    let (status, stored) = app.send("GET", &base, CUSTOMER, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["status"], "converted");
    assert_eq!(stored["converted_appointment_id"], converted["value"]["id"]);
}

#[tokio::test]
async fn capacity_rejection_suggests_a_rostered_colleague() {
    let app = app();
    let date = Utc::now().date_naive() + Duration::days(5);

    let mut last = String::new();
    for _ in 0..4 {
        let (_, created) = app
            .send(
                "POST",
                "/api/v1/appointments",
                CUSTOMER,
                Some(json!({
                    "customer_id": "cus-77",
                    "type": "self_collected",
                    "appointment_date": date,
                    "total_amount": 400_000,
                    "deposit_amount": 100_000,
                    "slot_id": "slot-am",
                })),
            )
            .await;
        last = id_of(&created);
        let (status, body) = app
            .send(
                "POST",
                &format!("/api/v1/appointments/{last}/staff"),
                MANAGER,
                Some(json!({ "candidates": ["stf-lan"] })),
            )
            .await;
        if status == StatusCode::CONFLICT {
            assert_eq!(body["kind"], "capacity");
            assert_eq!(body["suggestion"]["staff_id"], "stf-hoa");
            return;
        }
        assert_eq!(status, StatusCode::OK);
    }
    panic!("appointment {last} should have hit the staff limit");
}
