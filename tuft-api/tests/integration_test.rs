use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{Duration, TimeZone, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use tuft_api::{app, middleware::Claims, worker, AppState, AuthConfig};
use tuft_booking::MemoryBookingRepository;
use tuft_core::{Clock, FixedClock, RecordingNotificationSender};
use tuft_shared::NotificationKind;
use uuid::Uuid;

const SECRET: &str = "integration-secret";

struct Harness {
    app: Router,
    state: AppState,
    clock: Arc<FixedClock>,
    sent: Arc<RecordingNotificationSender>,
    admin: String,
}

fn harness() -> Harness {
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 11, 1, 9, 0, 0).unwrap()));
    let sent = Arc::new(RecordingNotificationSender::new());
    let state = AppState {
        repo: Arc::new(MemoryBookingRepository::default()),
        clock: clock.clone(),
        notifier: sent.clone(),
        redis: None,
        requests_per_minute: 100,
        auth: AuthConfig {
            secret: SECRET.to_string(),
        },
    };
    Harness {
        app: app(state.clone()),
        state,
        clock,
        sent,
        admin: token(Uuid::new_v4(), "ADMIN"),
    }
}

fn token(user_id: Uuid, role: &str) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        role: role.to_string(),
        email: None,
        exp: (Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

impl Harness {
    async fn create_class(&self, capacity: u32, starts_in: Duration) -> String {
        let starts_at = self.clock.now() + starts_in;
        let (status, class) = call(
            &self.app,
            Method::POST,
            "/v1/admin/classes",
            Some(&self.admin),
            Some(json!({
                "class_type_id": Uuid::new_v4(),
                "title": "Punch needle basics",
                "location": "Studio A",
                "starts_at": starts_at,
                "ends_at": starts_at + Duration::hours(3),
                "capacity": capacity,
                "price_cents": 4500,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", class);
        class["id"].as_str().unwrap().to_string()
    }

    async fn grant_package(&self, user_id: Uuid, credits: u32) -> String {
        let (status, package) = call(
            &self.app,
            Method::POST,
            "/v1/admin/packages",
            Some(&self.admin),
            Some(json!({
                "user_id": user_id,
                "name": "Starter pack",
                "kind": "STANDARD",
                "total_credits": credits,
                "paid": true,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", package);
        assert_eq!(package["status"], "ACTIVE");
        package["id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn test_health_is_public() {
    let h = harness();
    let (status, body) = call(&h.app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_requires_valid_token_and_role() {
    let h = harness();

    let (status, body) = call(&h.app, Method::GET, "/v1/me/reservations", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "UNAUTHENTICATED");

    let (status, _) = call(&h.app, Method::GET, "/v1/me/reservations", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let student = token(Uuid::new_v4(), "STUDENT");
    let (status, _) = call(&h.app, Method::GET, "/v1/admin/holidays", Some(&student), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let instructor = token(Uuid::new_v4(), "INSTRUCTOR");
    let (status, _) = call(&h.app, Method::GET, "/v1/admin/holidays", Some(&instructor), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&h.app, Method::GET, "/v1/admin/holidays", Some(&h.admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_cancellation_frees_seat_for_waitlist() {
    let h = harness();
    let class_id = h.create_class(1, Duration::days(3)).await;

    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let alice_token = token(alice, "STUDENT");
    let bob_token = token(bob, "STUDENT");
    let package_id = h.grant_package(alice, 5).await;

    let (status, booking) = call(
        &h.app,
        Method::POST,
        &format!("/v1/classes/{}/reservations", class_id),
        Some(&alice_token),
        Some(json!({ "package_id": package_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", booking);
    assert_eq!(booking["class_status"], "FULL");
    assert_eq!(booking["credit"]["used_after"], 1);
    let reservation_id = booking["reservation"]["id"].as_str().unwrap().to_string();

    let (status, rejected) = call(
        &h.app,
        Method::POST,
        &format!("/v1/classes/{}/reservations", class_id),
        Some(&bob_token),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(rejected["kind"], "CAPACITY_EXCEEDED");
    assert_eq!(rejected["details"]["capacity"], 1);

    let (status, entry) = call(
        &h.app,
        Method::POST,
        &format!("/v1/classes/{}/waitlist", class_id),
        Some(&bob_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", entry);
    assert_eq!(entry["priority"], 1);

    // Bob cannot cancel Alice's seat.
    let (status, _) = call(
        &h.app,
        Method::POST,
        &format!("/v1/reservations/{}/cancel", reservation_id),
        Some(&bob_token),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, cancelled) = call(
        &h.app,
        Method::POST,
        &format!("/v1/reservations/{}/cancel", reservation_id),
        Some(&alice_token),
        Some(json!({ "reason": "sick" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", cancelled);
    assert_eq!(cancelled["reservation"]["status"], "CANCELLED");
    assert_eq!(cancelled["credit_restored"]["used_after"], 0);
    assert_eq!(cancelled["promoted"]["reservation"]["user_id"], json!(bob));
    assert_eq!(cancelled["class_status"], "FULL");

    let (_, packages) = call(&h.app, Method::GET, "/v1/me/packages", Some(&alice_token), None).await;
    assert_eq!(packages[0]["used_credits"], 0);
    assert_eq!(packages[0]["status"], "ACTIVE");

    let (status, movements) = call(
        &h.app,
        Method::GET,
        &format!("/v1/packages/{}/movements", package_id),
        Some(&alice_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(movements.as_array().unwrap().len(), 2);

    let (_, waitlist) = call(
        &h.app,
        Method::GET,
        &format!("/v1/staff/classes/{}/waitlist", class_id),
        Some(&h.admin),
        None,
    )
    .await;
    assert_eq!(waitlist, json!([]));

    let sent = h.sent.sent();
    assert!(sent
        .iter()
        .any(|n| n.kind == NotificationKind::WaitlistPromoted && n.user_id == bob));
    assert!(sent
        .iter()
        .any(|n| n.kind == NotificationKind::BookingCancelled && n.user_id == alice));
}

#[tokio::test]
async fn test_late_cancellation_is_rejected_with_details() {
    let h = harness();
    let class_id = h.create_class(4, Duration::hours(2)).await;
    let student = token(Uuid::new_v4(), "STUDENT");

    let (status, booking) = call(
        &h.app,
        Method::POST,
        &format!("/v1/classes/{}/reservations", class_id),
        Some(&student),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let reservation_id = booking["reservation"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &h.app,
        Method::POST,
        &format!("/v1/reservations/{}/cancel", reservation_id),
        Some(&student),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "CANCELLATION_WINDOW_VIOLATION");
    assert_eq!(body["details"]["minutes_remaining"], 120);
    assert_eq!(body["details"]["required_hours"], 24);

    let (status, view) = call(&h.app, Method::GET, &format!("/v1/classes/{}", class_id), Some(&student), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["availability"]["active"], 1);
}

#[tokio::test]
async fn test_sweeps_cancel_unpaid_and_start_classes() {
    let h = harness();
    let class_id = h.create_class(2, Duration::days(3)).await;
    let student = token(Uuid::new_v4(), "STUDENT");

    let (status, _) = call(
        &h.app,
        Method::POST,
        &format!("/v1/classes/{}/reservations", class_id),
        Some(&student),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    h.clock.advance(Duration::hours(25));
    let report = worker::run_sweeps(&h.state).await;
    assert_eq!(report.payments_cancelled, 1);
    assert_eq!(report.classes_started, 0);

    let (_, mine) = call(&h.app, Method::GET, "/v1/me/reservations", Some(&student), None).await;
    assert_eq!(mine[0]["status"], "CANCELLED");
    assert_eq!(mine[0]["cancellation_reason"], "payment deadline expired");

    h.clock.advance(Duration::days(2));
    let report = worker::run_sweeps(&h.state).await;
    assert_eq!(report.classes_started, 1);

    let (_, view) = call(&h.app, Method::GET, &format!("/v1/classes/{}", class_id), Some(&student), None).await;
    assert_eq!(view["class"]["status"], "IN_PROGRESS");
}

#[tokio::test]
async fn test_generate_classes_from_pattern_skips_holidays() {
    let h = harness();

    let (status, _) = call(
        &h.app,
        Method::POST,
        "/v1/admin/holidays",
        Some(&h.admin),
        Some(json!({ "date": "2026-11-09", "name": "Studio closed" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, pattern) = call(
        &h.app,
        Method::POST,
        "/v1/admin/patterns",
        Some(&h.admin),
        Some(json!({
            "class_type_id": Uuid::new_v4(),
            "title": "Monday rug night",
            "location": "Studio B",
            "day_of_week": "Mon",
            "start_time": "18:00:00",
            "duration_minutes": 180,
            "capacity": 8,
            "valid_from": "2026-11-01",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", pattern);
    let pattern_id = pattern["id"].as_str().unwrap();

    let request = json!({ "weeks_ahead": 3, "start_from": "2026-11-01" });
    let (status, outcome) = call(
        &h.app,
        Method::POST,
        &format!("/v1/admin/patterns/{}/generate", pattern_id),
        Some(&h.admin),
        Some(request.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", outcome);
    assert_eq!(outcome["created"].as_array().unwrap().len(), 2);
    assert_eq!(outcome["skipped"][0], json!(["2026-11-09", "HOLIDAY"]));

    let (_, again) = call(
        &h.app,
        Method::POST,
        &format!("/v1/admin/patterns/{}/generate", pattern_id),
        Some(&h.admin),
        Some(request),
    )
    .await;
    assert!(again["created"].as_array().unwrap().is_empty());

    let (status, body) = call(
        &h.app,
        Method::POST,
        &format!("/v1/admin/patterns/{}/generate", pattern_id),
        Some(&h.admin),
        Some(json!({ "weeks_ahead": 4_000_000_000u32, "start_from": "2026-11-01" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "VALIDATION_ERROR");
}
