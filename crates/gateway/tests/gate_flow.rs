//! End-to-end gate behavior against a migrated Postgres.
//!
//! Run with:
//! ```bash
//! export DATABASE_URL="postgres://..."
//! cargo test -p avaolo-gateway -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tower::ServiceExt;
use uuid::Uuid;

use avaolo_billing::{BillingService, StripeConfig};
use avaolo_gateway::{config::Config, routes, state::AppState};
use avaolo_shared::{FarmerId, ResourceType, SubscriptionStatus};

const JWT_SECRET: &str = "integration-test-secret-0123456789abcdef";

#[derive(Serialize)]
struct TestClaims {
    sub: String,
    exp: usize,
}

struct TestApp {
    app: Router,
    billing: Arc<BillingService>,
    pool: PgPool,
}

async fn setup() -> TestApp {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    let config = Arc::new(Config {
        bind_address: "127.0.0.1:0".to_string(),
        public_url: "http://localhost:3000".to_string(),
        database_url: database_url.clone(),
        jwt_secret: JWT_SECRET.to_string(),
        stripe_secret_key: "sk_test_unused".to_string(),
        stripe_webhook_secret: "whsec_test_unused".to_string(),
        enable_usage_gate: true,
    });

    let stripe_config = StripeConfig {
        secret_key: config.stripe_secret_key.clone(),
        webhook_secret: config.stripe_webhook_secret.clone(),
        app_base_url: config.public_url.clone(),
    };
    let billing = Arc::new(BillingService::new(pool.clone(), stripe_config));

    let state = AppState::new(pool.clone(), config, billing.clone());
    TestApp {
        app: routes::create_router(state),
        billing,
        pool,
    }
}

async fn create_farmer(
    pool: &PgPool,
    status: SubscriptionStatus,
    trial_end: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
) -> FarmerId {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO farmers (id, name, subscription_status, trial_end_date, current_period_end)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(format!("Gate test farmer {}", id))
    .bind(status)
    .bind(trial_end)
    .bind(period_end)
    .execute(pool)
    .await
    .expect("Failed to create test farmer");
    FarmerId(id)
}

async fn cleanup(pool: &PgPool, farmer_ids: &[FarmerId]) {
    for id in farmer_ids {
        sqlx::query("DELETE FROM usage_events WHERE farmer_id = $1")
            .bind(id.0)
            .execute(pool)
            .await
            .ok();
        sqlx::query("DELETE FROM farmers WHERE id = $1")
            .bind(id.0)
            .execute(pool)
            .await
            .ok();
    }
}

fn bearer(farmer_id: FarmerId) -> String {
    let claims = TestClaims {
        sub: farmer_id.to_string(),
        exp: (OffsetDateTime::now_utc() + Duration::hours(1)).unix_timestamp() as usize,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("Failed to sign test JWT");
    format!("Bearer {}", token)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    serde_json::from_slice(&bytes).expect("Body was not JSON")
}

#[tokio::test]
#[ignore] // Requires database
async fn test_expired_trial_gets_402_with_payment_url() {
    let t = setup().await;
    let farmer = create_farmer(
        &t.pool,
        SubscriptionStatus::Trial,
        Some(OffsetDateTime::now_utc() - Duration::days(1)),
        None,
    )
    .await;

    let request = Request::builder()
        .uri("/api/v1/weather/forecast")
        .header("authorization", bearer(farmer))
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "subscription_required");
    assert_eq!(body["trial_expired"], true);
    assert!(body["payment_url"]
        .as_str()
        .unwrap()
        .contains(&farmer.to_string()));

    cleanup(&t.pool, &[farmer]).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_active_farmer_passes_and_usage_is_recorded() {
    let t = setup().await;
    let farmer = create_farmer(
        &t.pool,
        SubscriptionStatus::Active,
        None,
        Some(OffsetDateTime::now_utc() + Duration::days(20)),
    )
    .await;

    let request = Request::builder()
        .uri("/api/v1/weather/forecast")
        .header("authorization", bearer(farmer))
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();

    // The gateway carries no weather handler; passing the gate means
    // reaching the router's fallback.
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().contains_key("x-usage-limit"));
    // Headers include the unit this request consumed.
    assert_eq!(response.headers().get("x-usage-current").unwrap(), "1");

    // Recording is fire-and-forget; give the spawned task a moment.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let usage = t
        .billing
        .current_usage(farmer, ResourceType::ApiCall)
        .await
        .expect("usage query failed");
    assert_eq!(usage.used, 1);

    cleanup(&t.pool, &[farmer]).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_last_included_unit_reports_zero_remaining() {
    let t = setup().await;
    let farmer = create_farmer(
        &t.pool,
        SubscriptionStatus::Active,
        None,
        Some(OffsetDateTime::now_utc() + Duration::days(20)),
    )
    .await;

    t.billing
        .settings
        .update("api_call_limit", "2", "gate-test")
        .await
        .expect("config update failed");
    t.billing
        .record_usage(farmer, ResourceType::ApiCall, "/api/v1/query")
        .await
        .expect("record failed");

    // Count is 1 of 2: this request is allowed and consumes the last
    // included unit, so the headers must already read exhausted.
    let request = Request::builder()
        .uri("/api/v1/query")
        .header("authorization", bearer(farmer))
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers().get("x-usage-current").unwrap(), "2");
    assert_eq!(response.headers().get("x-usage-remaining").unwrap(), "0");

    t.billing
        .settings
        .update("api_call_limit", "1000", "gate-test")
        .await
        .expect("config restore failed");
    cleanup(&t.pool, &[farmer]).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_over_limit_gets_429_with_overflow_pricing() {
    let t = setup().await;
    let farmer = create_farmer(
        &t.pool,
        SubscriptionStatus::Active,
        None,
        Some(OffsetDateTime::now_utc() + Duration::days(20)),
    )
    .await;

    t.billing
        .settings
        .update("api_call_limit", "2", "gate-test")
        .await
        .expect("config update failed");

    for _ in 0..2 {
        t.billing
            .record_usage(farmer, ResourceType::ApiCall, "/api/v1/query")
            .await
            .expect("record failed");
    }

    let request = Request::builder()
        .uri("/api/v1/query")
        .header("authorization", bearer(farmer))
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers().get("x-usage-remaining").unwrap(),
        "0"
    );
    let body = body_json(response).await;
    assert_eq!(body["error"], "usage_limit_exceeded");
    assert_eq!(body["limit"], 2);
    assert_eq!(body["usage"], 2);
    assert!(body["overflow_pricing"]["price_eur"].is_number());

    t.billing
        .settings
        .update("api_call_limit", "1000", "gate-test")
        .await
        .expect("config restore failed");
    cleanup(&t.pool, &[farmer]).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_unattributable_request_passes_through() {
    let t = setup().await;

    let request = Request::builder()
        .uri("/api/v1/weather/forecast")
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!response.headers().contains_key("x-usage-limit"));
}

#[tokio::test]
#[ignore] // Requires database
async fn test_exempt_paths_skip_the_gate() {
    let t = setup().await;

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_whatsapp_sender_resolved_from_body() {
    let t = setup().await;
    let farmer = create_farmer(
        &t.pool,
        SubscriptionStatus::Trial,
        Some(OffsetDateTime::now_utc() - Duration::days(1)),
        None,
    )
    .await;
    let phone = format!("+38591{}", &farmer.to_string()[..7].replace('-', ""));
    sqlx::query("UPDATE farmers SET wa_phone_number = $1 WHERE id = $2")
        .bind(&phone)
        .bind(farmer.0)
        .execute(&t.pool)
        .await
        .expect("phone update failed");

    let body = format!(
        "MessageSid=SM123&From=whatsapp%3A{}&Body=hello",
        phone.replace('+', "%2B")
    );
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/whatsapp/inbound")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();

    // Expired trial resolved via phone number: blocked before the handler.
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "subscription_required");

    cleanup(&t.pool, &[farmer]).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_webhook_rejects_bad_signature() {
    let t = setup().await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/billing/webhook")
        .header("stripe-signature", "t=0,v1=deadbeef")
        .body(Body::from(r#"{"id":"evt_test"}"#))
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
