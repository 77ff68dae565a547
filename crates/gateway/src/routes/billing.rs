//! Stripe webhook and checkout endpoints

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use avaolo_shared::FarmerId;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Stripe webhook endpoint.
///
/// The raw body is needed for signature verification, so this takes the
/// payload as a `String` rather than a typed extractor. Returns 200 for
/// verified events (including unsupported types, so Stripe stops retrying)
/// and 400 for anything that fails verification.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: String,
) -> ApiResult<StatusCode> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing stripe-signature header".to_string()))?;

    let event = state.billing.lifecycle.verify_event(&payload, signature)?;

    tracing::info!(event_id = %event.id, event_type = %event.type_, "Processing Stripe webhook");
    state.billing.lifecycle.handle_event(event).await?;

    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    pub farmer_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

/// Start a subscription checkout. Linked from the `payment_url` in
/// subscription-required denials.
pub async fn subscribe(
    State(state): State<AppState>,
    Query(params): Query<SubscribeParams>,
) -> ApiResult<Json<CheckoutResponse>> {
    let session = state
        .billing
        .checkout
        .create_subscription_checkout(FarmerId(params.farmer_id))
        .await?;

    Ok(Json(CheckoutResponse {
        session_id: session.id.to_string(),
        url: session.url,
    }))
}
