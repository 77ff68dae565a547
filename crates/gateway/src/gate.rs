//! Request gate
//!
//! Per-request interception point for billed resources. Resolves the
//! calling account, asks the entitlement evaluator for a decision, and
//! either short-circuits with a structured 402/429 payload or forwards the
//! request and records the consumption afterwards.
//!
//! Billing must never take the platform down: evaluation failures and
//! unattributable requests pass through ungated, and the usage write is a
//! detached task that cannot turn a served request into a 5xx.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use time::format_description::well_known::Rfc3339;
use tokio_retry::{strategy::ExponentialBackoff, Retry};

use avaolo_billing::{BillingError, Decision, UsageSnapshot};
use avaolo_shared::{FarmerId, ResourceType};

use crate::{error::ApiError, principal, state::AppState};

/// Paths never subject to gating: payment and subscription management,
/// auth, health, admin, webhooks, static assets and API docs.
pub const EXEMPT_PREFIXES: &[&str] = &[
    "/health",
    "/api/v1/auth",
    "/api/v1/payment",
    "/api/v1/subscription",
    "/api/v1/admin",
    "/api/v1/billing",
    "/static",
    "/docs",
    "/redoc",
    "/openapi.json",
    "/favicon.ico",
];

/// Resource-bearing agricultural/advisory endpoints, metered as API calls.
pub const TRACKED_API_PREFIXES: &[&str] = &[
    "/api/v1/farm",
    "/api/v1/fields",
    "/api/v1/crops",
    "/api/v1/weather",
    "/api/v1/advisory",
    "/api/v1/query",
];

/// WhatsApp-inbound paths, metered as messages.
pub const TRACKED_WHATSAPP_PREFIXES: &[&str] = &["/api/v1/whatsapp"];

/// Largest inbound body the gate will buffer when sniffing the WhatsApp
/// sender. Twilio webhook bodies are far below this.
const MAX_SNIFFED_BODY_BYTES: usize = 64 * 1024;

static HEADER_USAGE_LIMIT: HeaderName = HeaderName::from_static("x-usage-limit");
static HEADER_USAGE_CURRENT: HeaderName = HeaderName::from_static("x-usage-current");
static HEADER_USAGE_REMAINING: HeaderName = HeaderName::from_static("x-usage-remaining");

/// Decide whether a path is gated and which resource it consumes.
pub fn classify_path(path: &str) -> Option<ResourceType> {
    if EXEMPT_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return None;
    }
    if TRACKED_WHATSAPP_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return Some(ResourceType::WhatsappMessage);
    }
    if TRACKED_API_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return Some(ResourceType::ApiCall);
    }
    None
}

/// The usage gate middleware. Applied to the whole router; untracked paths
/// fall through immediately.
pub async fn usage_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.config.enable_usage_gate {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    let Some(resource) = classify_path(&path) else {
        return next.run(request).await;
    };

    let (farmer_id, request) = resolve_account(&state, request, resource).await;
    let Some(farmer_id) = farmer_id else {
        // Usage cannot be attributed, so it is neither billed nor blocked.
        tracing::debug!(path = %path, "No account resolved for gated path; passing through");
        return next.run(request).await;
    };

    let evaluation = match state.billing.entitlement.evaluate(farmer_id, resource).await {
        Ok(evaluation) => evaluation,
        Err(BillingError::NotFound(_)) => {
            tracing::debug!(farmer_id = %farmer_id, "Resolved account unknown; passing through");
            return next.run(request).await;
        }
        Err(e) => {
            tracing::warn!(
                farmer_id = %farmer_id,
                error = %e,
                "Entitlement evaluation failed; failing open"
            );
            return next.run(request).await;
        }
    };

    match evaluation.decision {
        Decision::Allow => {
            let mut response = next.run(request).await;
            // Headers count the unit this request consumed; the ledger
            // write has not landed yet.
            let consumed = evaluation.usage.map(|s| UsageSnapshot {
                limit: s.limit,
                current: s.current + 1,
            });
            attach_usage_headers(&mut response, consumed.as_ref());
            // The resource was consumed regardless of the downstream
            // handler's own outcome, so record either way.
            spawn_usage_record(state, evaluation.farmer_id, resource, path);
            response
        }
        Decision::SubscriptionRequired {
            trial_expired,
            payment_url,
        } => {
            tracing::info!(
                farmer_id = %evaluation.farmer_id,
                path = %path,
                trial_expired = trial_expired,
                "Request denied: subscription required"
            );
            let message = if trial_expired {
                "Your free trial has ended. Subscribe to keep using AVA OLO.".to_string()
            } else {
                "An active subscription is required to use this feature.".to_string()
            };
            let mut response = ApiError::SubscriptionRequired {
                message,
                payment_url,
                trial_expired,
            }
            .into_response();
            attach_usage_headers(&mut response, evaluation.usage.as_ref());
            response
        }
        Decision::UsageLimitExceeded {
            limit,
            usage,
            period_end,
            overflow,
        } => {
            tracing::info!(
                farmer_id = %evaluation.farmer_id,
                path = %path,
                limit = limit,
                usage = usage,
                "Request denied: usage limit exceeded"
            );
            let message = format!(
                "You have used {} of {} included {}s this billing period.",
                usage, limit, overflow.unit
            );
            let mut response = ApiError::UsageLimitExceeded {
                message,
                limit,
                usage,
                period_end: period_end.and_then(|t| t.format(&Rfc3339).ok()),
                overflow,
            }
            .into_response();
            attach_usage_headers(&mut response, evaluation.usage.as_ref());
            response
        }
    }
}

/// Resolve the calling account. May buffer and replace the request body for
/// WhatsApp-originated calls; always returns a usable request.
async fn resolve_account(
    state: &AppState,
    request: Request,
    resource: ResourceType,
) -> (Option<FarmerId>, Request) {
    let headers = request.headers();

    if let Some(id) = principal::farmer_from_bearer(headers, &state.config.jwt_secret) {
        return (Some(id), request);
    }

    if let Some(token) = principal::session_token(headers) {
        if let Some(id) = principal::farmer_from_session(&state.pool, &token).await {
            return (Some(id), request);
        }
    }

    if let Some(id) = request
        .uri()
        .query()
        .and_then(principal::farmer_from_query)
    {
        return (Some(id), request);
    }

    if resource == ResourceType::WhatsappMessage {
        return resolve_whatsapp_sender(state, request).await;
    }

    (None, request)
}

/// Buffer the form body, look up the sender's phone number, and rebuild the
/// request so the downstream handler still sees the original bytes.
async fn resolve_whatsapp_sender(
    state: &AppState,
    request: Request,
) -> (Option<FarmerId>, Request) {
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_SNIFFED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to buffer WhatsApp body; passing through");
            return (None, Request::from_parts(parts, Body::empty()));
        }
    };

    let farmer_id = match principal::whatsapp_sender(&bytes) {
        Some(sender) => match state.billing.accounts.find_by_phone(&sender).await {
            Ok(found) => {
                if found.is_none() {
                    tracing::debug!("WhatsApp sender not registered; passing through");
                }
                found
            }
            Err(e) => {
                tracing::warn!(error = %e, "Phone lookup failed; passing through");
                None
            }
        },
        None => None,
    };

    (farmer_id, Request::from_parts(parts, Body::from(bytes)))
}

fn attach_usage_headers(response: &mut Response, snapshot: Option<&UsageSnapshot>) {
    let Some(snapshot) = snapshot else {
        return;
    };
    let headers = response.headers_mut();
    for (name, value) in [
        (&HEADER_USAGE_LIMIT, snapshot.limit),
        (&HEADER_USAGE_CURRENT, snapshot.current),
        (&HEADER_USAGE_REMAINING, snapshot.remaining()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            headers.insert(name.clone(), value);
        }
    }
}

/// Fire-and-forget usage write: three attempts with exponential backoff,
/// then a dead-letter log entry. Never surfaces to the caller.
fn spawn_usage_record(
    state: AppState,
    farmer_id: FarmerId,
    resource: ResourceType,
    endpoint: String,
) {
    tokio::spawn(async move {
        let strategy = ExponentialBackoff::from_millis(2).factor(50).take(2);
        let result = Retry::spawn(strategy, || {
            state.billing.record_usage(farmer_id, resource, &endpoint)
        })
        .await;

        if let Err(e) = result {
            tracing::error!(
                farmer_id = %farmer_id,
                resource = %resource,
                endpoint = %endpoint,
                error = %e,
                "Usage event dropped after retries"
            );
        }
    });
}
