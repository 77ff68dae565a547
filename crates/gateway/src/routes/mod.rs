//! HTTP route definitions

pub mod admin;
pub mod billing;
pub mod health;
pub mod usage;
pub mod whatsapp;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{gate, state::AppState};

/// Build the application router. The usage gate wraps everything; exempt
/// paths fall through inside the middleware itself.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/billing/webhook", post(billing::stripe_webhook))
        .route("/payment/subscribe", post(billing::subscribe))
        .route("/usage", get(usage::current_usage))
        .route("/usage/breakdown", get(usage::usage_breakdown))
        .route("/admin/config", get(admin::list_config))
        .route("/admin/config", put(admin::update_config))
        .route("/admin/config/:key/history", get(admin::config_history))
        .route("/whatsapp/inbound", post(whatsapp::inbound));

    Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .nest("/api/v1", api)
        .layer(middleware::from_fn_with_state(state.clone(), gate::usage_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
