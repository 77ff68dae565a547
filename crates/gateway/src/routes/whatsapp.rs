//! WhatsApp inbound webhook
//!
//! Message handling itself lives in the assistant service; this endpoint
//! acknowledges delivery so the provider does not retry. Gating and usage
//! accounting happen in the middleware before the request reaches here.

use axum::{http::StatusCode, Json};
use serde_json::{json, Value};

use crate::principal;

pub async fn inbound(body: String) -> (StatusCode, Json<Value>) {
    let sender = principal::whatsapp_sender(body.as_bytes());
    tracing::info!(
        sender_present = sender.is_some(),
        "Accepted inbound WhatsApp message"
    );

    (StatusCode::OK, Json(json!({ "status": "accepted" })))
}
