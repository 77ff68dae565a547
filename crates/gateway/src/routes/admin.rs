//! Billing configuration administration
//!
//! Changes take effect on the next entitlement decision; no restart needed.
//! Every update lands in the audit log with the acting admin's identity.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use avaolo_billing::{BillingSettings, ConfigAuditEntry};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn list_config(State(state): State<AppState>) -> ApiResult<Json<BillingSettings>> {
    let settings = state.billing.settings.load().await?;
    Ok(Json(settings))
}

#[derive(Debug, Deserialize)]
pub struct UpdateConfigRequest {
    pub key: String,
    pub value: String,
}

/// Who made the change, for the audit row. Falls back to "admin" when the
/// proxy does not forward an identity header.
fn actor_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-admin-user")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or("admin")
        .to_string()
}

pub async fn update_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UpdateConfigRequest>,
) -> ApiResult<Json<Value>> {
    let actor = actor_from_headers(&headers);
    state
        .billing
        .settings
        .update(&request.key, &request.value, &actor)
        .await?;

    Ok(Json(json!({
        "key": request.key,
        "value": request.value,
        "updated_by": actor,
    })))
}

pub async fn config_history(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Vec<ConfigAuditEntry>>> {
    let entries = state.billing.settings.history(&key).await?;
    Ok(Json(entries))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_actor_defaults_to_admin() {
        assert_eq!(actor_from_headers(&HeaderMap::new()), "admin");

        let mut headers = HeaderMap::new();
        headers.insert("x-admin-user", "peter".parse().unwrap());
        assert_eq!(actor_from_headers(&headers), "peter");

        let mut headers = HeaderMap::new();
        headers.insert("x-admin-user", "   ".parse().unwrap());
        assert_eq!(actor_from_headers(&headers), "admin");
    }
}
