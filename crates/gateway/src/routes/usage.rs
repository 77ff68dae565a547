//! Current-period usage reporting

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use avaolo_billing::{EndpointUsage, PeriodUsage};
use avaolo_shared::{FarmerId, ResourceType};

use crate::error::{ApiError, ApiResult};
use crate::principal;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UsageParams {
    pub farmer_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ResourceUsage {
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub farmer_id: FarmerId,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    pub api_calls: ResourceUsage,
    pub whatsapp_messages: ResourceUsage,
}

fn resource_usage(usage: &PeriodUsage) -> ResourceUsage {
    ResourceUsage {
        used: usage.used,
        limit: usage.limit,
        remaining: usage.remaining,
    }
}

/// Usage for the caller's current billing period, both resource types.
/// The account comes from the bearer token when present, otherwise from the
/// `farmer_id` query parameter.
pub async fn current_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UsageParams>,
) -> ApiResult<Json<UsageResponse>> {
    let farmer_id = principal::farmer_from_bearer(&headers, &state.config.jwt_secret)
        .or(params.farmer_id.map(FarmerId))
        .ok_or(ApiError::Unauthorized)?;

    let api = state
        .billing
        .current_usage(farmer_id, ResourceType::ApiCall)
        .await?;
    let whatsapp = state
        .billing
        .current_usage(farmer_id, ResourceType::WhatsappMessage)
        .await?;

    Ok(Json(UsageResponse {
        farmer_id: api.farmer_id,
        period_start: api.period_start.format(&Rfc3339).ok(),
        period_end: api.period_end.format(&Rfc3339).ok(),
        api_calls: resource_usage(&api),
        whatsapp_messages: resource_usage(&whatsapp),
    }))
}

#[derive(Debug, Serialize)]
pub struct BreakdownResponse {
    pub farmer_id: FarmerId,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    pub endpoints: Vec<EndpointUsage>,
}

/// Per-endpoint breakdown of this period's API calls, for the usage
/// dashboard.
pub async fn usage_breakdown(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UsageParams>,
) -> ApiResult<Json<BreakdownResponse>> {
    let farmer_id = principal::farmer_from_bearer(&headers, &state.config.jwt_secret)
        .or(params.farmer_id.map(FarmerId))
        .ok_or(ApiError::Unauthorized)?;

    let usage = state
        .billing
        .current_usage(farmer_id, ResourceType::ApiCall)
        .await?;
    let endpoints = state
        .billing
        .ledger
        .breakdown_by_endpoint(
            usage.farmer_id.0,
            ResourceType::ApiCall,
            usage.period_start,
            usage.period_end,
        )
        .await?;

    Ok(Json(BreakdownResponse {
        farmer_id: usage.farmer_id,
        period_start: usage.period_start.format(&Rfc3339).ok(),
        period_end: usage.period_end.format(&Rfc3339).ok(),
        endpoints,
    }))
}
