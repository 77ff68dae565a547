//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use avaolo_billing::OverflowPricing;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Authentication
    #[error("Authentication required")]
    Unauthorized,

    // Resource errors
    #[error("Resource not found")]
    NotFound,

    // Billing denials (structured payloads per the gated-request contract)
    #[error("Subscription required")]
    SubscriptionRequired {
        message: String,
        payment_url: String,
        trial_expired: bool,
    },
    #[error("Usage limit exceeded")]
    UsageLimitExceeded {
        message: String,
        limit: i64,
        usage: i64,
        period_end: Option<String>,
        overflow: OverflowPricing,
    },

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            // The two billing denials use the flat wire shape callers and
            // the WhatsApp relay already parse.
            ApiError::SubscriptionRequired {
                message,
                payment_url,
                trial_expired,
            } => {
                let body = Json(json!({
                    "error": "subscription_required",
                    "message": message,
                    "payment_url": payment_url,
                    "trial_expired": trial_expired,
                }));
                (StatusCode::PAYMENT_REQUIRED, body).into_response()
            }
            ApiError::UsageLimitExceeded {
                message,
                limit,
                usage,
                period_end,
                overflow,
            } => {
                let body = Json(json!({
                    "error": "usage_limit_exceeded",
                    "message": message,
                    "limit": limit,
                    "usage": usage,
                    "period_end": period_end,
                    "overflow_pricing": {
                        "price_eur": overflow.price_eur,
                        "unit": overflow.unit,
                        "message": overflow.message,
                    },
                }));
                (StatusCode::TOO_MANY_REQUESTS, body).into_response()
            }

            other => {
                let (status, code, message) = match &other {
                    ApiError::BadRequest(msg) => {
                        (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone())
                    }
                    ApiError::Unauthorized => {
                        (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", other.to_string())
                    }
                    ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", other.to_string()),
                    ApiError::Database(_) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "DATABASE_ERROR",
                        "Database error".to_string(),
                    ),
                    // Billing variants handled above
                    _ => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "Internal server error".to_string(),
                    ),
                };

                let body = Json(json!({
                    "error": {
                        "code": code,
                        "message": message,
                    }
                }));
                (status, body).into_response()
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<avaolo_billing::BillingError> for ApiError {
    fn from(err: avaolo_billing::BillingError) -> Self {
        use avaolo_billing::BillingError;
        match err {
            BillingError::NotFound(_) => ApiError::NotFound,
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            other => {
                tracing::error!("Billing error: {}", other);
                ApiError::Database(other.to_string())
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
