//! Common types used across AVA OLO

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Farmer (billable account) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FarmerId(pub Uuid);

impl std::fmt::Display for FarmerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription status for a farmer account.
///
/// Written only by the subscription lifecycle tracker (Stripe webhooks) or
/// explicit admin action. The request gate reads it, never writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Inactive,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Trial
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::Inactive => "inactive",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" | "trialing" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "unpaid" => Ok(Self::Unpaid),
            "inactive" => Ok(Self::Inactive),
            other => Err(format!("unknown subscription status: {}", other)),
        }
    }
}

/// Category of billed consumption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    ApiCall,
    WhatsappMessage,
}

impl ResourceType {
    /// Human-readable unit label used in overflow pricing payloads
    pub fn unit_label(&self) -> &'static str {
        match self {
            Self::ApiCall => "API call",
            Self::WhatsappMessage => "WhatsApp message",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiCall => write!(f, "api_call"),
            Self::WhatsappMessage => write!(f, "whatsapp_message"),
        }
    }
}
