//! Entitlement evaluation
//!
//! Answers the question asked on every gated request: may this farmer
//! consume this resource right now? `decide()` is THE function that makes
//! the call; it is pure and deterministic so the boundary conditions can be
//! tested without a database.
//!
//! Availability beats strictness here: if limits or usage counts cannot be
//! read, the evaluator fails toward Allow. A billing outage must never block
//! agricultural functionality.

use serde::Serialize;
use time::OffsetDateTime;

use avaolo_shared::{FarmerId, ResourceType, SubscriptionStatus};

use crate::accounts::{AccountStore, FarmerBillingData};
use crate::error::BillingResult;
use crate::ledger::UsageLedger;
use crate::period::{resolve_period, BillingPeriod};
use crate::settings::{BillingSettings, SettingsStore, DEFAULT_TRIAL_DAYS};

/// Overflow pricing surfaced on limit denials so the caller can offer
/// pay-per-overage. Charging for overflow is not done here.
#[derive(Debug, Clone, Serialize)]
pub struct OverflowPricing {
    pub price_eur: f64,
    pub unit: &'static str,
    pub message: String,
}

impl OverflowPricing {
    pub fn from_settings(settings: &BillingSettings, resource: ResourceType) -> Self {
        let price_eur = settings.overflow_price_eur(resource);
        Self {
            price_eur,
            unit: resource.unit_label(),
            message: format!(
                "Additional usage is billed at {:.2} EUR per {}",
                price_eur,
                resource.unit_label()
            ),
        }
    }
}

/// The gate's per-request decision.
#[derive(Debug, Clone)]
pub enum Decision {
    Allow,
    /// No active subscription; carries the payment-initiation URL.
    SubscriptionRequired {
        trial_expired: bool,
        payment_url: String,
    },
    /// Subscription is fine but the period's limit is spent.
    UsageLimitExceeded {
        limit: i64,
        usage: i64,
        period_end: Option<OffsetDateTime>,
        overflow: OverflowPricing,
    },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Current usage against the configured limit, for `X-Usage-*` headers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UsageSnapshot {
    pub limit: i64,
    pub current: i64,
}

impl UsageSnapshot {
    pub fn remaining(&self) -> i64 {
        (self.limit - self.current).max(0)
    }
}

/// Full evaluation result handed to the gate.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// The primary billing account the decision applies to.
    pub farmer_id: FarmerId,
    pub decision: Decision,
    /// Best-effort snapshot; absent when usage or limits could not be read.
    pub usage: Option<UsageSnapshot>,
    pub period: BillingPeriod,
}

/// Payment-initiation URL surfaced in subscription-required denials.
pub fn payment_url(farmer_id: FarmerId) -> String {
    format!("/api/v1/payment/subscribe?farmer_id={}", farmer_id)
}

fn is_entitled(account: &FarmerBillingData, now: OffsetDateTime) -> bool {
    match account.subscription_status {
        SubscriptionStatus::Trial => account
            .trial_end_date
            .map(|end| now < end)
            .unwrap_or(false),
        SubscriptionStatus::Active => account
            .current_period_end
            .map(|end| now < end)
            .unwrap_or(false),
        _ => false,
    }
}

/// Pure decision procedure.
///
/// `usage` and `settings` are `None` when the respective lookup failed;
/// either gap fails open to Allow.
pub fn decide(
    account: &FarmerBillingData,
    resource: ResourceType,
    usage: Option<i64>,
    settings: Option<&BillingSettings>,
    period_end: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Decision {
    if !is_entitled(account, now) {
        let trial_expired = account.subscription_status == SubscriptionStatus::Trial
            && account
                .trial_end_date
                .map(|end| now >= end)
                .unwrap_or(false);
        return Decision::SubscriptionRequired {
            trial_expired,
            payment_url: payment_url(FarmerId(account.farmer_id)),
        };
    }

    let (Some(settings), Some(usage)) = (settings, usage) else {
        return Decision::Allow;
    };

    let limit = settings.limit_for(resource);
    if usage >= limit {
        return Decision::UsageLimitExceeded {
            limit,
            usage,
            period_end,
            overflow: OverflowPricing::from_settings(settings, resource),
        };
    }

    Decision::Allow
}

/// Evaluator service: loads current state and runs `decide`.
///
/// No decision caching; every request re-evaluates from live state.
#[derive(Clone)]
pub struct EntitlementEvaluator {
    accounts: AccountStore,
    ledger: UsageLedger,
    settings: SettingsStore,
}

impl EntitlementEvaluator {
    pub fn new(accounts: AccountStore, ledger: UsageLedger, settings: SettingsStore) -> Self {
        Self {
            accounts,
            ledger,
            settings,
        }
    }

    /// Evaluate one (account, resource) pair against current state.
    ///
    /// Errors surface only for account resolution (the gate passes those
    /// through ungated); configuration and ledger read failures degrade to
    /// Allow with a warning.
    pub async fn evaluate(
        &self,
        farmer_id: FarmerId,
        resource: ResourceType,
    ) -> BillingResult<Evaluation> {
        let account = self.accounts.load(farmer_id).await?;
        let now = OffsetDateTime::now_utc();

        let settings = match self.settings.load().await {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %e, "Billing configuration unavailable; failing open");
                None
            }
        };

        let trial_days = settings
            .as_ref()
            .map(|s| s.trial_days)
            .unwrap_or(DEFAULT_TRIAL_DAYS);
        let period = resolve_period(&account, trial_days, now);

        let usage = match self
            .ledger
            .count(account.farmer_id, resource, period.start, period.end)
            .await
        {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(
                    farmer_id = %account.farmer_id,
                    error = %e,
                    "Usage count unavailable; failing open"
                );
                None
            }
        };

        let decision = decide(
            &account,
            resource,
            usage,
            settings.as_ref(),
            Some(period.end),
            now,
        );

        let snapshot = match (usage, settings.as_ref()) {
            (Some(current), Some(s)) => Some(UsageSnapshot {
                limit: s.limit_for(resource),
                current,
            }),
            _ => None,
        };

        Ok(Evaluation {
            farmer_id: FarmerId(account.farmer_id),
            decision,
            usage: snapshot,
            period,
        })
    }
}
