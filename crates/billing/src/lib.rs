//! AVA OLO Billing
//!
//! Subscription usage gating core: billing period resolution, the
//! append-only usage ledger, entitlement evaluation, runtime configuration
//! with an audit trail, and the Stripe-driven subscription lifecycle.

pub mod accounts;
pub mod checkout;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod period;
pub mod settings;

pub use accounts::{AccountStore, FarmerBillingData};
pub use checkout::CheckoutService;
pub use client::{StripeClient, StripeConfig};
pub use entitlement::{Decision, EntitlementEvaluator, Evaluation, OverflowPricing, UsageSnapshot};
pub use error::{BillingError, BillingResult};
pub use ledger::{EndpointUsage, UsageEvent, UsageLedger};
pub use lifecycle::SubscriptionLifecycle;
pub use period::{resolve_period, BillingPeriod};
pub use settings::{BillingSettings, ConfigAuditEntry, SettingsStore, DEFAULT_TRIAL_DAYS};

use sqlx::PgPool;
use time::OffsetDateTime;

use avaolo_shared::{FarmerId, ResourceType};

/// Usage for the current billing period, as reported to callers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeriodUsage {
    pub farmer_id: FarmerId,
    pub resource_type: ResourceType,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
}

/// Facade bundling the billing services behind one handle.
///
/// Constructed once at process start and injected into application state;
/// nothing here is a module-level singleton.
#[derive(Clone)]
pub struct BillingService {
    pub accounts: AccountStore,
    pub ledger: UsageLedger,
    pub settings: SettingsStore,
    pub entitlement: EntitlementEvaluator,
    pub lifecycle: SubscriptionLifecycle,
    pub checkout: CheckoutService,
}

impl BillingService {
    pub fn new(pool: PgPool, stripe_config: StripeConfig) -> Self {
        let accounts = AccountStore::new(pool.clone());
        let ledger = UsageLedger::new(pool.clone());
        let settings = SettingsStore::new(pool.clone());
        let entitlement =
            EntitlementEvaluator::new(accounts.clone(), ledger.clone(), settings.clone());
        let lifecycle =
            SubscriptionLifecycle::new(pool.clone(), stripe_config.webhook_secret.clone());
        let stripe = StripeClient::new(stripe_config);
        let checkout = CheckoutService::new(stripe, pool, settings.clone());

        Self {
            accounts,
            ledger,
            settings,
            entitlement,
            lifecycle,
            checkout,
        }
    }

    /// Record one consumption event against the caller's primary account,
    /// stamped with the period resolved now.
    pub async fn record_usage(
        &self,
        farmer_id: FarmerId,
        resource_type: ResourceType,
        endpoint: &str,
    ) -> BillingResult<()> {
        let account = self.accounts.load(farmer_id).await?;
        let trial_days = match self.settings.load().await {
            Ok(s) => s.trial_days,
            Err(_) => DEFAULT_TRIAL_DAYS,
        };
        let period = resolve_period(&account, trial_days, OffsetDateTime::now_utc());

        self.ledger
            .record(&UsageEvent {
                farmer_id: account.farmer_id,
                resource_type,
                endpoint: endpoint.to_string(),
                period_start: period.start,
                period_end: period.end,
            })
            .await
    }

    /// Current-period usage for an account and resource type.
    pub async fn current_usage(
        &self,
        farmer_id: FarmerId,
        resource_type: ResourceType,
    ) -> BillingResult<PeriodUsage> {
        let account = self.accounts.load(farmer_id).await?;
        let settings = self.settings.load().await?;
        let period = resolve_period(&account, settings.trial_days, OffsetDateTime::now_utc());
        let used = self
            .ledger
            .count(account.farmer_id, resource_type, period.start, period.end)
            .await?;
        let limit = settings.limit_for(resource_type);

        Ok(PeriodUsage {
            farmer_id: FarmerId(account.farmer_id),
            resource_type,
            period_start: period.start,
            period_end: period.end,
            used,
            limit,
            remaining: (limit - used).max(0),
        })
    }
}
