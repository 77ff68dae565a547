//! Stripe Checkout sessions
//!
//! Backs the payment-initiation URL surfaced in subscription-required
//! denials. One flat monthly subscription priced from `billing_config`.

use std::collections::HashMap;
use std::str::FromStr;

use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionLineItemsPriceDataRecurring,
    CreateCheckoutSessionLineItemsPriceDataRecurringInterval,
    CreateCheckoutSessionSubscriptionData, Currency, CustomerId,
};

use avaolo_shared::FarmerId;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::settings::SettingsStore;

/// Checkout service for creating Stripe checkout sessions
#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
    settings: SettingsStore,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool, settings: SettingsStore) -> Self {
        Self {
            stripe,
            pool,
            settings,
        }
    }

    /// Create a subscription checkout session for a farmer.
    ///
    /// Price and trial length come from the live configuration so admin
    /// changes apply to the next checkout without a deploy.
    pub async fn create_subscription_checkout(
        &self,
        farmer_id: FarmerId,
    ) -> BillingResult<CheckoutSession> {
        let row: Option<(Option<String>, Option<String>)> =
            sqlx::query_as("SELECT stripe_customer_id, email FROM farmers WHERE id = $1")
                .bind(farmer_id.0)
                .fetch_optional(&self.pool)
                .await?;

        let (customer_id, email) =
            row.ok_or_else(|| BillingError::NotFound(format!("Farmer {} not found", farmer_id)))?;

        let settings = self.settings.load().await?;

        let base_url = &self.stripe.config().app_base_url;
        let success_url = format!(
            "{}/subscription?payment=success&session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/subscription?payment=cancelled", base_url);

        let mut metadata = HashMap::new();
        metadata.insert("farmer_id".to_string(), farmer_id.to_string());

        let line_items = vec![CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency: Currency::EUR,
                unit_amount: Some(settings.monthly_price_cents),
                recurring: Some(CreateCheckoutSessionLineItemsPriceDataRecurring {
                    interval: CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Month,
                    interval_count: None,
                }),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: "AVA OLO monthly subscription".to_string(),
                    description: Some(
                        "Agronomic advisory, weather and WhatsApp assistant".to_string(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        }];

        let trial_days = u32::try_from(settings.trial_days).ok().filter(|d| *d > 0);

        let mut params = CreateCheckoutSession {
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(line_items),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata.clone()),
            subscription_data: Some(CreateCheckoutSessionSubscriptionData {
                trial_period_days: trial_days,
                metadata: Some(metadata),
                ..Default::default()
            }),
            ..Default::default()
        };

        match customer_id {
            Some(ref cid) => {
                params.customer = Some(
                    CustomerId::from_str(cid)
                        .map_err(|_| BillingError::InvalidInput(format!("Bad customer id: {}", cid)))?,
                );
            }
            None => {
                params.customer_email = email.as_deref();
            }
        }

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            farmer_id = %farmer_id,
            session_id = %session.id,
            "Created subscription checkout session"
        );

        Ok(session)
    }
}
