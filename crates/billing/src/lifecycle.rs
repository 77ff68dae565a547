//! Subscription lifecycle tracker
//!
//! Consumes Stripe webhook events and applies subscription state onto
//! farmer accounts. This is the only code path that writes
//! `subscription_status`, `stripe_subscription_id` and `current_period_end`;
//! the request gate reads them.
//!
//! Signatures are verified manually with HMAC-SHA256 over `"{t}.{payload}"`
//! (async-stripe's built-in verifier is pinned to a different API version).

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use time::OffsetDateTime;

use avaolo_shared::SubscriptionStatus;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock skew between the webhook timestamp and now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct SubscriptionLifecycle {
    pool: PgPool,
    webhook_secret: String,
}

impl SubscriptionLifecycle {
    pub fn new(pool: PgPool, webhook_secret: String) -> Self {
        Self {
            pool,
            webhook_secret,
        }
    }

    /// Verify the `stripe-signature` header and parse the event payload.
    pub fn verify_event(&self, payload: &str, sig_header: &str) -> BillingResult<stripe::Event> {
        self.verify_signature(payload, sig_header, OffsetDateTime::now_utc().unix_timestamp())?;
        serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidInput(format!("Malformed webhook payload: {}", e)))
    }

    /// Constant-time signature check. Header format: `t=<ts>,v1=<hex>[,v1=...]`.
    fn verify_signature(
        &self,
        payload: &str,
        sig_header: &str,
        now_ts: i64,
    ) -> BillingResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<&str> = Vec::new();

        for part in sig_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", ts)) => timestamp = ts.parse().ok(),
                Some(("v1", sig)) => signatures.push(sig),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        if signatures.is_empty() {
            return Err(BillingError::WebhookSignatureInvalid);
        }
        if (now_ts - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        for candidate in signatures {
            let Ok(expected) = hex::decode(candidate) else {
                continue;
            };
            let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
                .map_err(|_| BillingError::WebhookSignatureInvalid)?;
            mac.update(signed_payload.as_bytes());
            if mac.verify_slice(&expected).is_ok() {
                return Ok(());
            }
        }

        Err(BillingError::WebhookSignatureInvalid)
    }

    /// Dispatch a verified event. Unsupported types are acknowledged and
    /// skipped so Stripe does not retry them forever.
    pub async fn handle_event(&self, event: stripe::Event) -> BillingResult<()> {
        match event.type_ {
            stripe::EventType::CustomerSubscriptionCreated
            | stripe::EventType::CustomerSubscriptionUpdated
            | stripe::EventType::CustomerSubscriptionDeleted => {
                if let stripe::EventObject::Subscription(subscription) = event.data.object {
                    self.apply_subscription(&subscription).await
                } else {
                    Err(BillingError::InvalidInput(
                        "Subscription event without subscription object".to_string(),
                    ))
                }
            }
            stripe::EventType::InvoicePaymentFailed => {
                if let stripe::EventObject::Invoice(invoice) = event.data.object {
                    self.mark_past_due(&invoice).await
                } else {
                    Err(BillingError::InvalidInput(
                        "Invoice event without invoice object".to_string(),
                    ))
                }
            }
            other => {
                tracing::debug!(event_type = %other, "Ignoring unsupported webhook event type");
                Ok(())
            }
        }
    }

    /// Write subscription status and period onto the owning farmer row.
    async fn apply_subscription(&self, subscription: &stripe::Subscription) -> BillingResult<()> {
        let customer_id = subscription.customer.id();
        let status = map_stripe_status(subscription.status);
        let period_end =
            OffsetDateTime::from_unix_timestamp(subscription.current_period_end).ok();
        let trial_end = subscription
            .trial_end
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

        let result = sqlx::query(
            r#"
            UPDATE farmers
            SET subscription_status = $1,
                stripe_subscription_id = $2,
                current_period_end = $3,
                trial_end_date = COALESCE($4, trial_end_date),
                updated_at = NOW()
            WHERE stripe_customer_id = $5
            "#,
        )
        .bind(status)
        .bind(subscription.id.as_str())
        .bind(period_end)
        .bind(trial_end)
        .bind(customer_id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                customer_id = %customer_id,
                subscription_id = %subscription.id,
                "Subscription event for unknown Stripe customer"
            );
        } else {
            tracing::info!(
                customer_id = %customer_id,
                status = %status,
                "Applied subscription state from webhook"
            );
        }
        Ok(())
    }

    async fn mark_past_due(&self, invoice: &stripe::Invoice) -> BillingResult<()> {
        let Some(customer) = invoice.customer.as_ref() else {
            tracing::warn!(invoice_id = %invoice.id, "Payment-failed invoice without customer");
            return Ok(());
        };
        let customer_id = customer.id();

        let result = sqlx::query(
            r#"
            UPDATE farmers
            SET subscription_status = $1, updated_at = NOW()
            WHERE stripe_customer_id = $2
            "#,
        )
        .bind(SubscriptionStatus::PastDue)
        .bind(customer_id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(customer_id = %customer_id, "Marked account past_due after failed payment");
        }
        Ok(())
    }
}

/// Map Stripe subscription statuses onto the platform's six states.
pub fn map_stripe_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    match status {
        stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
        stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trial,
        stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
        stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
        stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
        stripe::SubscriptionStatus::Incomplete
        | stripe::SubscriptionStatus::IncompleteExpired
        | stripe::SubscriptionStatus::Paused => SubscriptionStatus::Inactive,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn lifecycle(secret: &str) -> SubscriptionLifecycle {
        // Pool is lazy; no connection is made by signature tests.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        SubscriptionLifecycle::new(pool, secret.to_string())
    }

    fn sign(secret: &str, timestamp: i64, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[tokio::test]
    async fn test_valid_signature_accepted() {
        let lc = lifecycle("whsec_test");
        let payload = r#"{"id":"evt_1"}"#;
        let ts = 1_700_000_000;
        let header = format!("t={},v1={}", ts, sign("whsec_test", ts, payload));
        assert!(lc.verify_signature(payload, &header, ts + 10).is_ok());
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let lc = lifecycle("whsec_test");
        let payload = r#"{"id":"evt_1"}"#;
        let ts = 1_700_000_000;
        let header = format!("t={},v1={}", ts, sign("whsec_other", ts, payload));
        assert!(lc.verify_signature(payload, &header, ts + 10).is_err());
    }

    #[tokio::test]
    async fn test_stale_timestamp_rejected() {
        let lc = lifecycle("whsec_test");
        let payload = r#"{"id":"evt_1"}"#;
        let ts = 1_700_000_000;
        let header = format!("t={},v1={}", ts, sign("whsec_test", ts, payload));
        assert!(lc
            .verify_signature(payload, &header, ts + SIGNATURE_TOLERANCE_SECS + 1)
            .is_err());
    }

    #[tokio::test]
    async fn test_malformed_header_rejected() {
        let lc = lifecycle("whsec_test");
        assert!(lc.verify_signature("{}", "garbage", 0).is_err());
        assert!(lc.verify_signature("{}", "t=123", 123).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            map_stripe_status(stripe::SubscriptionStatus::Trialing),
            SubscriptionStatus::Trial
        );
        assert_eq!(
            map_stripe_status(stripe::SubscriptionStatus::PastDue),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            map_stripe_status(stripe::SubscriptionStatus::IncompleteExpired),
            SubscriptionStatus::Inactive
        );
    }
}
