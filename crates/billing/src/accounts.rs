//! Account resolution for billing decisions
//!
//! Loads the billing-relevant slice of a farmer account and resolves linked
//! sub-accounts to the primary account they bill under. All usage and
//! entitlement checks operate on the primary.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use avaolo_shared::{FarmerId, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};

/// Raw billing data for one farmer account.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FarmerBillingData {
    pub farmer_id: Uuid,
    pub subscription_status: SubscriptionStatus,
    pub trial_end_date: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub linked_to_farmer_id: Option<Uuid>,
}

/// Strip messaging-provider prefixes and whitespace from a phone number.
/// Twilio delivers WhatsApp senders as `whatsapp:+3859...`.
pub fn normalize_phone(raw: &str) -> String {
    raw.trim()
        .strip_prefix("whatsapp:")
        .unwrap_or(raw.trim())
        .trim()
        .to_string()
}

/// Read-only account store for the gate and evaluator.
#[derive(Clone)]
pub struct AccountStore {
    pool: PgPool,
}

impl AccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load billing data for an account, resolved to its primary.
    ///
    /// Linked sub-accounts share the primary's subscription and usage pool,
    /// so the link is followed one hop. Self-links and dangling links fall
    /// back to the account itself.
    pub async fn load(&self, farmer_id: FarmerId) -> BillingResult<FarmerBillingData> {
        let account = self
            .fetch(farmer_id.0)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Farmer {} not found", farmer_id)))?;

        let Some(primary_id) = account.linked_to_farmer_id else {
            return Ok(account);
        };

        if primary_id == account.farmer_id {
            tracing::warn!(farmer_id = %farmer_id, "Account links to itself; using own billing data");
            return Ok(account);
        }

        match self.fetch(primary_id).await? {
            Some(primary) => Ok(primary),
            None => {
                tracing::warn!(
                    farmer_id = %farmer_id,
                    primary_id = %primary_id,
                    "Linked primary account missing; using own billing data"
                );
                Ok(account)
            }
        }
    }

    async fn fetch(&self, id: Uuid) -> BillingResult<Option<FarmerBillingData>> {
        let row: Option<FarmerBillingData> = sqlx::query_as(
            r#"
            SELECT
                id as farmer_id,
                subscription_status,
                trial_end_date,
                current_period_end,
                stripe_customer_id,
                stripe_subscription_id,
                linked_to_farmer_id
            FROM farmers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Look up a farmer by WhatsApp phone number.
    pub async fn find_by_phone(&self, raw_phone: &str) -> BillingResult<Option<FarmerId>> {
        let phone = normalize_phone(raw_phone);
        if phone.is_empty() {
            return Ok(None);
        }

        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM farmers WHERE wa_phone_number = $1")
                .bind(&phone)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| FarmerId(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone_strips_whatsapp_prefix() {
        assert_eq!(normalize_phone("whatsapp:+385911234567"), "+385911234567");
        assert_eq!(normalize_phone("+385911234567"), "+385911234567");
        assert_eq!(normalize_phone("  whatsapp:+385911234567  "), "+385911234567");
    }

    #[test]
    fn test_normalize_phone_empty() {
        assert_eq!(normalize_phone("   "), "");
        assert_eq!(normalize_phone("whatsapp:"), "");
    }
}
