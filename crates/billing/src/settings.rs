//! Runtime billing configuration
//!
//! Limits and pricing live in the `billing_config` table and are read live
//! on every entitlement decision, so admin changes propagate immediately.
//! Every mutation writes exactly one audit row in the same transaction.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use avaolo_shared::ResourceType;

use crate::error::{BillingError, BillingResult};

/// Default trial length, also used when configuration cannot be read.
pub const DEFAULT_TRIAL_DAYS: i64 = 7;

/// The set of keys the store accepts. Updates to anything else are rejected
/// so the audit log stays meaningful.
pub const CONFIG_KEYS: [&str; 6] = [
    "monthly_price_cents",
    "trial_days",
    "api_call_limit",
    "whatsapp_message_limit",
    "overflow_api_price_cents",
    "overflow_message_price_cents",
];

/// Typed view of the billing configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BillingSettings {
    pub monthly_price_cents: i64,
    pub trial_days: i64,
    pub api_call_limit: i64,
    pub whatsapp_message_limit: i64,
    pub overflow_api_price_cents: i64,
    pub overflow_message_price_cents: i64,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            monthly_price_cents: 1000,
            trial_days: DEFAULT_TRIAL_DAYS,
            api_call_limit: 1000,
            whatsapp_message_limit: 300,
            overflow_api_price_cents: 2,
            overflow_message_price_cents: 5,
        }
    }
}

impl BillingSettings {
    /// Monthly limit for a resource type.
    pub fn limit_for(&self, resource: ResourceType) -> i64 {
        match resource {
            ResourceType::ApiCall => self.api_call_limit,
            ResourceType::WhatsappMessage => self.whatsapp_message_limit,
        }
    }

    /// Overflow unit price in cents for a resource type.
    pub fn overflow_price_cents_for(&self, resource: ResourceType) -> i64 {
        match resource {
            ResourceType::ApiCall => self.overflow_api_price_cents,
            ResourceType::WhatsappMessage => self.overflow_message_price_cents,
        }
    }

    /// Overflow unit price in euros.
    pub fn overflow_price_eur(&self, resource: ResourceType) -> f64 {
        self.overflow_price_cents_for(resource) as f64 / 100.0
    }

    /// Apply one key/value pair from the store. Unparseable values keep the
    /// default and log a warning rather than failing the decision path.
    fn apply(&mut self, key: &str, value: &str) {
        let Ok(parsed) = value.parse::<i64>() else {
            tracing::warn!(key = %key, value = %value, "Ignoring non-numeric billing_config value");
            return;
        };
        match key {
            "monthly_price_cents" => self.monthly_price_cents = parsed,
            "trial_days" => self.trial_days = parsed,
            "api_call_limit" => self.api_call_limit = parsed,
            "whatsapp_message_limit" => self.whatsapp_message_limit = parsed,
            "overflow_api_price_cents" => self.overflow_api_price_cents = parsed,
            "overflow_message_price_cents" => self.overflow_message_price_cents = parsed,
            other => {
                tracing::warn!(key = %other, "Unknown billing_config key; ignoring");
            }
        }
    }

    /// Build settings from raw store rows, defaults filling the gaps.
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut settings = Self::default();
        for (key, value) in rows {
            settings.apply(key, value);
        }
        settings
    }
}

/// One configuration change, as recorded in the audit log.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ConfigAuditEntry {
    pub id: Uuid,
    pub config_key: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub actor: String,
    pub changed_at: OffsetDateTime,
}

/// Store for runtime billing configuration.
#[derive(Clone)]
pub struct SettingsStore {
    pool: PgPool,
}

impl SettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load the full configuration. Missing keys fall back to defaults.
    pub async fn load(&self) -> BillingResult<BillingSettings> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM billing_config")
                .fetch_all(&self.pool)
                .await?;

        Ok(BillingSettings::from_rows(
            rows.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ))
    }

    /// Update one key, writing the audit row in the same transaction.
    pub async fn update(&self, key: &str, value: &str, actor: &str) -> BillingResult<()> {
        if !CONFIG_KEYS.contains(&key) {
            return Err(BillingError::InvalidInput(format!(
                "Unknown configuration key: {}",
                key
            )));
        }
        if value.parse::<i64>().is_err() {
            return Err(BillingError::InvalidInput(format!(
                "Configuration value must be an integer, got: {}",
                value
            )));
        }

        let mut tx = self.pool.begin().await?;

        let old: Option<(String,)> =
            sqlx::query_as("SELECT value FROM billing_config WHERE key = $1")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO billing_config (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO config_audit_log (id, config_key, old_value, new_value, actor)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(old.map(|(v,)| v))
        .bind(value)
        .bind(actor)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(key = %key, value = %value, actor = %actor, "Billing configuration updated");
        Ok(())
    }

    /// Audit trail for one key, newest first.
    pub async fn history(&self, key: &str) -> BillingResult<Vec<ConfigAuditEntry>> {
        let entries: Vec<ConfigAuditEntry> = sqlx::query_as(
            r#"
            SELECT id, config_key, old_value, new_value, actor, changed_at
            FROM config_audit_log
            WHERE config_key = $1
            ORDER BY changed_at DESC
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}
