//! Usage ledger
//!
//! Append-only store of consumption events. Rows are inserted once per
//! allowed gated request and never updated or deleted; counts are produced
//! by range queries over `created_at` with half-open bounds. Concurrent
//! writers are expected; each insert stands alone (at-least-once semantics,
//! duplicate counts from retried writes are an accepted tradeoff).

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use avaolo_shared::ResourceType;

use crate::error::BillingResult;

/// One consumption event, stamped with the billing period resolved at
/// record time.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub farmer_id: Uuid,
    pub resource_type: ResourceType,
    pub endpoint: String,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
}

#[derive(Clone)]
pub struct UsageLedger {
    pool: PgPool,
}

impl UsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one event. Side effect only; entitlement is not re-checked.
    pub async fn record(&self, event: &UsageEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_events (
                id, farmer_id, resource_type, endpoint,
                billing_period_start, billing_period_end
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.farmer_id)
        .bind(event.resource_type)
        .bind(&event.endpoint)
        .bind(event.period_start)
        .bind(event.period_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Count events for an account within `[start, end)`.
    pub async fn count(
        &self,
        farmer_id: Uuid,
        resource_type: ResourceType,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)::BIGINT
            FROM usage_events
            WHERE farmer_id = $1
              AND resource_type = $2
              AND created_at >= $3
              AND created_at < $4
            "#,
        )
        .bind(farmer_id)
        .bind(resource_type)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Per-endpoint breakdown for a period (usage dashboard).
    pub async fn breakdown_by_endpoint(
        &self,
        farmer_id: Uuid,
        resource_type: ResourceType,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<Vec<EndpointUsage>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT endpoint, COUNT(*)::BIGINT as event_count
            FROM usage_events
            WHERE farmer_id = $1
              AND resource_type = $2
              AND created_at >= $3
              AND created_at < $4
            GROUP BY endpoint
            ORDER BY event_count DESC
            "#,
        )
        .bind(farmer_id)
        .bind(resource_type)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(endpoint, count)| EndpointUsage { endpoint, count })
            .collect())
    }
}

/// Usage breakdown by endpoint label
#[derive(Debug, Clone, serde::Serialize)]
pub struct EndpointUsage {
    pub endpoint: String,
    pub count: i64,
}
