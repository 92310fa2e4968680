//! Local persistence for subscription records
//!
//! [`SubscriptionStore`] is the seam between the lifecycle logic and the
//! database: the builder and `SubscriptionService` talk to the store, and
//! [`PgSubscriptionStore`] carries the actual SQL. Tests drive the lifecycle
//! against an in-memory store.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionRecord;

/// Column values for a freshly created subscription row. Quantity starts at
/// 1 and `ends_at` at NULL; the database assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewSubscriptionRecord {
    pub account_id: i64,
    pub name: String,
    pub gateway_id: String,
    pub gateway_plan: String,
    pub trial_ends_at: Option<OffsetDateTime>,
}

/// Persistence operations over the `subscriptions` table.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert(&self, new: NewSubscriptionRecord) -> BillingResult<SubscriptionRecord>;

    /// All records for an account, newest first.
    async fn for_account(&self, account_id: i64) -> BillingResult<Vec<SubscriptionRecord>>;

    /// The current record for a named slot: most recently created, ties
    /// broken by highest row id.
    async fn current(
        &self,
        account_id: i64,
        name: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn any_on_plan(&self, account_id: i64, plan: &str) -> BillingResult<bool>;

    async fn set_plan(&self, id: i64, plan: &str) -> BillingResult<()>;

    async fn set_ends_at(&self, id: i64, ends_at: OffsetDateTime) -> BillingResult<()>;
}

/// Postgres-backed [`SubscriptionStore`].
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn insert(&self, new: NewSubscriptionRecord) -> BillingResult<SubscriptionRecord> {
        let record: SubscriptionRecord = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (account_id, name, gateway_id, gateway_plan, quantity, trial_ends_at, ends_at)
            VALUES ($1, $2, $3, $4, 1, $5, NULL)
            RETURNING id, account_id, name, gateway_id, gateway_plan, quantity,
                      trial_ends_at, ends_at, created_at, updated_at
            "#,
        )
        .bind(new.account_id)
        .bind(&new.name)
        .bind(&new.gateway_id)
        .bind(&new.gateway_plan)
        .bind(new.trial_ends_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(record)
    }

    async fn for_account(&self, account_id: i64) -> BillingResult<Vec<SubscriptionRecord>> {
        let records: Vec<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT id, account_id, name, gateway_id, gateway_plan, quantity,
                   trial_ends_at, ends_at, created_at, updated_at
            FROM subscriptions
            WHERE account_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(records)
    }

    async fn current(
        &self,
        account_id: i64,
        name: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT id, account_id, name, gateway_id, gateway_plan, quantity,
                   trial_ends_at, ends_at, created_at, updated_at
            FROM subscriptions
            WHERE account_id = $1 AND name = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(record)
    }

    async fn any_on_plan(&self, account_id: i64, plan: &str) -> BillingResult<bool> {
        let found: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM subscriptions WHERE account_id = $1 AND gateway_plan = $2 LIMIT 1",
        )
        .bind(account_id)
        .bind(plan)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(found.is_some())
    }

    async fn set_plan(&self, id: i64, plan: &str) -> BillingResult<()> {
        sqlx::query("UPDATE subscriptions SET gateway_plan = $1, updated_at = NOW() WHERE id = $2")
            .bind(plan)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(())
    }

    async fn set_ends_at(&self, id: i64, ends_at: OffsetDateTime) -> BillingResult<()> {
        sqlx::query("UPDATE subscriptions SET ends_at = $1, updated_at = NOW() WHERE id = $2")
            .bind(ends_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(())
    }
}
