//! Subscription lifecycle and plan management
//!
//! A `SubscriptionRecord` is the local mirror of one gateway subscription.
//! Lifecycle state is derived from two nullable timestamps instead of a
//! status enum: `ends_at` marks cancellation (future value = grace period),
//! `trial_ends_at` marks the trial window. `SubscriptionService` owns every
//! transition, including the plan-swap algorithm with its unused-period
//! credit.
//!
//! Concurrent `swap`/`cancel` calls against the same row are not coordinated
//! here; embedding applications that need that should serialize per
//! subscription id (a row-level lock or single-writer queue).

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use time::{OffsetDateTime, Time};

use crate::builder::SubscriptionBuilder;
use crate::catalog::{
    format_amount, parse_amount, plan_price_with_tax, same_billing_frequency, PlanCatalog,
};
use crate::customer::{Account, TaxPolicy};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    DiscountInstruction, GatewayPlan, GatewaySubscription, PaymentGateway, SubscriptionChanges,
};
use crate::store::{PgSubscriptionStore, SubscriptionStore};

/// The well-known coupon reserved for transferring unused-period credit onto
/// a replacement subscription.
pub const CREDIT_COUPON_ID: &str = "coupon-universal";

/// Locally persisted mirror of one gateway subscription.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: i64,
    pub account_id: i64,
    /// Subscription slot ("default", "main", ...); an account can hold
    /// several concurrently under different names.
    pub name: String,
    /// Remote subscription id at the gateway.
    pub gateway_id: String,
    /// Remote plan id currently billed.
    pub gateway_plan: String,
    pub quantity: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Active means never cancelled, or cancelled with the grace period
    /// still running.
    pub fn active(&self) -> bool {
        self.ends_at.is_none() || self.on_grace_period()
    }

    /// A subscription is cancelled as soon as `ends_at` is set, even while
    /// the grace period keeps it active.
    pub fn cancelled(&self) -> bool {
        self.ends_at.is_some()
    }

    pub fn on_plan(&self, plan: &str) -> bool {
        self.gateway_plan == plan
    }

    /// Within the trial window. Trial comparison is day-granular: the trial
    /// counts as running until its end date has been reached, measured from
    /// UTC midnight today.
    pub fn on_trial(&self) -> bool {
        match self.trial_ends_at {
            Some(trial_end) => {
                let today = OffsetDateTime::now_utc().replace_time(Time::MIDNIGHT);
                today < trial_end
            }
            None => false,
        }
    }

    /// Cancelled, but the already-paid (or trialed) period has not elapsed.
    pub fn on_grace_period(&self) -> bool {
        match self.ends_at {
            Some(ends_at) => OffsetDateTime::now_utc() < ends_at,
            None => false,
        }
    }
}

/// Grace-period boundary for a cancellation: the trial end while trialing,
/// otherwise the end of the billing period already paid for.
pub fn grace_period_end(
    record: &SubscriptionRecord,
    billing_period_end: Option<OffsetDateTime>,
) -> BillingResult<OffsetDateTime> {
    if record.on_trial() {
        return record.trial_ends_at.ok_or_else(|| {
            BillingError::Gateway("trialing subscription without trial end".into())
        });
    }

    billing_period_end.ok_or_else(|| {
        BillingError::Gateway(format!(
            "subscription '{}' has no billing period end date",
            record.gateway_id
        ))
    })
}

/// Credit for the unused remainder of the current billing cycle, used when
/// swapping across billing frequencies.
///
/// Uses a 360-day year and 30-day months deliberately: the error only shows
/// up for plan changes requested close to the start of a yearly cycle, and
/// the arithmetic stays simple. Any outstanding balance (negative = credit
/// the customer already holds) is netted out.
pub fn credit_for_unused_period(
    current_price: f64,
    billing_frequency: u32,
    remaining_days: i64,
    balance: f64,
) -> f64 {
    let unused_days = remaining_days.clamp(0, 360);
    let value_of_day = current_price / (f64::from(billing_frequency) * 30.0);

    value_of_day * unused_days as f64 - balance
}

/// Subscription lifecycle operations over the local table and the gateway.
#[derive(Clone)]
pub struct SubscriptionService {
    gateway: Arc<dyn PaymentGateway>,
    pool: PgPool,
    catalog: PlanCatalog,
    tax: Arc<dyn TaxPolicy>,
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionService {
    pub fn new(gateway: Arc<dyn PaymentGateway>, pool: PgPool, tax: Arc<dyn TaxPolicy>) -> Self {
        let store = Arc::new(PgSubscriptionStore::new(pool.clone()));
        Self::with_store(gateway, pool, store, tax)
    }

    /// Construct over an explicit record store. The pool is still needed for
    /// customer resolution during replace-swaps.
    pub fn with_store(
        gateway: Arc<dyn PaymentGateway>,
        pool: PgPool,
        store: Arc<dyn SubscriptionStore>,
        tax: Arc<dyn TaxPolicy>,
    ) -> Self {
        let catalog = PlanCatalog::new(gateway.clone());
        Self {
            gateway,
            pool,
            catalog,
            tax,
            store,
        }
    }

    // =========================================================================
    // Local queries
    // =========================================================================

    /// All subscription records for an account, newest first. History is
    /// retained across cancellations and replacements, so cancelled rows
    /// appear here too.
    pub async fn subscriptions(&self, account_id: i64) -> BillingResult<Vec<SubscriptionRecord>> {
        self.store.for_account(account_id).await
    }

    /// The current subscription for a named slot: the most recently created
    /// record, ties broken by highest row id.
    pub async fn subscription(
        &self,
        account_id: i64,
        name: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.current(account_id, name).await
    }

    /// Whether the account holds an active subscription under the given
    /// name, optionally pinned to a specific plan.
    pub async fn subscribed(
        &self,
        account_id: i64,
        name: &str,
        plan: Option<&str>,
    ) -> BillingResult<bool> {
        let record = self.subscription(account_id, name).await?;

        Ok(match record {
            Some(record) => {
                record.active() && plan.map_or(true, |plan| record.on_plan(plan))
            }
            None => false,
        })
    }

    /// Whether any of the account's subscriptions (any name) is on the plan.
    pub async fn on_plan(&self, account_id: i64, plan: &str) -> BillingResult<bool> {
        self.store.any_on_plan(account_id, plan).await
    }

    // =========================================================================
    // Remote lookups
    // =========================================================================

    /// Fetch the record's gateway subscription.
    pub async fn as_gateway_subscription(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<GatewaySubscription> {
        self.gateway
            .find_subscription(&record.gateway_id)
            .await?
            .ok_or_else(|| {
                BillingError::Gateway(format!(
                    "subscription '{}' missing at gateway",
                    record.gateway_id
                ))
            })
    }

    /// Current balance of the gateway subscription; negative values are
    /// credit owed to the customer.
    pub async fn balance(&self, record: &SubscriptionRecord) -> BillingResult<f64> {
        Ok(self.as_gateway_subscription(record).await?.balance)
    }

    /// Days remaining until the next billing date.
    pub async fn remaining_days_before_next_billing(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<i64> {
        let remote = self.as_gateway_subscription(record).await?;
        Ok(remaining_days(&remote))
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Cancel at the end of the covered period.
    ///
    /// Billing stops at the gateway immediately, but `ends_at` is set to the
    /// trial end (while trialing) or the paid billing period's end, so the
    /// record stays active through its grace period. A gateway rejection
    /// leaves local state untouched.
    pub async fn cancel(&self, record: &mut SubscriptionRecord) -> BillingResult<()> {
        let remote = self.as_gateway_subscription(record).await?;

        let result = self.gateway.cancel_subscription(&record.gateway_id).await?;
        if !result.success {
            return Err(BillingError::SubscriptionNotCancelled);
        }

        let ends_at = grace_period_end(record, remote.billing_period_end_date)?;
        self.persist_ends_at(record, ends_at).await?;

        tracing::info!(
            account_id = record.account_id,
            subscription_id = %record.gateway_id,
            ends_at = %ends_at,
            "Cancelled subscription into grace period"
        );

        Ok(())
    }

    /// Cancel with no grace period: `ends_at` is set to now.
    pub async fn cancel_now(&self, record: &mut SubscriptionRecord) -> BillingResult<()> {
        let result = self.gateway.cancel_subscription(&record.gateway_id).await?;
        if !result.success {
            return Err(BillingError::SubscriptionNotCancelled);
        }

        self.mark_as_cancelled(record).await?;

        tracing::info!(
            account_id = record.account_id,
            subscription_id = %record.gateway_id,
            "Cancelled subscription immediately"
        );

        Ok(())
    }

    /// Set `ends_at = now` locally without touching the gateway.
    pub async fn mark_as_cancelled(&self, record: &mut SubscriptionRecord) -> BillingResult<()> {
        self.persist_ends_at(record, OffsetDateTime::now_utc()).await
    }

    /// Resuming a fully-cancelled subscription cannot be expressed against
    /// the gateway; subscribe again (or swap before the grace period ends).
    pub async fn resume(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        let _ = record;
        Err(BillingError::Unsupported(
            "resuming a cancelled subscription".into(),
        ))
    }

    /// Add a coupon to the running subscription. The discount lives at the
    /// gateway; there is no local state to change.
    pub async fn apply_coupon(
        &self,
        record: &SubscriptionRecord,
        coupon: &str,
    ) -> BillingResult<()> {
        let changes = SubscriptionChanges {
            add_discounts: vec![DiscountInstruction {
                inherited_from_id: coupon.to_string(),
                amount: None,
            }],
            ..SubscriptionChanges::default()
        };

        let result = self
            .gateway
            .update_subscription(&record.gateway_id, &changes)
            .await?;

        if !result.success {
            return Err(BillingError::CouponNotApplied);
        }

        tracing::info!(
            subscription_id = %record.gateway_id,
            coupon = coupon,
            "Applied coupon"
        );

        Ok(())
    }

    /// Swap the subscription to another plan.
    ///
    /// Same billing frequency: the existing gateway subscription is updated
    /// in place (prorated by the processor) and the same record comes back.
    /// Different frequency: a replacement subscription is created carrying
    /// the unused-period credit as a discount, the old one is cancelled with
    /// no grace period, and the *new* record is returned; callers must
    /// treat the result as potentially identity-changing.
    pub async fn swap(
        &self,
        account: &mut Account,
        record: &mut SubscriptionRecord,
        plan: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let current_plan = self.catalog.find_plan(&record.gateway_plan).await?;
        let new_plan = self.catalog.find_plan(plan).await?;

        if same_billing_frequency(&current_plan, &new_plan) {
            self.update_plan(account, record, &new_plan).await
        } else {
            self.replace_plan(account, record, &current_plan, &new_plan)
                .await
        }
    }

    /// Same-cycle swap: update the plan on the existing gateway
    /// subscription with proration enabled.
    async fn update_plan(
        &self,
        account: &Account,
        record: &mut SubscriptionRecord,
        new_plan: &GatewayPlan,
    ) -> BillingResult<SubscriptionRecord> {
        let changes = SubscriptionChanges {
            plan_id: Some(new_plan.id.clone()),
            price: Some(plan_price_with_tax(
                new_plan,
                self.tax.tax_percentage(account),
            )),
            prorate_charges: true,
            add_discounts: Vec::new(),
        };

        let result = self
            .gateway
            .update_subscription(&record.gateway_id, &changes)
            .await?;

        if !result.success {
            return Err(BillingError::PlanNotSwapped);
        }

        self.store.set_plan(record.id, &new_plan.id).await?;

        record.gateway_plan = new_plan.id.clone();
        record.updated_at = OffsetDateTime::now_utc();

        tracing::info!(
            account_id = record.account_id,
            subscription_id = %record.gateway_id,
            plan = %new_plan.id,
            "Swapped plan in place"
        );

        Ok(record.clone())
    }

    /// Cross-cycle swap: build a replacement subscription on the new plan
    /// with the unused-period credit attached, then cancel the old one.
    ///
    /// The old subscription is cancelled only after the replacement is
    /// confirmed, so a failure never leaves the account unsubscribed. If the
    /// cancel itself fails, the replacement is still returned and the stale
    /// subscription is left for manual cleanup.
    async fn replace_plan(
        &self,
        account: &mut Account,
        record: &mut SubscriptionRecord,
        current_plan: &GatewayPlan,
        new_plan: &GatewayPlan,
    ) -> BillingResult<SubscriptionRecord> {
        let remote = self.as_gateway_subscription(record).await?;

        let credit = credit_for_unused_period(
            parse_amount(&remote.price),
            current_plan.billing_frequency,
            remaining_days(&remote),
            remote.balance,
        );

        let builder = SubscriptionBuilder::with_store(
            self.gateway.clone(),
            self.pool.clone(),
            self.tax.clone(),
            self.store.clone(),
            &record.name,
            &new_plan.id,
        )
        .with_discount(DiscountInstruction {
            inherited_from_id: CREDIT_COUPON_ID.to_string(),
            amount: Some(format_amount(credit)),
        });

        let replacement = match builder.create(account, None).await {
            Ok(replacement) => replacement,
            Err(error) => {
                tracing::warn!(
                    subscription_id = %record.gateway_id,
                    error = %error,
                    "Replacement subscription failed; old subscription left running"
                );
                return Err(BillingError::PlanNotSwapped);
            }
        };

        // The replacement exists and is billing; a failed cancel of the old
        // subscription must not hide it from the caller.
        if let Err(error) = self.cancel_now(record).await {
            tracing::warn!(
                account_id = record.account_id,
                old_subscription_id = %record.gateway_id,
                new_subscription_id = %replacement.gateway_id,
                error = %error,
                "Replacement created but old subscription was not cancelled; cancel it manually"
            );
            return Ok(replacement);
        }

        tracing::info!(
            account_id = record.account_id,
            old_subscription_id = %record.gateway_id,
            new_subscription_id = %replacement.gateway_id,
            credit = %format_amount(credit),
            "Replaced subscription across billing cycles"
        );

        Ok(replacement)
    }

    async fn persist_ends_at(
        &self,
        record: &mut SubscriptionRecord,
        ends_at: OffsetDateTime,
    ) -> BillingResult<()> {
        self.store.set_ends_at(record.id, ends_at).await?;

        record.ends_at = Some(ends_at);
        record.updated_at = OffsetDateTime::now_utc();

        Ok(())
    }
}

/// Whole days until the remote subscription's next billing date, never
/// negative.
fn remaining_days(remote: &GatewaySubscription) -> i64 {
    match remote.billing_period_end_date {
        Some(end) => (end - OffsetDateTime::now_utc()).whole_days().max(0),
        None => 0,
    }
}
