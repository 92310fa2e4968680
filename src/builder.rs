//! Subscription builder
//!
//! Fluent configuration for creating one gateway subscription plus its local
//! mirror row. The builder is consumed by each fluent call and by `create`,
//! so a configured builder can't be accidentally reused after the remote
//! call went out.

use std::sync::Arc;

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use crate::catalog::{format_amount, parse_amount, plan_price_with_tax, PlanCatalog};
use crate::customer::{Account, CustomerService, TaxPolicy};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{DiscountInstruction, GatewayCustomer, NewSubscription, PaymentGateway};
use crate::store::{NewSubscriptionRecord, PgSubscriptionStore, SubscriptionStore};
use crate::subscriptions::SubscriptionRecord;

/// Builds one subscription for an account: a named slot, a target plan, and
/// optionally a trial length, a coupon, and extra discount lines (the
/// replace-swap path injects its credit through the latter).
pub struct SubscriptionBuilder {
    gateway: Arc<dyn PaymentGateway>,
    pool: PgPool,
    tax: Arc<dyn TaxPolicy>,
    store: Arc<dyn SubscriptionStore>,
    name: String,
    plan: String,
    trial_days: Option<u32>,
    coupon: Option<String>,
    coupon_percentage: bool,
    extra_discounts: Vec<DiscountInstruction>,
}

impl SubscriptionBuilder {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        pool: PgPool,
        tax: Arc<dyn TaxPolicy>,
        name: &str,
        plan: &str,
    ) -> Self {
        let store = Arc::new(PgSubscriptionStore::new(pool.clone()));
        Self::with_store(gateway, pool, tax, store, name, plan)
    }

    /// Construct over an explicit record store. The pool still backs the
    /// customer-side writes during customer resolution.
    pub fn with_store(
        gateway: Arc<dyn PaymentGateway>,
        pool: PgPool,
        tax: Arc<dyn TaxPolicy>,
        store: Arc<dyn SubscriptionStore>,
        name: &str,
        plan: &str,
    ) -> Self {
        Self {
            gateway,
            pool,
            tax,
            store,
            name: name.to_string(),
            plan: plan.to_string(),
            trial_days: None,
            coupon: None,
            coupon_percentage: false,
            extra_discounts: Vec::new(),
        }
    }

    /// Grant a trial of the given number of days before the first charge.
    pub fn trial_days(mut self, days: u32) -> Self {
        self.trial_days = Some(days);
        self
    }

    /// Apply a coupon to the subscription's charges. `percentage` decides
    /// whether the coupon's amount is a percentage of the (tax-adjusted)
    /// price or a flat value.
    pub fn with_coupon(mut self, coupon: &str, percentage: bool) -> Self {
        self.coupon = Some(coupon.to_string());
        self.coupon_percentage = percentage;
        self
    }

    /// Attach an explicit discount line, e.g. the unused-period credit when
    /// replacing a subscription across billing cycles.
    pub fn with_discount(mut self, discount: DiscountInstruction) -> Self {
        self.extra_discounts.push(discount);
        self
    }

    /// Create the subscription at the gateway and persist the local record.
    ///
    /// No local row is written unless the gateway confirmed the create; a
    /// processor rejection surfaces as
    /// [`BillingError::SubscriptionNotCreated`].
    pub async fn create(
        self,
        account: &mut Account,
        nonce: Option<&str>,
    ) -> BillingResult<SubscriptionRecord> {
        let customer = self.resolve_customer(account, nonce).await?;

        let token = customer
            .default_payment_method()
            .map(|pm| pm.token.clone())
            .ok_or_else(|| {
                BillingError::SubscriptionNotCreated("customer has no payment method".into())
            })?;

        let catalog = PlanCatalog::new(self.gateway.clone());
        let plan = catalog.find_plan(&self.plan).await?;
        let price = plan_price_with_tax(&plan, self.tax.tax_percentage(account));

        let mut discounts = self.extra_discounts.clone();
        if let Some(coupon_id) = &self.coupon {
            let coupon = catalog.find_coupon(coupon_id).await?;
            let amount = coupon_discount_amount(
                coupon.amount,
                self.coupon_percentage,
                parse_amount(&price),
            );
            discounts.push(DiscountInstruction {
                inherited_from_id: coupon.id,
                amount: Some(format_amount(amount)),
            });
        }

        let trial_days = self.trial_days.unwrap_or(0);
        let request = NewSubscription {
            payment_method_token: token,
            plan_id: plan.id.clone(),
            price: Some(price),
            trial_duration: trial_days,
            trial_duration_unit: "day".to_string(),
            trial_period: trial_days > 0,
            discounts,
        };

        let result = self.gateway.create_subscription(&request).await?;
        if !result.success {
            return Err(BillingError::SubscriptionNotCreated(
                result.message_or("gateway rejected the subscription"),
            ));
        }
        let remote = result.record.ok_or_else(|| {
            BillingError::Gateway("subscription create succeeded without a subscription".into())
        })?;

        let trial_ends_at = (trial_days > 0)
            .then(|| OffsetDateTime::now_utc() + Duration::days(i64::from(trial_days)));

        let record = self
            .store
            .insert(NewSubscriptionRecord {
                account_id: account.id,
                name: self.name.clone(),
                gateway_id: remote.id.clone(),
                gateway_plan: plan.id.clone(),
                trial_ends_at,
            })
            .await?;

        tracing::info!(
            account_id = account.id,
            subscription_id = %remote.id,
            plan = %plan.id,
            name = %self.name,
            trial_days,
            "Created subscription"
        );

        Ok(record)
    }

    /// Resolve the gateway customer: create it when the account has none,
    /// otherwise fetch it (refreshing the default card when a new nonce was
    /// supplied).
    async fn resolve_customer(
        &self,
        account: &mut Account,
        nonce: Option<&str>,
    ) -> BillingResult<GatewayCustomer> {
        let customers = CustomerService::new(self.gateway.clone(), self.pool.clone());

        if !account.has_gateway_customer() {
            return customers
                .create_as_gateway_customer(account, nonce)
                .await?
                .ok_or_else(|| {
                    BillingError::SubscriptionNotCreated("customer was not created".into())
                });
        }

        if let Some(nonce) = nonce {
            customers.update_card(account, nonce).await?;
        }

        customers.as_gateway_customer(account).await
    }
}

/// Discount amount for a coupon: flat value, or a percentage of the
/// tax-adjusted price.
pub fn coupon_discount_amount(coupon_amount: f64, percentage: bool, taxed_price: f64) -> f64 {
    if percentage {
        (coupon_amount / 100.0) * taxed_price
    } else {
        coupon_amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::customer::NoTax;
    use crate::test_support::{account, lazy_pool, FakeGateway};

    fn builder(gateway: FakeGateway, plan: &str) -> SubscriptionBuilder {
        SubscriptionBuilder::new(
            Arc::new(gateway),
            lazy_pool(),
            Arc::new(NoTax),
            "default",
            plan,
        )
    }

    // =========================================================================
    // Coupon amounts
    // =========================================================================

    #[test]
    fn test_value_coupon_is_taken_verbatim() {
        let amount = coupon_discount_amount(5.0, false, 10.0);
        assert!((amount - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentage_coupon_scales_taxed_price() {
        // 5% of 10.00 is 0.50.
        let amount = coupon_discount_amount(5.0, true, 10.0);
        assert!((amount - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_percentage_coupon_uses_taxed_base() {
        // 10% of a 12.00 tax-adjusted price, not of the 10.00 plan price.
        let amount = coupon_discount_amount(10.0, true, 12.0);
        assert!((amount - 1.2).abs() < 1e-9);
    }

    // =========================================================================
    // Builder flow (paths that stop before local persistence)
    // =========================================================================

    #[tokio::test]
    async fn test_create_fails_for_unknown_plan() {
        let gateway = FakeGateway::new();
        gateway.add_customer_with_card("cus-1", "tok-1", "Visa", "4242");

        let mut acct = account();
        acct.gateway_customer_id = Some("cus-1".to_string());

        let err = builder(gateway, "monthly-10")
            .create(&mut acct, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PlanNotFound(id) if id == "monthly-10"));
    }

    #[tokio::test]
    async fn test_create_fails_for_unknown_coupon() {
        let gateway = FakeGateway::new();
        gateway.add_plan("monthly-10", "10.00", 1);
        gateway.add_customer_with_card("cus-1", "tok-1", "Visa", "4242");

        let mut acct = account();
        acct.gateway_customer_id = Some("cus-1".to_string());

        let err = builder(gateway, "monthly-10")
            .with_coupon("coupon-5", false)
            .create(&mut acct, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::CouponNotFound(id) if id == "coupon-5"));
    }

    #[tokio::test]
    async fn test_create_fails_when_gateway_rejects() {
        let gateway = FakeGateway::new();
        gateway.add_plan("monthly-10", "10.00", 1);
        gateway.add_customer_with_card("cus-1", "tok-1", "Visa", "4242");
        gateway.reject_subscription_creates();

        let mut acct = account();
        acct.gateway_customer_id = Some("cus-1".to_string());

        let err = builder(gateway, "monthly-10")
            .create(&mut acct, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionNotCreated(_)));
    }

    #[tokio::test]
    async fn test_create_requires_a_payment_method() {
        let gateway = FakeGateway::new();
        gateway.add_plan("monthly-10", "10.00", 1);
        gateway.add_customer("cus-1");

        let mut acct = account();
        acct.gateway_customer_id = Some("cus-1".to_string());

        let err = builder(gateway, "monthly-10")
            .create(&mut acct, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionNotCreated(_)));
    }

    #[tokio::test]
    async fn test_gateway_payload_reflects_trial_and_coupon() {
        // The fake records the last create payload; a rejected create stops
        // before any local write, which lets us inspect the payload without
        // a database.
        let gateway = FakeGateway::new();
        gateway.add_plan("monthly-10", "10.00", 1);
        gateway.add_coupon("coupon-5", 5.0);
        gateway.add_customer_with_card("cus-1", "tok-1", "Visa", "4242");
        gateway.reject_subscription_creates();
        let handle = gateway.handle();

        let mut acct = account();
        acct.gateway_customer_id = Some("cus-1".to_string());

        let _ = builder(gateway, "monthly-10")
            .trial_days(7)
            .with_coupon("coupon-5", true)
            .create(&mut acct, None)
            .await;

        let request = handle.last_subscription_request().expect("payload recorded");
        assert_eq!(request.payment_method_token, "tok-1");
        assert_eq!(request.plan_id, "monthly-10");
        assert_eq!(request.price.as_deref(), Some("10.00"));
        assert_eq!(request.trial_duration, 7);
        assert_eq!(request.trial_duration_unit, "day");
        assert!(request.trial_period);
        assert_eq!(request.discounts.len(), 1);
        assert_eq!(request.discounts[0].inherited_from_id, "coupon-5");
        assert_eq!(request.discounts[0].amount.as_deref(), Some("0.50"));
    }

    #[tokio::test]
    async fn test_no_trial_means_no_trial_period_flag() {
        let gateway = FakeGateway::new();
        gateway.add_plan("monthly-10", "10.00", 1);
        gateway.add_customer_with_card("cus-1", "tok-1", "Visa", "4242");
        gateway.reject_subscription_creates();
        let handle = gateway.handle();

        let mut acct = account();
        acct.gateway_customer_id = Some("cus-1".to_string());

        let _ = builder(gateway, "monthly-10").create(&mut acct, None).await;

        let request = handle.last_subscription_request().expect("payload recorded");
        assert_eq!(request.trial_duration, 0);
        assert!(!request.trial_period);
        assert!(request.discounts.is_empty());
    }
}
