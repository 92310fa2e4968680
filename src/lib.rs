// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! billgate
//!
//! Subscription billing and invoicing backed by a remote payment gateway.
//!
//! ## Features
//!
//! - **Subscription Management**: Create, cancel (with grace period), swap plans
//! - **Plan Swaps**: In-place prorated updates within a billing cycle, replacement
//!   with an unused-period credit across cycles
//! - **Trials and Coupons**: Day-granular trials; value and percentage coupons
//! - **Customers**: Gateway customer creation, card updates, one-off charges
//! - **Invoices**: Derived read-only views over gateway transactions
//! - **Tax Hook**: Per-account tax percentage applied to plan prices

pub mod builder;
pub mod catalog;
pub mod customer;
pub mod error;
pub mod gateway;
pub mod http_gateway;
pub mod invoices;
pub mod store;
pub mod subscriptions;

#[cfg(test)]
mod test_support;

// Builder
pub use builder::SubscriptionBuilder;

// Catalog
pub use catalog::{format_amount, format_dollars, parse_amount, plan_price_with_tax, PlanCatalog};

// Customer
pub use customer::{Account, CustomerService, NoTax, TaxPolicy};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{
    ApiResponse, AppliedDiscount, DiscountInstruction, GatewayCustomer, GatewayDiscount,
    GatewayPaymentMethod, GatewayPlan, GatewaySubscription, GatewayTransaction, NewCustomer,
    NewSubscription, PaymentGateway, PaymentMethodKind, SaleRequest, StatusEvent,
    SubscriptionChanges, SubscriptionStatus, TransactionFilter,
};

// HTTP gateway
pub use http_gateway::{GatewayConfig, HttpGateway};

// Invoices
pub use invoices::{Invoice, InvoiceFields, InvoiceService};

// Store
pub use store::{NewSubscriptionRecord, PgSubscriptionStore, SubscriptionStore};

// Subscriptions
pub use subscriptions::{
    credit_for_unused_period, grace_period_end, SubscriptionRecord, SubscriptionService,
    CREDIT_COUPON_ID,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub customer: CustomerService,
    pub subscriptions: SubscriptionService,
    pub invoices: InvoiceService,
    pub catalog: PlanCatalog,
    gateway: Arc<dyn PaymentGateway>,
    pool: PgPool,
    tax: Arc<dyn TaxPolicy>,
}

impl BillingService {
    /// Create a new billing service over the given gateway, taxing nothing.
    pub fn new(gateway: Arc<dyn PaymentGateway>, pool: PgPool) -> Self {
        Self::with_tax_policy(gateway, pool, Arc::new(NoTax))
    }

    /// Create a new billing service with an application-supplied tax policy.
    pub fn with_tax_policy(
        gateway: Arc<dyn PaymentGateway>,
        pool: PgPool,
        tax: Arc<dyn TaxPolicy>,
    ) -> Self {
        Self {
            customer: CustomerService::new(gateway.clone(), pool.clone()),
            subscriptions: SubscriptionService::new(gateway.clone(), pool.clone(), tax.clone()),
            invoices: InvoiceService::new(gateway.clone()),
            catalog: PlanCatalog::new(gateway.clone()),
            gateway,
            pool,
            tax,
        }
    }

    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway = Arc::new(HttpGateway::new(GatewayConfig::from_env()?));
        Ok(Self::new(gateway, pool))
    }

    /// Start building a subscription in the given named slot on the given
    /// plan. Finish with [`SubscriptionBuilder::create`].
    pub fn new_subscription(&self, name: &str, plan: &str) -> SubscriptionBuilder {
        SubscriptionBuilder::new(
            self.gateway.clone(),
            self.pool.clone(),
            self.tax.clone(),
            name,
            plan,
        )
    }
}
