//! Plan and coupon catalog
//!
//! The gateway exposes plans and discounts only as full listings, so lookups
//! list and scan for an id match. Money helpers live here too: every amount
//! sent to the gateway is a 2-decimal, dot-separated string.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayDiscount, GatewayPlan, PaymentGateway};

/// Format an amount the way the gateway accepts it: two decimals, `.`
/// separator, no thousands separator. Idempotent for already-formatted
/// values.
pub fn format_amount(amount: f64) -> String {
    format!("{:.2}", amount)
}

/// Format an amount for display on invoices: the gateway format with a "$"
/// prefix. Wire payloads never carry the symbol; invoice accessors always do.
pub fn format_dollars(amount: f64) -> String {
    format!("${}", format_amount(amount))
}

/// Parse a gateway decimal string. Malformed input reads as zero, matching
/// how the processor's own SDKs coerce prices.
pub fn parse_amount(raw: &str) -> f64 {
    raw.trim().parse::<f64>().unwrap_or(0.0)
}

/// Plan price with the account's tax percentage applied, gateway-formatted.
pub fn plan_price_with_tax(plan: &GatewayPlan, tax_percentage: f64) -> String {
    format_amount((1.0 + tax_percentage / 100.0) * parse_amount(&plan.price))
}

/// Two plans bill on the same cycle iff their billing frequencies match.
pub fn same_billing_frequency(first: &GatewayPlan, second: &GatewayPlan) -> bool {
    first.billing_frequency == second.billing_frequency
}

/// Read-only resolver for the gateway's plan and coupon listings.
#[derive(Clone)]
pub struct PlanCatalog {
    gateway: Arc<dyn PaymentGateway>,
}

impl PlanCatalog {
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { gateway }
    }

    /// Resolve a plan id against the gateway's plan listing.
    pub async fn find_plan(&self, id: &str) -> BillingResult<GatewayPlan> {
        let plans = self.gateway.list_plans().await?;

        plans
            .into_iter()
            .find(|plan| plan.id == id)
            .ok_or_else(|| BillingError::PlanNotFound(id.to_string()))
    }

    /// Resolve a coupon id against the gateway's discount listing.
    pub async fn find_coupon(&self, id: &str) -> BillingResult<GatewayDiscount> {
        let coupons = self.gateway.list_discounts().await?;

        coupons
            .into_iter()
            .find(|coupon| coupon.id == id)
            .ok_or_else(|| BillingError::CouponNotFound(id.to_string()))
    }
}
