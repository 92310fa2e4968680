//! Payment gateway contract
//!
//! The processor of record for customers, payment methods, plans, discounts,
//! subscriptions and transactions lives behind [`PaymentGateway`]. This crate
//! only consumes the API: state-changing calls come back in an
//! [`ApiResponse`] envelope (the processor reports success or rejection in
//! the body, not the transport), lookups return `Option` with `None` for an
//! absent resource, and transport failures surface as
//! [`BillingError::Gateway`](crate::error::BillingError::Gateway).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Result envelope for state-changing gateway calls.
///
/// `success == false` means the processor rejected the request (declined
/// card, validation failure); `record` carries the created or updated
/// resource when the call succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub record: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(record: T) -> Self {
        Self {
            success: true,
            message: None,
            record: Some(record),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            record: None,
        }
    }

    /// Gateway rejection message, or a fallback for terse processors.
    pub fn message_or(&self, fallback: &str) -> String {
        self.message.clone().unwrap_or_else(|| fallback.to_string())
    }
}

/// How a stored payment method is funded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethodKind {
    Card,
    Paypal,
}

impl PaymentMethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethodKind::Card => "card",
            PaymentMethodKind::Paypal => "paypal",
        }
    }
}

/// A stored payment method on a gateway customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPaymentMethod {
    pub token: String,
    pub kind: PaymentMethodKind,
    /// Card brand ("Visa", ...); absent for PayPal.
    #[serde(default)]
    pub card_type: Option<String>,
    #[serde(default)]
    pub last_four: Option<String>,
    #[serde(default)]
    pub default: bool,
}

/// A customer record at the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub payment_methods: Vec<GatewayPaymentMethod>,
}

impl GatewayCustomer {
    /// The payment method new subscriptions should bill against: the one
    /// marked default, falling back to the first stored method.
    pub fn default_payment_method(&self) -> Option<&GatewayPaymentMethod> {
        self.payment_methods
            .iter()
            .find(|pm| pm.default)
            .or_else(|| self.payment_methods.first())
    }
}

/// A recurring billing template at the gateway.
///
/// `price` is the processor's decimal string ("10.00");
/// `billing_frequency` is the number of months per billing cycle
/// (1 = monthly, 12 = yearly).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPlan {
    pub id: String,
    pub price: String,
    pub billing_frequency: u32,
}

/// A coupon definition at the gateway. Whether `amount` is a value or a
/// percentage is decided by the caller applying it, not stored remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayDiscount {
    pub id: String,
    pub amount: f64,
}

/// A discount line attached to a subscription or transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub id: String,
    pub amount: f64,
}

/// Remote subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Pending,
    PastDue,
    Canceled,
    Expired,
}

/// One entry of a subscription's status history. The first entry carries the
/// balance the subscription started its current status with, which is what
/// invoice starting-balance derivation reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub balance: Option<f64>,
}

/// A subscription resource at the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySubscription {
    pub id: String,
    pub plan_id: String,
    /// Decimal string; the price actually charged per cycle (tax inclusive).
    pub price: String,
    /// Outstanding balance; negative values are credit owed to the customer.
    #[serde(default)]
    pub balance: f64,
    pub status: SubscriptionStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub billing_period_end_date: Option<OffsetDateTime>,
    #[serde(default)]
    pub status_history: Vec<StatusEvent>,
    #[serde(default)]
    pub discounts: Vec<AppliedDiscount>,
    #[serde(default)]
    pub transactions: Vec<GatewayTransaction>,
}

/// A settled or settling transaction at the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub id: String,
    /// Net amount charged, after processor-side discounts and balance.
    pub amount: f64,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub discounts: Vec<AppliedDiscount>,
}

/// Payload for creating a gateway customer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCustomer {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub payment_method_nonce: Option<String>,
    /// Mark the resulting payment method as the customer's default.
    pub make_default: bool,
}

/// A discount to add to a subscription: inherit everything from the coupon
/// id, optionally overriding the amount (2-decimal string).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscountInstruction {
    pub inherited_from_id: String,
    #[serde(default)]
    pub amount: Option<String>,
}

/// Payload for creating a gateway subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
    pub payment_method_token: String,
    pub plan_id: String,
    /// Tax-adjusted price override (2-decimal string).
    #[serde(default)]
    pub price: Option<String>,
    pub trial_duration: u32,
    pub trial_duration_unit: String,
    pub trial_period: bool,
    #[serde(default)]
    pub discounts: Vec<DiscountInstruction>,
}

/// Payload for updating an existing gateway subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionChanges {
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    pub prorate_charges: bool,
    #[serde(default)]
    pub add_discounts: Vec<DiscountInstruction>,
}

/// Payload for a one-off sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleRequest {
    /// 2-decimal string.
    pub amount: String,
    pub payment_method_nonce: String,
    pub submit_for_settlement: bool,
}

/// Search filter for transactions. `customer_id` is set by the invoice
/// listing; the rest are caller-supplied extras.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionFilter {
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_after: Option<OffsetDateTime>,
}

/// The remote payment processor's API surface consumed by this crate.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(
        &self,
        request: &NewCustomer,
    ) -> BillingResult<ApiResponse<GatewayCustomer>>;

    async fn find_customer(&self, id: &str) -> BillingResult<Option<GatewayCustomer>>;

    async fn update_payment_method(
        &self,
        token: &str,
        nonce: &str,
    ) -> BillingResult<ApiResponse<GatewayPaymentMethod>>;

    async fn list_plans(&self) -> BillingResult<Vec<GatewayPlan>>;

    async fn list_discounts(&self) -> BillingResult<Vec<GatewayDiscount>>;

    async fn create_subscription(
        &self,
        request: &NewSubscription,
    ) -> BillingResult<ApiResponse<GatewaySubscription>>;

    async fn update_subscription(
        &self,
        id: &str,
        changes: &SubscriptionChanges,
    ) -> BillingResult<ApiResponse<GatewaySubscription>>;

    async fn cancel_subscription(&self, id: &str)
        -> BillingResult<ApiResponse<GatewaySubscription>>;

    async fn find_subscription(&self, id: &str) -> BillingResult<Option<GatewaySubscription>>;

    /// Batch lookup; ids missing at the gateway are silently skipped.
    async fn find_subscriptions(&self, ids: &[String])
        -> BillingResult<Vec<GatewaySubscription>>;

    async fn sale(&self, request: &SaleRequest) -> BillingResult<ApiResponse<GatewayTransaction>>;

    async fn find_transaction(&self, id: &str) -> BillingResult<Option<GatewayTransaction>>;

    async fn search_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> BillingResult<Vec<GatewayTransaction>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_ok() {
        let response = ApiResponse::ok(GatewayDiscount {
            id: "coupon-5".to_string(),
            amount: 5.0,
        });
        assert!(response.success);
        assert!(response.record.is_some());
    }

    #[test]
    fn test_api_response_rejected_keeps_message() {
        let response: ApiResponse<GatewayTransaction> = ApiResponse::rejected("card declined");
        assert!(!response.success);
        assert!(response.record.is_none());
        assert_eq!(response.message_or("fallback"), "card declined");
    }

    #[test]
    fn test_api_response_message_fallback() {
        let response: ApiResponse<GatewayTransaction> = ApiResponse {
            success: false,
            message: None,
            record: None,
        };
        assert_eq!(response.message_or("gateway rejected"), "gateway rejected");
    }

    #[test]
    fn test_default_payment_method_prefers_flagged_default() {
        let customer = GatewayCustomer {
            id: "cus-1".to_string(),
            email: None,
            payment_methods: vec![
                GatewayPaymentMethod {
                    token: "tok-a".to_string(),
                    kind: PaymentMethodKind::Card,
                    card_type: Some("Visa".to_string()),
                    last_four: Some("4242".to_string()),
                    default: false,
                },
                GatewayPaymentMethod {
                    token: "tok-b".to_string(),
                    kind: PaymentMethodKind::Paypal,
                    card_type: None,
                    last_four: None,
                    default: true,
                },
            ],
        };
        let method = customer.default_payment_method();
        assert_eq!(method.map(|pm| pm.token.as_str()), Some("tok-b"));
    }

    #[test]
    fn test_default_payment_method_falls_back_to_first() {
        let customer = GatewayCustomer {
            id: "cus-1".to_string(),
            email: None,
            payment_methods: vec![GatewayPaymentMethod {
                token: "tok-a".to_string(),
                kind: PaymentMethodKind::Card,
                card_type: None,
                last_four: None,
                default: false,
            }],
        };
        assert_eq!(
            customer.default_payment_method().map(|pm| pm.token.as_str()),
            Some("tok-a")
        );
    }

    #[test]
    fn test_api_response_deserializes_for_non_default_payloads() {
        // The payload types carry no Default impls; the envelope must still
        // deserialize, including when the processor omits `record`.
        let json = r#"{
            "success": true,
            "record": {"id": "cus-1", "payment_methods": []}
        }"#;
        let response: ApiResponse<GatewayCustomer> =
            serde_json::from_str(json).expect("envelope with record should deserialize");
        assert_eq!(response.record.map(|c| c.id), Some("cus-1".to_string()));

        let json = r#"{"success": false, "message": "card declined"}"#;
        let response: ApiResponse<GatewayCustomer> =
            serde_json::from_str(json).expect("envelope without record should deserialize");
        assert!(!response.success);
        assert!(response.record.is_none());
    }

    #[test]
    fn test_subscription_wire_roundtrip() {
        let json = r#"{
            "id": "sub-1",
            "plan_id": "monthly-10",
            "price": "10.00",
            "status": "active",
            "billing_period_end_date": "2026-09-01T00:00:00Z",
            "status_history": [{"status": "active", "balance": -2.5}],
            "discounts": [],
            "transactions": []
        }"#;
        let sub: GatewaySubscription =
            serde_json::from_str(json).expect("subscription should deserialize");
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.balance, 0.0);
        assert_eq!(sub.status_history[0].balance, Some(-2.5));
    }
}
