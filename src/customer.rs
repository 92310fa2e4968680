//! Accounts and gateway customers
//!
//! The billable entity is an `accounts` row extended with the gateway
//! customer id and a snapshot of the default payment method
//! (`payment_type`, `card_brand`, `card_last_four`). `CustomerService`
//! owns every operation that touches the gateway customer: one-off charges,
//! customer creation, card updates.

use std::sync::Arc;

use sqlx::PgPool;

use crate::catalog::format_amount;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    GatewayCustomer, GatewayTransaction, NewCustomer, PaymentGateway, PaymentMethodKind,
    SaleRequest,
};

/// A billable account row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub email: String,
    pub gateway_customer_id: Option<String>,
    /// "card" or "paypal" once a payment method is stored.
    pub payment_type: Option<String>,
    pub card_brand: Option<String>,
    pub card_last_four: Option<String>,
}

impl Account {
    /// Whether the account has been created as a gateway customer yet.
    pub fn has_gateway_customer(&self) -> bool {
        self.gateway_customer_id.is_some()
    }
}

/// Tax hook applied to plan prices. The default policy charges no tax;
/// embedding applications supply their own to tax by account.
pub trait TaxPolicy: Send + Sync {
    fn tax_percentage(&self, account: &Account) -> f64 {
        let _ = account;
        0.0
    }
}

/// The default, zero-tax policy.
pub struct NoTax;

impl TaxPolicy for NoTax {}

/// Gateway customer operations for billable accounts.
#[derive(Clone)]
pub struct CustomerService {
    gateway: Arc<dyn PaymentGateway>,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(gateway: Arc<dyn PaymentGateway>, pool: PgPool) -> Self {
        Self { gateway, pool }
    }

    /// Load an account row by id.
    pub async fn find_account(&self, account_id: i64) -> BillingResult<Option<Account>> {
        let account: Option<Account> = sqlx::query_as(
            r#"
            SELECT id, email, gateway_customer_id, payment_type, card_brand, card_last_four
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(account)
    }

    /// Make a one-off charge against the given payment nonce.
    ///
    /// A processor decline returns `Ok(None)`; only transport and protocol
    /// failures are errors.
    pub async fn charge(
        &self,
        account: &Account,
        amount: f64,
        nonce: &str,
    ) -> BillingResult<Option<GatewayTransaction>> {
        let request = SaleRequest {
            amount: format_amount(amount),
            payment_method_nonce: nonce.to_string(),
            submit_for_settlement: true,
        };

        let result = self.gateway.sale(&request).await?;

        if !result.success {
            tracing::info!(
                account_id = account.id,
                message = %result.message_or("declined"),
                "One-off charge declined"
            );
            return Ok(None);
        }

        let transaction = result
            .record
            .ok_or_else(|| BillingError::Gateway("sale succeeded without a transaction".into()))?;

        tracing::info!(
            account_id = account.id,
            transaction_id = %transaction.id,
            amount = %request.amount,
            "One-off charge settled"
        );

        Ok(Some(transaction))
    }

    /// Create the account as a customer at the gateway, attaching the given
    /// payment nonce as the default payment method.
    ///
    /// On success the gateway customer id and the payment-method snapshot
    /// are persisted on the account row. A processor rejection returns
    /// `Ok(None)` with no local change.
    pub async fn create_as_gateway_customer(
        &self,
        account: &mut Account,
        nonce: Option<&str>,
    ) -> BillingResult<Option<GatewayCustomer>> {
        let request = NewCustomer {
            email: Some(account.email.clone()),
            payment_method_nonce: nonce.map(str::to_string),
            make_default: true,
        };

        let result = self.gateway.create_customer(&request).await?;

        if !result.success {
            tracing::warn!(
                account_id = account.id,
                message = %result.message_or("rejected"),
                "Gateway refused customer creation"
            );
            return Ok(None);
        }

        let customer = result.record.ok_or_else(|| {
            BillingError::Gateway("customer create succeeded without a customer".into())
        })?;

        account.gateway_customer_id = Some(customer.id.clone());

        if let Some(method) = customer.default_payment_method() {
            match method.kind {
                PaymentMethodKind::Paypal => {
                    account.payment_type = Some("paypal".to_string());
                    account.card_brand = None;
                    account.card_last_four = None;
                }
                PaymentMethodKind::Card => {
                    account.payment_type = Some("card".to_string());
                    account.card_brand = method.card_type.clone();
                    account.card_last_four = method.last_four.clone();
                }
            }
        }

        self.persist_payment_profile(account).await?;

        tracing::info!(
            account_id = account.id,
            gateway_customer_id = %customer.id,
            "Created gateway customer"
        );

        Ok(Some(customer))
    }

    /// Fetch the gateway customer for the account.
    pub async fn as_gateway_customer(&self, account: &Account) -> BillingResult<GatewayCustomer> {
        let customer_id = account
            .gateway_customer_id
            .as_deref()
            .ok_or(BillingError::NoCustomer)?;

        self.gateway
            .find_customer(customer_id)
            .await?
            .ok_or_else(|| {
                BillingError::Gateway(format!("customer '{}' missing at gateway", customer_id))
            })
    }

    /// Replace the default payment method with the one the nonce stands for.
    ///
    /// Returns `Ok(true)` on success (the card snapshot is persisted) and
    /// `Ok(false)` on a processor decline.
    pub async fn update_card(&self, account: &mut Account, nonce: &str) -> BillingResult<bool> {
        let customer = self.as_gateway_customer(account).await?;

        let token = customer
            .default_payment_method()
            .map(|pm| pm.token.clone())
            .ok_or_else(|| BillingError::Gateway("customer has no payment method".into()))?;

        let result = self.gateway.update_payment_method(&token, nonce).await?;

        if !result.success {
            tracing::info!(
                account_id = account.id,
                message = %result.message_or("declined"),
                "Card update declined"
            );
            return Ok(false);
        }

        if let Some(method) = result.record {
            account.payment_type = Some(method.kind.as_str().to_string());
            account.card_brand = method.card_type;
            account.card_last_four = method.last_four;
            self.persist_payment_profile(account).await?;
        }

        tracing::info!(account_id = account.id, "Updated default payment method");

        Ok(true)
    }

    /// Write the gateway customer id and payment-method snapshot back to the
    /// account row.
    async fn persist_payment_profile(&self, account: &Account) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE accounts SET
                gateway_customer_id = $1,
                payment_type = $2,
                card_brand = $3,
                card_last_four = $4,
                updated_at = NOW()
            WHERE id = $5
            "#,
        )
        .bind(&account.gateway_customer_id)
        .bind(&account.payment_type)
        .bind(&account.card_brand)
        .bind(&account.card_last_four)
        .bind(account.id)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            id: 7,
            email: "pat@example.com".to_string(),
            gateway_customer_id: None,
            payment_type: None,
            card_brand: None,
            card_last_four: None,
        }
    }

    #[test]
    fn test_has_gateway_customer() {
        let mut acct = account();
        assert!(!acct.has_gateway_customer());
        acct.gateway_customer_id = Some("cus-1".to_string());
        assert!(acct.has_gateway_customer());
    }

    #[test]
    fn test_default_tax_policy_is_zero() {
        let policy = NoTax;
        assert_eq!(policy.tax_percentage(&account()), 0.0);
    }

    #[test]
    fn test_custom_tax_policy_overrides_hook() {
        struct FlatVat;
        impl TaxPolicy for FlatVat {
            fn tax_percentage(&self, _account: &Account) -> f64 {
                21.0
            }
        }
        assert_eq!(FlatVat.tax_percentage(&account()), 21.0);
    }
}
