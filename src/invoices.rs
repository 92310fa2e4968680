//! Invoice derivation
//!
//! An [`Invoice`] is a read-only view computed from one gateway transaction
//! and the subscription it belongs to. Nothing here is persisted or cached;
//! every value is derived on demand from the fetched snapshot.
//!
//! Amount convention (pinned): the transaction amount is the *net* amount;
//! the processor has already applied discounts and any starting balance.
//! `total()` reports the net paid, and `subtotal()` reconstructs the gross
//! as `net + discounts - starting balance`. Monetary accessors return
//! "$"-prefixed display strings; wire payloads stay plain.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use time::{OffsetDateTime, UtcOffset};

use crate::catalog::format_dollars;
use crate::customer::Account;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    AppliedDiscount, GatewaySubscription, GatewayTransaction, PaymentGateway, SubscriptionStatus,
    TransactionFilter,
};

/// Derived monetary view over one transaction.
#[derive(Debug)]
pub struct Invoice {
    account: Account,
    subscription: GatewaySubscription,
    transaction: GatewayTransaction,
}

impl Invoice {
    pub fn new(
        account: Account,
        subscription: GatewaySubscription,
        transaction: GatewayTransaction,
    ) -> Self {
        Self {
            account,
            subscription,
            transaction,
        }
    }

    /// Invoice date: when the transaction was created, in UTC.
    pub fn date(&self) -> OffsetDateTime {
        self.transaction.created_at
    }

    /// Invoice date converted to the given offset.
    pub fn date_in(&self, offset: UtcOffset) -> OffsetDateTime {
        self.transaction.created_at.to_offset(offset)
    }

    fn raw_total(&self) -> f64 {
        self.transaction.amount.max(0.0)
    }

    /// Net amount paid (or to be paid), "$"-prefixed.
    pub fn total(&self) -> String {
        format_dollars(self.raw_total())
    }

    fn raw_subtotal(&self) -> f64 {
        (self.transaction.amount + self.discount_total() - self.raw_starting_balance()).max(0.0)
    }

    /// Gross amount before discounts and starting balance, "$"-prefixed.
    pub fn subtotal(&self) -> String {
        format_dollars(self.raw_subtotal())
    }

    /// Sum of all discount lines on the transaction.
    pub fn discount_total(&self) -> f64 {
        self.transaction
            .discounts
            .iter()
            .map(|discount| discount.amount)
            .sum()
    }

    pub fn has_discount(&self) -> bool {
        !self.transaction.discounts.is_empty()
    }

    /// The first discount line, if any.
    pub fn coupon(&self) -> Option<&AppliedDiscount> {
        self.transaction.discounts.first()
    }

    /// Discount as a whole percentage of the gross, "%"-suffixed. A zero
    /// subtotal reads as "0%" rather than dividing by zero.
    pub fn percent_off(&self) -> String {
        let subtotal = self.raw_subtotal();
        if subtotal == 0.0 {
            return "0%".to_string();
        }

        let percent = (self.discount_total() / subtotal * 100.0).round().max(0.0);
        format!("{}%", percent as i64)
    }

    /// Discount as a "$"-prefixed amount.
    pub fn amount_off(&self) -> String {
        format_dollars(self.discount_total())
    }

    fn raw_starting_balance(&self) -> f64 {
        self.subscription
            .status_history
            .first()
            .and_then(|event| event.balance)
            .unwrap_or(0.0)
    }

    /// Balance the subscription carried into this charge, "$"-prefixed.
    pub fn starting_balance(&self) -> String {
        format_dollars(self.raw_starting_balance())
    }

    pub fn has_starting_balance(&self) -> bool {
        self.raw_starting_balance() != 0.0
    }

    pub fn transaction(&self) -> &GatewayTransaction {
        &self.transaction
    }

    pub fn subscription(&self) -> &GatewaySubscription {
        &self.subscription
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// The enumerated field set an external document renderer needs.
    /// Rendering itself (PDF, HTML) is not this crate's job.
    pub fn fields(&self) -> InvoiceFields {
        InvoiceFields {
            transaction_id: self.transaction.id.clone(),
            subscription_id: self.subscription.id.clone(),
            account_email: self.account.email.clone(),
            date: self.date(),
            total: self.total(),
            subtotal: self.subtotal(),
            has_discount: self.has_discount(),
            amount_off: self.amount_off(),
            percent_off: self.percent_off(),
            coupon: self.coupon().map(|discount| discount.id.clone()),
            has_starting_balance: self.has_starting_balance(),
            starting_balance: self.starting_balance(),
            card_brand: self.account.card_brand.clone(),
            card_last_four: self.account.card_last_four.clone(),
        }
    }
}

/// Serializable invoice snapshot handed to external renderers.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceFields {
    pub transaction_id: String,
    pub subscription_id: String,
    pub account_email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub total: String,
    pub subtotal: String,
    pub has_discount: bool,
    pub amount_off: String,
    pub percent_off: String,
    pub coupon: Option<String>,
    pub has_starting_balance: bool,
    pub starting_balance: String,
    pub card_brand: Option<String>,
    pub card_last_four: Option<String>,
}

/// Invoice listing and lookup against the gateway.
#[derive(Clone)]
pub struct InvoiceService {
    gateway: Arc<dyn PaymentGateway>,
}

impl InvoiceService {
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { gateway }
    }

    /// All invoices for the account, newest first.
    ///
    /// Transactions are searched by the account's gateway customer id (plus
    /// any extra filter fields), their subscriptions fetched in one batch,
    /// and one invoice emitted per transaction of each Active subscription,
    /// or of every subscription when `include_pending` is set. An account
    /// with no gateway customer yet has no invoices.
    pub async fn invoices(
        &self,
        account: &Account,
        include_pending: bool,
        filter: Option<TransactionFilter>,
    ) -> BillingResult<Vec<Invoice>> {
        let Some(customer_id) = account.gateway_customer_id.clone() else {
            return Ok(Vec::new());
        };

        let mut filter = filter.unwrap_or_default();
        filter.customer_id = Some(customer_id);

        let transactions = self.gateway.search_transactions(&filter).await?;

        let subscription_ids: BTreeSet<String> = transactions
            .iter()
            .filter_map(|transaction| transaction.subscription_id.clone())
            .collect();
        let subscription_ids: Vec<String> = subscription_ids.into_iter().collect();

        let subscriptions = self.gateway.find_subscriptions(&subscription_ids).await?;

        let mut invoices = Vec::new();
        for subscription in subscriptions {
            if subscription.status != SubscriptionStatus::Active && !include_pending {
                continue;
            }
            for transaction in &subscription.transactions {
                invoices.push(Invoice::new(
                    account.clone(),
                    subscription.clone(),
                    transaction.clone(),
                ));
            }
        }

        invoices.sort_by_key(|invoice| Reverse(invoice.date()));

        Ok(invoices)
    }

    /// Look up one invoice by transaction id. Absent transactions (or
    /// transactions whose subscription is gone) read as `None`.
    pub async fn find_invoice(
        &self,
        account: &Account,
        transaction_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        let Some(transaction) = self.gateway.find_transaction(transaction_id).await? else {
            return Ok(None);
        };

        let Some(subscription_id) = transaction.subscription_id.clone() else {
            return Ok(None);
        };

        let Some(subscription) = self.gateway.find_subscription(&subscription_id).await? else {
            return Ok(None);
        };

        Ok(Some(Invoice::new(
            account.clone(),
            subscription,
            transaction,
        )))
    }

    /// Like [`find_invoice`](Self::find_invoice), but absence is an error,
    /// for call sites that translate it into a 404.
    pub async fn find_invoice_or_fail(
        &self,
        account: &Account,
        transaction_id: &str,
    ) -> BillingResult<Invoice> {
        self.find_invoice(account, transaction_id)
            .await?
            .ok_or_else(|| BillingError::InvoiceNotFound(transaction_id.to_string()))
    }
}
