//! JSON/HTTP implementation of [`PaymentGateway`].
//!
//! Talks to the processor's merchant-scoped REST API with basic auth
//! (public key as user, private key as password). Lookup endpoints map a
//! 404 to `Ok(None)`; any other non-success status is a
//! [`BillingError::Gateway`].

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ApiResponse, GatewayCustomer, GatewayDiscount, GatewayPaymentMethod, GatewayPlan,
    GatewaySubscription, GatewayTransaction, NewCustomer, NewSubscription, PaymentGateway,
    SaleRequest, SubscriptionChanges, TransactionFilter,
};

/// Connection settings for the remote processor.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub merchant_id: String,
    pub public_key: String,
    pub private_key: String,
}

impl GatewayConfig {
    /// Read the gateway settings from the environment (a `.env` file is
    /// honored when present).
    pub fn from_env() -> BillingResult<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            base_url: env_var("BILLING_GATEWAY_URL")?,
            merchant_id: env_var("BILLING_MERCHANT_ID")?,
            public_key: env_var("BILLING_PUBLIC_KEY")?,
            private_key: env_var("BILLING_PRIVATE_KEY")?,
        })
    }
}

fn env_var(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} must be set", name)))
}

/// [`PaymentGateway`] over the processor's HTTP API.
pub struct HttpGateway {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/merchants/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.merchant_id,
            path
        )
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> BillingResult<Option<T>> {
        let response = self
            .http
            .get(self.url(path))
            .basic_auth(&self.config.public_key, Some(&self.config.private_key))
            .send()
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| BillingError::Gateway(e.to_string()))?;

        let record = response
            .json::<T>()
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;

        Ok(Some(record))
    }

    async fn send<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> BillingResult<T> {
        let response = self
            .http
            .request(method, self.url(path))
            .basic_auth(&self.config.public_key, Some(&self.config.private_key))
            .json(body)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?
            .error_for_status()
            .map_err(|e| BillingError::Gateway(e.to_string()))?;

        response
            .json::<T>()
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> BillingResult<T> {
        self.send(reqwest::Method::POST, path, body).await
    }

    async fn put<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> BillingResult<T> {
        self.send(reqwest::Method::PUT, path, body).await
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_customer(
        &self,
        request: &NewCustomer,
    ) -> BillingResult<ApiResponse<GatewayCustomer>> {
        self.post("customers", request).await
    }

    async fn find_customer(&self, id: &str) -> BillingResult<Option<GatewayCustomer>> {
        self.get(&format!("customers/{}", id)).await
    }

    async fn update_payment_method(
        &self,
        token: &str,
        nonce: &str,
    ) -> BillingResult<ApiResponse<GatewayPaymentMethod>> {
        #[derive(Serialize)]
        struct Body<'a> {
            payment_method_nonce: &'a str,
        }
        self.put(
            &format!("payment_methods/{}", token),
            &Body {
                payment_method_nonce: nonce,
            },
        )
        .await
    }

    async fn list_plans(&self) -> BillingResult<Vec<GatewayPlan>> {
        Ok(self.get("plans").await?.unwrap_or_default())
    }

    async fn list_discounts(&self) -> BillingResult<Vec<GatewayDiscount>> {
        Ok(self.get("discounts").await?.unwrap_or_default())
    }

    async fn create_subscription(
        &self,
        request: &NewSubscription,
    ) -> BillingResult<ApiResponse<GatewaySubscription>> {
        self.post("subscriptions", request).await
    }

    async fn update_subscription(
        &self,
        id: &str,
        changes: &SubscriptionChanges,
    ) -> BillingResult<ApiResponse<GatewaySubscription>> {
        self.put(&format!("subscriptions/{}", id), changes).await
    }

    async fn cancel_subscription(
        &self,
        id: &str,
    ) -> BillingResult<ApiResponse<GatewaySubscription>> {
        self.put(&format!("subscriptions/{}/cancel", id), &serde_json::json!({}))
            .await
    }

    async fn find_subscription(&self, id: &str) -> BillingResult<Option<GatewaySubscription>> {
        self.get(&format!("subscriptions/{}", id)).await
    }

    async fn find_subscriptions(
        &self,
        ids: &[String],
    ) -> BillingResult<Vec<GatewaySubscription>> {
        let mut subscriptions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(subscription) = self.find_subscription(id).await? {
                subscriptions.push(subscription);
            }
        }
        Ok(subscriptions)
    }

    async fn sale(&self, request: &SaleRequest) -> BillingResult<ApiResponse<GatewayTransaction>> {
        self.post("transactions", request).await
    }

    async fn find_transaction(&self, id: &str) -> BillingResult<Option<GatewayTransaction>> {
        self.get(&format!("transactions/{}", id)).await
    }

    async fn search_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> BillingResult<Vec<GatewayTransaction>> {
        self.post("transactions/search", filter).await
    }
}
