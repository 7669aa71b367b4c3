//! # Exchange Client SDK
//!
//! A typed Rust client for the exchange back office API.
//!
//! Most catalog reads, quoting, order placement and tracking work without a
//! token. Everything else needs a bearer JWT set with [`ExchangeClient::with_token`].

use exchange_types::{
    ApplyReferralRequest, AttachDocumentRequest, Branch, BranchId, Conversion,
    CreateBranchRequest, CreateCurrencyRequest, CreateOrderRequest, CreateRateRequest,
    CreateReviewRequest, Currency, CurrencyBalance, CurrencyCode, CurrencyFilter, ExchangeRate,
    OrderDocument, OrderId, OrderResponse, QuoteRequest, RateFilter, RateId,
    RecordPurchaseRequest, ReferralEntry, Review, ReviewId, SetRolesRequest, TrackingResponse,
    UpdateCurrencyRequest, UpdateOrderStatusRequest, UpdateProfileRequest, UpdateRateRequest,
    UpdateReviewRequest, User, UserId,
};
use reqwest::{Client, Method, RequestBuilder};
use serde::{Serialize, de::DeserializeOwned};

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} {kind} - {message}")]
    Api {
        status: u16,
        kind: String,
        message: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Exchange API client.
pub struct ExchangeClient {
    base_url: String,
    token: Option<String>,
    http: Client,
}

impl ExchangeClient {
    /// Creates a new client.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            http: Client::new(),
        }
    }

    /// Sets the bearer token sent with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Checks if the API is healthy.
    pub async fn health(&self) -> Result<bool, ClientError> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Catalog
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn list_currencies(
        &self,
        include_inactive: bool,
    ) -> Result<Vec<Currency>, ClientError> {
        let filter = CurrencyFilter { include_inactive };
        let req = self.request(Method::GET, "/api/currencies").query(&filter);
        self.send(req).await
    }

    pub async fn get_currency(&self, code: CurrencyCode) -> Result<Currency, ClientError> {
        self.get(&format!("/api/currencies/{}", code)).await
    }

    pub async fn create_currency(
        &self,
        req: &CreateCurrencyRequest,
    ) -> Result<Currency, ClientError> {
        self.with_body(Method::POST, "/api/currencies", req).await
    }

    pub async fn update_currency(
        &self,
        code: CurrencyCode,
        req: &UpdateCurrencyRequest,
    ) -> Result<Currency, ClientError> {
        self.with_body(Method::PATCH, &format!("/api/currencies/{}", code), req)
            .await
    }

    pub async fn list_branches(&self) -> Result<Vec<Branch>, ClientError> {
        self.get("/api/branches").await
    }

    pub async fn get_branch(&self, id: BranchId) -> Result<Branch, ClientError> {
        self.get(&format!("/api/branches/{}", id)).await
    }

    pub async fn create_branch(&self, req: &CreateBranchRequest) -> Result<Branch, ClientError> {
        self.with_body(Method::POST, "/api/branches", req).await
    }

    /// Lists what a branch holds. Owner only.
    pub async fn list_balances(
        &self,
        branch_id: BranchId,
    ) -> Result<Vec<CurrencyBalance>, ClientError> {
        self.get(&format!("/api/branches/{}/balances", branch_id))
            .await
    }

    /// Records a purchase and returns the updated balance.
    pub async fn record_purchase(
        &self,
        branch_id: BranchId,
        req: &RecordPurchaseRequest,
    ) -> Result<CurrencyBalance, ClientError> {
        self.with_body(
            Method::POST,
            &format!("/api/branches/{}/balances/purchase", branch_id),
            req,
        )
        .await
    }

    pub async fn list_rates(&self, filter: &RateFilter) -> Result<Vec<ExchangeRate>, ClientError> {
        let req = self.request(Method::GET, "/api/rates").query(filter);
        self.send(req).await
    }

    pub async fn get_rate(&self, id: RateId) -> Result<ExchangeRate, ClientError> {
        self.get(&format!("/api/rates/{}", id)).await
    }

    pub async fn create_rate(&self, req: &CreateRateRequest) -> Result<ExchangeRate, ClientError> {
        self.with_body(Method::POST, "/api/rates", req).await
    }

    pub async fn update_rate(
        &self,
        id: RateId,
        req: &UpdateRateRequest,
    ) -> Result<ExchangeRate, ClientError> {
        self.with_body(Method::PATCH, &format!("/api/rates/{}", id), req)
            .await
    }

    /// Prices an exchange at a rate. Set exactly one of the amounts.
    pub async fn quote(&self, id: RateId, req: &QuoteRequest) -> Result<Conversion, ClientError> {
        self.with_body(Method::POST, &format!("/api/rates/{}/quote", id), req)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Orders
    // ─────────────────────────────────────────────────────────────────────────

    /// Lists the orders visible to the caller.
    pub async fn list_orders(&self) -> Result<Vec<OrderResponse>, ClientError> {
        self.get("/api/orders").await
    }

    pub async fn create_order(
        &self,
        req: &CreateOrderRequest,
    ) -> Result<OrderResponse, ClientError> {
        self.with_body(Method::POST, "/api/orders", req).await
    }

    pub async fn get_order(&self, id: OrderId) -> Result<OrderResponse, ClientError> {
        self.get(&format!("/api/orders/{}", id)).await
    }

    pub async fn delete_order(&self, id: OrderId) -> Result<(), ClientError> {
        let req = self.request(Method::DELETE, &format!("/api/orders/{}", id));
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(api_error(status.as_u16(), body))
        }
    }

    pub async fn update_order_status(
        &self,
        id: OrderId,
        req: &UpdateOrderStatusRequest,
    ) -> Result<OrderResponse, ClientError> {
        self.with_body(Method::PATCH, &format!("/api/orders/{}/status", id), req)
            .await
    }

    pub async fn list_documents(&self, id: OrderId) -> Result<Vec<OrderDocument>, ClientError> {
        self.get(&format!("/api/orders/{}/documents", id)).await
    }

    pub async fn attach_document(
        &self,
        id: OrderId,
        req: &AttachDocumentRequest,
    ) -> Result<OrderDocument, ClientError> {
        self.with_body(Method::POST, &format!("/api/orders/{}/documents", id), req)
            .await
    }

    /// Looks up an order by its tracking code. No token needed.
    pub async fn track_order(&self, tracking_code: &str) -> Result<TrackingResponse, ClientError> {
        self.get(&format!("/api/track/{}", tracking_code)).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reviews
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn list_reviews(&self) -> Result<Vec<Review>, ClientError> {
        self.get("/api/reviews").await
    }

    pub async fn list_public_reviews(&self) -> Result<Vec<Review>, ClientError> {
        self.get("/api/reviews/public").await
    }

    pub async fn create_review(&self, req: &CreateReviewRequest) -> Result<Review, ClientError> {
        self.with_body(Method::POST, "/api/reviews", req).await
    }

    pub async fn set_review_visibility(
        &self,
        id: ReviewId,
        is_visible: bool,
    ) -> Result<Review, ClientError> {
        let req = UpdateReviewRequest { is_visible };
        self.with_body(Method::PATCH, &format!("/api/reviews/{}", id), &req)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn me(&self) -> Result<User, ClientError> {
        self.get("/api/users/me").await
    }

    pub async fn update_me(&self, req: &UpdateProfileRequest) -> Result<User, ClientError> {
        self.with_body(Method::PATCH, "/api/users/me", req).await
    }

    pub async fn apply_referral(&self, referral_code: &str) -> Result<User, ClientError> {
        let req = ApplyReferralRequest {
            referral_code: referral_code.to_string(),
        };
        self.with_body(Method::POST, "/api/users/me/referral", &req)
            .await
    }

    pub async fn list_referrals(&self) -> Result<Vec<ReferralEntry>, ClientError> {
        self.get("/api/users/me/referrals").await
    }

    pub async fn set_roles(&self, id: UserId, req: &SetRolesRequest) -> Result<User, ClientError> {
        self.with_body(Method::PUT, &format!("/api/users/{}/roles", id), req)
            .await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send(self.request(Method::GET, path)).await
    }

    async fn with_body<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        self.send(self.request(method, path).json(body)).await
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            let body = resp.text().await?;
            Ok(serde_json::from_str(&body)?)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(api_error(status.as_u16(), body))
        }
    }
}

/// Builds an API error from a failed response, falling back to the raw body
/// when it is not the server's JSON error shape.
fn api_error(status: u16, body: String) -> ClientError {
    let parsed = serde_json::from_str::<serde_json::Value>(&body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|v| v.get(name))
            .and_then(|v| v.as_str())
            .map(String::from)
    };
    ClientError::Api {
        status,
        kind: field("kind").unwrap_or_else(|| "unknown".to_string()),
        message: field("error").unwrap_or(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = ExchangeClient::new("http://localhost:3000");
        assert_eq!(client.base_url, "http://localhost:3000");
        assert_eq!(client.token, None);
    }

    #[test]
    fn test_client_with_trailing_slash() {
        let client = ExchangeClient::new("http://localhost:3000/");
        assert_eq!(client.base_url, "http://localhost:3000");
    }

    #[test]
    fn test_client_with_token() {
        let client = ExchangeClient::new("http://localhost:3000").with_token("jwt");
        assert_eq!(client.token, Some("jwt".to_string()));
    }

    #[test]
    fn test_api_error_from_json_body() {
        let body = r#"{"error":"Order not found","code":404,"kind":"not_found"}"#;
        match api_error(404, body.to_string()) {
            ClientError::Api {
                status,
                kind,
                message,
            } => {
                assert_eq!(status, 404);
                assert_eq!(kind, "not_found");
                assert_eq!(message, "Order not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_api_error_from_plain_body() {
        match api_error(502, "Bad Gateway".to_string()) {
            ClientError::Api { kind, message, .. } => {
                assert_eq!(kind, "unknown");
                assert_eq!(message, "Bad Gateway");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_request_carries_bearer_token() {
        let client = ExchangeClient::new("http://localhost:3000").with_token("jwt");
        let req = client
            .request(Method::GET, "/api/users/me")
            .build()
            .unwrap();
        assert_eq!(req.url().as_str(), "http://localhost:3000/api/users/me");
        assert_eq!(
            req.headers().get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer jwt"
        );
    }
}
