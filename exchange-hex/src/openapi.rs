//! OpenAPI specification and documentation.

#![allow(dead_code)] // Path functions are only used by utoipa for documentation generation

use exchange_types::domain::{
    Branch, BranchId, Currency, CurrencyBalance, DayHours, DocumentType, ExchangeRate, OrderDocument,
    OrderId, OrderItem, OrderStatus, RateId, Review, ReviewId, Role, TrackingCode, User, UserId,
    WorkingHours,
};
use exchange_types::dto::{
    ApplyReferralRequest, AttachDocumentRequest, CreateBranchRequest, CreateCurrencyRequest,
    CreateOrderRequest, CreateRateRequest, CreateReviewRequest, CurrencyFilter, ErrorResponse,
    OrderItemRequest, OrderItemView, OrderResponse, QuoteRequest, RateFilter,
    RecordPurchaseRequest, ReferralEntry, SetRolesRequest, TrackingResponse,
    UpdateCurrencyRequest, UpdateOrderStatusRequest, UpdateProfileRequest, UpdateRateRequest,
    UpdateReviewRequest,
};
use exchange_types::{Conversion, CurrencyCode, Direction};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
};

// Dummy functions to generate path documentation
// These are not the actual handlers, just for OpenAPI path generation

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy", body = inline(serde_json::Value), example = json!({"status": "healthy"}))
    )
)]
async fn health() {}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog
// ─────────────────────────────────────────────────────────────────────────────

/// List currencies
#[utoipa::path(
    get,
    path = "/api/currencies",
    tag = "catalog",
    params(CurrencyFilter),
    responses(
        (status = 200, description = "Currencies in the catalog", body = Vec<Currency>),
        (status = 403, description = "Retired currencies are for catalog managers", body = ErrorResponse)
    )
)]
async fn list_currencies() {}

/// Add a currency
#[utoipa::path(
    post,
    path = "/api/currencies",
    tag = "catalog",
    request_body = CreateCurrencyRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 201, description = "Currency created", body = Currency),
        (status = 400, description = "Invalid or duplicate currency", body = ErrorResponse),
        (status = 403, description = "Administrator or owner only", body = ErrorResponse)
    )
)]
async fn create_currency() {}

/// Get a currency
#[utoipa::path(
    get,
    path = "/api/currencies/{code}",
    tag = "catalog",
    params(("code" = String, Path, description = "Three-letter currency code")),
    responses(
        (status = 200, description = "Currency found", body = Currency),
        (status = 404, description = "Currency not found", body = ErrorResponse)
    )
)]
async fn get_currency() {}

/// Update or retire a currency
#[utoipa::path(
    patch,
    path = "/api/currencies/{code}",
    tag = "catalog",
    request_body = UpdateCurrencyRequest,
    security(("bearer_auth" = [])),
    params(("code" = String, Path, description = "Three-letter currency code")),
    responses(
        (status = 200, description = "Currency updated", body = Currency),
        (status = 404, description = "Currency not found", body = ErrorResponse)
    )
)]
async fn update_currency() {}

/// List branches
#[utoipa::path(
    get,
    path = "/api/branches",
    tag = "catalog",
    responses((status = 200, description = "All branches", body = Vec<Branch>))
)]
async fn list_branches() {}

/// Open a branch
#[utoipa::path(
    post,
    path = "/api/branches",
    tag = "catalog",
    request_body = CreateBranchRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 201, description = "Branch created", body = Branch),
        (status = 400, description = "Invalid branch", body = ErrorResponse),
        (status = 403, description = "Owner only", body = ErrorResponse)
    )
)]
async fn create_branch() {}

/// Get a branch
#[utoipa::path(
    get,
    path = "/api/branches/{id}",
    tag = "catalog",
    params(("id" = String, Path, description = "Branch ID (UUID)")),
    responses(
        (status = 200, description = "Branch found", body = Branch),
        (status = 404, description = "Branch not found", body = ErrorResponse)
    )
)]
async fn get_branch() {}

/// List rates
#[utoipa::path(
    get,
    path = "/api/rates",
    tag = "catalog",
    params(RateFilter),
    responses(
        (status = 200, description = "Rates", body = Vec<ExchangeRate>),
        (status = 403, description = "Deactivated rates are for catalog managers", body = ErrorResponse)
    )
)]
async fn list_rates() {}

/// Publish a rate
#[utoipa::path(
    post,
    path = "/api/rates",
    tag = "catalog",
    request_body = CreateRateRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 201, description = "Rate created", body = ExchangeRate),
        (status = 400, description = "Invalid or duplicate rate", body = ErrorResponse)
    )
)]
async fn create_rate() {}

/// Get a rate
#[utoipa::path(
    get,
    path = "/api/rates/{id}",
    tag = "catalog",
    params(("id" = String, Path, description = "Rate ID (UUID)")),
    responses(
        (status = 200, description = "Rate found", body = ExchangeRate),
        (status = 404, description = "Rate not found", body = ErrorResponse)
    )
)]
async fn get_rate() {}

/// Change a rate
#[utoipa::path(
    patch,
    path = "/api/rates/{id}",
    tag = "catalog",
    request_body = UpdateRateRequest,
    security(("bearer_auth" = [])),
    params(("id" = String, Path, description = "Rate ID (UUID)")),
    responses(
        (status = 200, description = "Rate updated", body = ExchangeRate),
        (status = 404, description = "Rate not found", body = ErrorResponse)
    )
)]
async fn update_rate() {}

/// Price an exchange
///
/// Give exactly one of `amount_from` or `amount_to`.
#[utoipa::path(
    post,
    path = "/api/rates/{id}/quote",
    tag = "catalog",
    request_body = QuoteRequest,
    params(("id" = String, Path, description = "Rate ID (UUID)")),
    responses(
        (status = 200, description = "Converted amounts", body = Conversion),
        (status = 400, description = "Neither or both amounts given", body = ErrorResponse),
        (status = 404, description = "Rate not found or inactive", body = ErrorResponse),
        (status = 422, description = "Below the rate's minimum", body = ErrorResponse)
    )
)]
async fn quote() {}

// ─────────────────────────────────────────────────────────────────────────────
// Balances
// ─────────────────────────────────────────────────────────────────────────────

/// List a branch's currency holdings
#[utoipa::path(
    get,
    path = "/api/branches/{id}/balances",
    tag = "balances",
    security(("bearer_auth" = [])),
    params(("id" = String, Path, description = "Branch ID (UUID)")),
    responses(
        (status = 200, description = "Holdings", body = Vec<CurrencyBalance>),
        (status = 403, description = "Owner only", body = ErrorResponse)
    )
)]
async fn list_balances() {}

/// Record a currency purchase
#[utoipa::path(
    post,
    path = "/api/branches/{id}/balances/purchase",
    tag = "balances",
    request_body = RecordPurchaseRequest,
    security(("bearer_auth" = [])),
    params(("id" = String, Path, description = "Branch ID (UUID)")),
    responses(
        (status = 200, description = "Updated holding", body = CurrencyBalance),
        (status = 400, description = "Non-positive amount or rate", body = ErrorResponse),
        (status = 409, description = "Concurrent update, retry", body = ErrorResponse)
    )
)]
async fn record_purchase() {}

// ─────────────────────────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────────────────────────

/// List orders
///
/// Staff see every order, clients only their own.
#[utoipa::path(
    get,
    path = "/api/orders",
    tag = "orders",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Orders, newest first", body = Vec<OrderResponse>),
        (status = 401, description = "Sign-in required", body = ErrorResponse)
    )
)]
async fn list_orders() {}

/// Place an order
#[utoipa::path(
    post,
    path = "/api/orders",
    tag = "orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order placed", body = OrderResponse),
        (status = 400, description = "Invalid order", body = ErrorResponse),
        (status = 404, description = "No active rate for a pair", body = ErrorResponse),
        (status = 422, description = "An item is below its rate's minimum", body = ErrorResponse)
    )
)]
async fn create_order() {}

/// Get an order
#[utoipa::path(
    get,
    path = "/api/orders/{id}",
    tag = "orders",
    security(("bearer_auth" = [])),
    params(("id" = String, Path, description = "Order ID (UUID)")),
    responses(
        (status = 200, description = "Order found", body = OrderResponse),
        (status = 403, description = "Another user's order", body = ErrorResponse),
        (status = 404, description = "Order not found", body = ErrorResponse)
    )
)]
async fn get_order() {}

/// Delete a new order
#[utoipa::path(
    delete,
    path = "/api/orders/{id}",
    tag = "orders",
    security(("bearer_auth" = [])),
    params(("id" = String, Path, description = "Order ID (UUID)")),
    responses(
        (status = 204, description = "Order deleted"),
        (status = 400, description = "Order is past new", body = ErrorResponse),
        (status = 404, description = "Order not found", body = ErrorResponse)
    )
)]
async fn delete_order() {}

/// Move an order to another status
#[utoipa::path(
    patch,
    path = "/api/orders/{id}/status",
    tag = "orders",
    request_body = UpdateOrderStatusRequest,
    security(("bearer_auth" = [])),
    params(("id" = String, Path, description = "Order ID (UUID)")),
    responses(
        (status = 200, description = "Status changed", body = OrderResponse),
        (status = 409, description = "Transition not allowed or lost a race", body = ErrorResponse),
        (status = 422, description = "Required documents missing", body = ErrorResponse)
    )
)]
async fn update_order_status() {}

/// List an order's documents
#[utoipa::path(
    get,
    path = "/api/orders/{id}/documents",
    tag = "orders",
    security(("bearer_auth" = [])),
    params(("id" = String, Path, description = "Order ID (UUID)")),
    responses((status = 200, description = "Documents", body = Vec<OrderDocument>))
)]
async fn list_documents() {}

/// Attach a document reference
#[utoipa::path(
    post,
    path = "/api/orders/{id}/documents",
    tag = "orders",
    request_body = AttachDocumentRequest,
    security(("bearer_auth" = [])),
    params(("id" = String, Path, description = "Order ID (UUID)")),
    responses(
        (status = 201, description = "Document attached", body = OrderDocument),
        (status = 400, description = "A document of this type already exists", body = ErrorResponse)
    )
)]
async fn attach_document() {}

/// Track an order by its public code
#[utoipa::path(
    get,
    path = "/api/track/{tracking_code}",
    tag = "orders",
    params(("tracking_code" = String, Path, description = "Tracking code")),
    responses(
        (status = 200, description = "Order status", body = TrackingResponse),
        (status = 404, description = "Unknown tracking code", body = ErrorResponse)
    )
)]
async fn track_order() {}

// ─────────────────────────────────────────────────────────────────────────────
// Reviews
// ─────────────────────────────────────────────────────────────────────────────

/// List reviews visible to the caller
#[utoipa::path(
    get,
    path = "/api/reviews",
    tag = "reviews",
    security(("bearer_auth" = [])),
    responses((status = 200, description = "Reviews", body = Vec<Review>))
)]
async fn list_reviews() {}

/// List published reviews
#[utoipa::path(
    get,
    path = "/api/reviews/public",
    tag = "reviews",
    responses((status = 200, description = "Published reviews", body = Vec<Review>))
)]
async fn list_public_reviews() {}

/// Review a completed order
#[utoipa::path(
    post,
    path = "/api/reviews",
    tag = "reviews",
    request_body = CreateReviewRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 201, description = "Review created, hidden until published", body = Review),
        (status = 400, description = "Order not completed, bad rating or already reviewed", body = ErrorResponse)
    )
)]
async fn create_review() {}

/// Publish or hide a review
#[utoipa::path(
    patch,
    path = "/api/reviews/{id}",
    tag = "reviews",
    request_body = UpdateReviewRequest,
    security(("bearer_auth" = [])),
    params(("id" = String, Path, description = "Review ID (UUID)")),
    responses((status = 200, description = "Review updated", body = Review))
)]
async fn update_review() {}

// ─────────────────────────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────────────────────────

/// My profile
#[utoipa::path(
    get,
    path = "/api/users/me",
    tag = "users",
    security(("bearer_auth" = [])),
    responses((status = 200, description = "Profile", body = User))
)]
async fn me() {}

/// Edit my profile
#[utoipa::path(
    patch,
    path = "/api/users/me",
    tag = "users",
    request_body = UpdateProfileRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Profile updated", body = User),
        (status = 400, description = "Invalid phone", body = ErrorResponse)
    )
)]
async fn update_me() {}

/// Apply a referral code
#[utoipa::path(
    post,
    path = "/api/users/me/referral",
    tag = "users",
    request_body = ApplyReferralRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Referral recorded", body = User),
        (status = 400, description = "Own, unknown or repeated code", body = ErrorResponse)
    )
)]
async fn apply_referral() {}

/// Users I referred
#[utoipa::path(
    get,
    path = "/api/users/me/referrals",
    tag = "users",
    security(("bearer_auth" = [])),
    responses((status = 200, description = "Referrals", body = Vec<ReferralEntry>))
)]
async fn list_referrals() {}

/// Replace a user's roles
#[utoipa::path(
    put,
    path = "/api/users/{id}/roles",
    tag = "users",
    request_body = SetRolesRequest,
    security(("bearer_auth" = [])),
    params(("id" = String, Path, description = "User ID (UUID)")),
    responses(
        (status = 200, description = "Roles replaced", body = User),
        (status = 403, description = "Owner only", body = ErrorResponse)
    )
)]
async fn set_roles() {}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Exchange Back Office API",
        version = "0.1.0",
        description = "Currency exchange rates, orders, balances and reviews"
    ),
    paths(
        health,
        list_currencies,
        create_currency,
        get_currency,
        update_currency,
        list_branches,
        create_branch,
        get_branch,
        list_rates,
        create_rate,
        get_rate,
        update_rate,
        quote,
        list_balances,
        record_purchase,
        list_orders,
        create_order,
        get_order,
        delete_order,
        update_order_status,
        list_documents,
        attach_document,
        track_order,
        list_reviews,
        list_public_reviews,
        create_review,
        update_review,
        me,
        update_me,
        apply_referral,
        list_referrals,
        set_roles,
    ),
    components(
        schemas(
            Currency,
            CurrencyCode,
            Branch,
            BranchId,
            DayHours,
            WorkingHours,
            ExchangeRate,
            RateId,
            Conversion,
            Direction,
            CurrencyBalance,
            OrderId,
            OrderItem,
            OrderStatus,
            TrackingCode,
            OrderDocument,
            DocumentType,
            Review,
            ReviewId,
            User,
            UserId,
            Role,
            CreateCurrencyRequest,
            UpdateCurrencyRequest,
            CreateBranchRequest,
            CreateRateRequest,
            UpdateRateRequest,
            QuoteRequest,
            RecordPurchaseRequest,
            OrderItemRequest,
            CreateOrderRequest,
            UpdateOrderStatusRequest,
            AttachDocumentRequest,
            OrderItemView,
            OrderResponse,
            TrackingResponse,
            CreateReviewRequest,
            UpdateReviewRequest,
            UpdateProfileRequest,
            ApplyReferralRequest,
            SetRolesRequest,
            ReferralEntry,
            ErrorResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "catalog", description = "Currencies, branches, rates and quotes"),
        (name = "balances", description = "Branch currency holdings"),
        (name = "orders", description = "Exchange orders and their lifecycle"),
        (name = "reviews", description = "Client reviews and moderation"),
        (name = "users", description = "Profiles, referrals and roles"),
    )
)]
pub struct ApiDoc;

/// Security scheme modifier for Bearer token authentication.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}
