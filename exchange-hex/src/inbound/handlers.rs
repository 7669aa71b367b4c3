//! HTTP request handlers.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use exchange_types::{
    Actor, AppError, ApplyReferralRequest, AttachDocumentRequest, CreateBranchRequest,
    CreateCurrencyRequest, CreateOrderRequest, CreateRateRequest, CreateReviewRequest,
    CurrencyCode, CurrencyFilter, DomainError, ErrorResponse, ExchangeRepository,
    IdentityVerifier, QuoteRequest, RateFilter, RecordPurchaseRequest, SetRolesRequest,
    UpdateCurrencyRequest, UpdateOrderStatusRequest, UpdateProfileRequest, UpdateRateRequest,
    UpdateReviewRequest,
};

use super::rate_limit::RateLimiterState;
use crate::ExchangeService;

/// Application state shared across handlers.
pub struct AppState<R: ExchangeRepository> {
    pub service: ExchangeService<R>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub rate_limiter: Arc<RateLimiterState>,
}

/// Wrapper to implement IntoResponse for AppError (orphan rule workaround).
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Option<serde_json::Value>) {
        match &self.0 {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", None),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden", None),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict", None),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", None),
            AppError::Domain(err) => match err {
                DomainError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input", None),
                DomainError::Validation(_) => (StatusCode::BAD_REQUEST, "validation", None),
                DomainError::RateNotFound { branch_id, from, to } => (
                    StatusCode::NOT_FOUND,
                    "rate_not_found",
                    Some(json!({ "branch_id": branch_id, "from": from, "to": to })),
                ),
                DomainError::BelowMinimum {
                    amount,
                    min_amount,
                    currency,
                } => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "below_minimum",
                    Some(json!({
                        "amount": amount,
                        "min_amount": min_amount,
                        "currency": currency,
                    })),
                ),
                DomainError::InvalidTransition {
                    current,
                    requested,
                    allowed,
                } => (
                    StatusCode::CONFLICT,
                    "invalid_transition",
                    Some(json!({
                        "current": current,
                        "requested": requested,
                        "allowed": allowed,
                    })),
                ),
                DomainError::MissingRequirements { missing } => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "missing_requirements",
                    Some(json!({ "missing": missing })),
                ),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, details) = self.parts();

        let message = match &self.0 {
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error: message,
            code: status.as_u16(),
            kind: kind.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(AppError::BadRequest(format!("Invalid {} ID", what))))
}

fn parse_code(raw: &str) -> Result<CurrencyCode, ApiError> {
    CurrencyCode::parse(raw)
        .map_err(|_| ApiError(AppError::BadRequest(format!("Invalid currency code: {}", raw))))
}

/// Health check endpoint.
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Currencies
// ─────────────────────────────────────────────────────────────────────────────

#[tracing::instrument(skip(state, actor))]
pub async fn list_currencies<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Query(filter): Query<CurrencyFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let currencies = state.service.list_currencies(&actor, filter).await?;
    Ok(Json(currencies))
}

#[tracing::instrument(skip(state, actor), fields(code = %req.code))]
pub async fn create_currency<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CreateCurrencyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let currency = state.service.create_currency(&actor, req).await?;
    Ok((StatusCode::CREATED, Json(currency)))
}

#[tracing::instrument(skip(state, actor))]
pub async fn get_currency<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let code = parse_code(&code)?;
    let currency = state.service.get_currency(&actor, code).await?;
    Ok(Json(currency))
}

#[tracing::instrument(skip(state, actor, req))]
pub async fn update_currency<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(code): Path<String>,
    Json(req): Json<UpdateCurrencyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let code = parse_code(&code)?;
    let currency = state.service.update_currency(&actor, code, req).await?;
    Ok(Json(currency))
}

// ─────────────────────────────────────────────────────────────────────────────
// Branches & Balances
// ─────────────────────────────────────────────────────────────────────────────

#[tracing::instrument(skip(state, actor))]
pub async fn list_branches<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    let branches = state.service.list_branches(&actor).await?;
    Ok(Json(branches))
}

#[tracing::instrument(skip(state, actor, req), fields(name = %req.name))]
pub async fn create_branch<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CreateBranchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let branch = state.service.create_branch(&actor, req).await?;
    Ok((StatusCode::CREATED, Json(branch)))
}

#[tracing::instrument(skip(state, actor), fields(branch_id = %id))]
pub async fn get_branch<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let branch = state
        .service
        .get_branch(&actor, parse_id(&id, "branch")?)
        .await?;
    Ok(Json(branch))
}

#[tracing::instrument(skip(state, actor), fields(branch_id = %id))]
pub async fn list_balances<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let balances = state
        .service
        .list_balances(&actor, parse_id(&id, "branch")?)
        .await?;
    Ok(Json(balances))
}

#[tracing::instrument(skip(state, actor), fields(branch_id = %id, currency = %req.currency))]
pub async fn record_purchase<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(req): Json<RecordPurchaseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let balance = state
        .service
        .record_purchase(&actor, parse_id(&id, "branch")?, req)
        .await?;
    Ok(Json(balance))
}

// ─────────────────────────────────────────────────────────────────────────────
// Rates
// ─────────────────────────────────────────────────────────────────────────────

#[tracing::instrument(skip(state, actor))]
pub async fn list_rates<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Query(filter): Query<RateFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let rates = state.service.list_rates(&actor, filter).await?;
    Ok(Json(rates))
}

#[tracing::instrument(skip(state, actor), fields(from = %req.from_currency, to = %req.to_currency))]
pub async fn create_rate<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CreateRateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rate = state.service.create_rate(&actor, req).await?;
    Ok((StatusCode::CREATED, Json(rate)))
}

#[tracing::instrument(skip(state, actor), fields(rate_id = %id))]
pub async fn get_rate<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rate = state.service.get_rate(&actor, parse_id(&id, "rate")?).await?;
    Ok(Json(rate))
}

#[tracing::instrument(skip(state, actor, req), fields(rate_id = %id))]
pub async fn update_rate<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rate = state
        .service
        .update_rate(&actor, parse_id(&id, "rate")?, req)
        .await?;
    Ok(Json(rate))
}

#[tracing::instrument(skip(state, actor), fields(rate_id = %id))]
pub async fn quote<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(req): Json<QuoteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let conversion = state
        .service
        .quote(&actor, parse_id(&id, "rate")?, req)
        .await?;
    Ok(Json(conversion))
}

// ─────────────────────────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────────────────────────

#[tracing::instrument(skip(state, actor))]
pub async fn list_orders<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    let orders = state.service.list_orders(&actor).await?;
    Ok(Json(orders))
}

#[tracing::instrument(skip(state, actor, req), fields(branch_id = %req.branch_id))]
pub async fn create_order<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state.service.create_order(&actor, req).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

#[tracing::instrument(skip(state, actor), fields(order_id = %id))]
pub async fn get_order<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state.service.get_order(&actor, parse_id(&id, "order")?).await?;
    Ok(Json(order))
}

#[tracing::instrument(skip(state, actor), fields(order_id = %id))]
pub async fn delete_order<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .service
        .delete_order(&actor, parse_id(&id, "order")?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state, actor), fields(order_id = %id, status = %req.status))]
pub async fn update_order_status<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(req): Json<UpdateOrderStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .service
        .update_order_status(&actor, parse_id(&id, "order")?, req)
        .await?;
    Ok(Json(order))
}

#[tracing::instrument(skip(state, actor), fields(order_id = %id))]
pub async fn list_documents<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let documents = state
        .service
        .list_documents(&actor, parse_id(&id, "order")?)
        .await?;
    Ok(Json(documents))
}

#[tracing::instrument(skip(state, actor), fields(order_id = %id, doc_type = %req.doc_type))]
pub async fn attach_document<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(req): Json<AttachDocumentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let document = state
        .service
        .attach_document(&actor, parse_id(&id, "order")?, req)
        .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

/// Public order lookup by tracking code.
#[tracing::instrument(skip(state, actor))]
pub async fn track_order<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tracking = state.service.track_order(&actor, &code).await?;
    Ok(Json(tracking))
}

// ─────────────────────────────────────────────────────────────────────────────
// Reviews
// ─────────────────────────────────────────────────────────────────────────────

#[tracing::instrument(skip(state, actor))]
pub async fn list_reviews<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    let reviews = state.service.list_reviews(&actor).await?;
    Ok(Json(reviews))
}

#[tracing::instrument(skip(state, actor))]
pub async fn list_public_reviews<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    let reviews = state.service.list_public_reviews(&actor).await?;
    Ok(Json(reviews))
}

#[tracing::instrument(skip(state, actor, req), fields(order_id = %req.order_id, rating = req.rating))]
pub async fn create_review<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CreateReviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let review = state.service.create_review(&actor, req).await?;
    Ok((StatusCode::CREATED, Json(review)))
}

#[tracing::instrument(skip(state, actor), fields(review_id = %id))]
pub async fn update_review<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(req): Json<UpdateReviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let review = state
        .service
        .set_review_visibility(&actor, parse_id(&id, "review")?, req)
        .await?;
    Ok(Json(review))
}

// ─────────────────────────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────────────────────────

#[tracing::instrument(skip(state, actor))]
pub async fn me<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.service.me(&actor).await?;
    Ok(Json(user))
}

#[tracing::instrument(skip(state, actor, req))]
pub async fn update_me<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.service.update_me(&actor, req).await?;
    Ok(Json(user))
}

#[tracing::instrument(skip(state, actor, req))]
pub async fn apply_referral<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<ApplyReferralRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.service.apply_referral(&actor, req).await?;
    Ok(Json(user))
}

#[tracing::instrument(skip(state, actor))]
pub async fn list_referrals<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    let referrals = state.service.list_referrals(&actor).await?;
    Ok(Json(referrals))
}

#[tracing::instrument(skip(state, actor, req), fields(user_id = %id))]
pub async fn set_roles<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
    Json(req): Json<SetRolesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .service
        .set_roles(&actor, parse_id(&id, "user")?, req)
        .await?;
    Ok(Json(user))
}
