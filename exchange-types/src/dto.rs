//! Data Transfer Objects (DTOs) for requests and responses.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::domain::{
    BranchId, CurrencyCode, DocumentType, OrderDocument, OrderId, OrderStatus, Role, TrackingCode,
    UserId, WorkingHours,
};

// ─────────────────────────────────────────────────────────────────────────────
// Catalog DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// Request to add a currency to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateCurrencyRequest {
    pub code: CurrencyCode,
    #[schema(example = "US Dollar")]
    pub name: String,
    #[schema(example = "$")]
    pub symbol: String,
    #[serde(default = "default_decimal_places")]
    #[schema(example = 2)]
    pub decimal_places: u32,
}

fn default_decimal_places() -> u32 {
    2
}

/// Partial update of a currency. Omitted fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateCurrencyRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimal_places: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CurrencyFilter {
    /// Include retired currencies
    #[serde(default)]
    pub include_inactive: bool,
}

/// Request to open a branch.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateBranchRequest {
    #[schema(example = "Central")]
    pub name: String,
    #[schema(example = "Kyiv")]
    pub city: String,
    #[schema(example = "1 Khreshchatyk St")]
    pub address: String,
    #[schema(example = "+380441234567")]
    pub phone: String,
    #[schema(example = "central@example.com")]
    pub email: String,
    pub base_currency: CurrencyCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_id: Option<UserId>,
    #[serde(default)]
    pub working_hours: WorkingHours,
}

/// Request to publish a rate for a currency pair at a branch.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateRateRequest {
    pub branch_id: BranchId,
    pub from_currency: CurrencyCode,
    pub to_currency: CurrencyCode,
    #[schema(value_type = String, example = "41.25")]
    pub rate: Decimal,
    #[serde(default)]
    #[schema(value_type = String, example = "0")]
    pub min_amount: Decimal,
}

/// Partial update of a rate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateRateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, example = "41.30")]
    pub rate: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub min_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

/// Query parameters for listing rates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RateFilter {
    /// Only rates of this branch
    pub branch_id: Option<BranchId>,
    /// Include deactivated rates (staff only)
    #[serde(default)]
    pub include_inactive: bool,
}

/// Request to price an exchange. Exactly one amount must be given.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct QuoteRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, example = "100")]
    pub amount_from: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub amount_to: Option<Decimal>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Balance DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// Request to record that a branch bought some currency.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecordPurchaseRequest {
    pub currency: CurrencyCode,
    /// Quantity bought
    #[schema(value_type = String, example = "50")]
    pub amount: Decimal,
    /// Rate paid per unit
    #[schema(value_type = String, example = "16")]
    pub rate: Decimal,
}

// ─────────────────────────────────────────────────────────────────────────────
// Order DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// One leg of a new order.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemRequest {
    pub from_currency: CurrencyCode,
    pub to_currency: CurrencyCode,
    #[schema(value_type = String, example = "100")]
    pub from_amount: Decimal,
}

/// Request to place an order. Works without signing in.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateOrderRequest {
    pub branch_id: BranchId,
    #[schema(example = "client@example.com")]
    pub client_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_phone: Option<String>,
    /// Set to request delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_address: Option<String>,
    pub items: Vec<OrderItemRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}

/// Request to attach a document reference to an order.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AttachDocumentRequest {
    pub doc_type: DocumentType,
    #[schema(example = "uploads/2024/05/receipt-0001.pdf")]
    pub file_handle: String,
}

/// An order item with amounts rounded to currency precision.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemView {
    pub from_currency: CurrencyCode,
    pub to_currency: CurrencyCode,
    #[schema(value_type = String, example = "100.00")]
    pub from_amount: Decimal,
    #[schema(value_type = String, example = "4125.00")]
    pub to_amount: Decimal,
    #[schema(value_type = String, example = "41.25")]
    pub rate: Decimal,
}

/// Full order representation for its client and staff.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    pub id: OrderId,
    pub tracking_code: TrackingCode,
    pub user_id: Option<UserId>,
    pub branch_id: BranchId,
    pub status: OrderStatus,
    #[schema(example = "Processing")]
    pub status_display: String,
    pub client_email: String,
    pub client_phone: Option<String>,
    pub delivery_address: Option<String>,
    pub operator_id: Option<UserId>,
    pub items: Vec<OrderItemView>,
    pub documents: Vec<OrderDocument>,
    #[schema(value_type = String)]
    pub total_from_amount: Decimal,
    #[schema(value_type = String)]
    pub total_to_amount: Decimal,
    /// Statuses the order can move to next
    pub allowed_transitions: Vec<OrderStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What anyone holding the tracking code may see.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TrackingResponse {
    pub tracking_code: TrackingCode,
    pub status: OrderStatus,
    #[schema(example = "Waiting for delivery")]
    pub status_display: String,
    pub items: Vec<OrderItemView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Review DTOs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateReviewRequest {
    pub order_id: OrderId,
    #[schema(example = 5)]
    pub rating: u8,
    #[schema(example = "Fast and friendly service")]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateReviewRequest {
    pub is_visible: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// User DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// Profile fields a user may edit. Omitted fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateProfileRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "+380501234567")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApplyReferralRequest {
    #[schema(example = "3f9a1c2e")]
    pub referral_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SetRolesRequest {
    pub roles: BTreeSet<Role>,
}

/// A user who signed up with my referral code.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReferralEntry {
    pub id: UserId,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error body returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable message
    #[schema(example = "Cannot move order from new to completed")]
    pub error: String,
    /// HTTP status code
    #[schema(example = 409)]
    pub code: u16,
    /// Machine-readable error kind
    #[schema(example = "invalid_transition")]
    pub kind: String,
    /// Structured context, shape depends on `kind`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<serde_json::Value>,
}
