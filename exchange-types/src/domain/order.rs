//! Order domain model and lifecycle state machine.

use chrono::{DateTime, Utc};
use exchange_rates::{Direction, convert};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::currency::CurrencyCode;
use super::document::{DocumentType, OrderDocument};
use super::ids::{BranchId, OrderId, UserId};
use super::rate::ExchangeRate;
use crate::error::DomainError;

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of an order.
///
/// ```text
/// new -> processing -> waiting_delivery -> completed
///   \________\_______________\___________-> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Processing,
    WaitingDelivery,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        Self::New,
        Self::Processing,
        Self::WaitingDelivery,
        Self::Completed,
        Self::Cancelled,
    ];

    /// Statuses reachable in one step. Terminal statuses have none.
    pub fn allowed_transitions(&self) -> &'static [OrderStatus] {
        match self {
            Self::New => &[Self::Processing, Self::Cancelled],
            Self::Processing => &[Self::WaitingDelivery, Self::Cancelled],
            Self::WaitingDelivery => &[Self::Completed, Self::Cancelled],
            Self::Completed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Processing => "processing",
            Self::WaitingDelivery => "waiting_delivery",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Label shown to clients.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Processing => "Processing",
            Self::WaitingDelivery => "Waiting for delivery",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::Validation(format!("Unknown order status: {}", s)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracking Code
// ─────────────────────────────────────────────────────────────────────────────

const TRACKING_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Short public identifier clients use to look up an order without logging in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = String, example = "K7QX2M9RTBWA")]
pub struct TrackingCode(String);

impl TrackingCode {
    pub const LEN: usize = 12;

    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let code = (0..Self::LEN)
            .map(|_| TRACKING_ALPHABET[rng.random_range(0..TRACKING_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Accepts any URL-safe code previously issued; normalizes to uppercase.
    pub fn parse(code: &str) -> Result<Self, DomainError> {
        let code = code.trim();
        if code.is_empty()
            || code.len() > 32
            || !code.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(DomainError::Validation(format!(
                "Invalid tracking code: {}",
                code
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Items
// ─────────────────────────────────────────────────────────────────────────────

/// One exchange leg. The rate is a snapshot taken when the order was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OrderItem {
    pub position: u32,
    pub from_currency: CurrencyCode,
    pub to_currency: CurrencyCode,
    #[schema(value_type = String, example = "100")]
    pub from_amount: Decimal,
    #[schema(value_type = String, example = "4125")]
    pub to_amount: Decimal,
    #[schema(value_type = String, example = "41.25")]
    pub rate: Decimal,
}

impl OrderItem {
    /// Prices a leg at the branch's current rate.
    ///
    /// # Errors
    /// - `RateNotFound` if the rate is inactive
    /// - `BelowMinimum` if `from_amount` is under the rate's minimum
    /// - `Validation` for a non-positive amount
    pub fn price(
        position: u32,
        rate: &ExchangeRate,
        from_amount: Decimal,
    ) -> Result<Self, DomainError> {
        if !rate.is_active {
            return Err(DomainError::RateNotFound {
                branch_id: rate.branch_id,
                from: rate.from_currency,
                to: rate.to_currency,
            });
        }
        if from_amount <= Decimal::ZERO {
            return Err(DomainError::Validation(
                "Item amount must be positive".into(),
            ));
        }

        let conversion = convert(&rate.quote(), Direction::ToAmountFromFromAmount, from_amount)
            .map_err(|e| DomainError::from_rate_error(e, rate.from_currency))?;

        Ok(Self {
            position,
            from_currency: conversion.from_currency,
            to_currency: conversion.to_currency,
            from_amount: conversion.amount_from,
            to_amount: conversion.amount_to,
            rate: conversion.rate,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Order
// ─────────────────────────────────────────────────────────────────────────────

/// A client's request to exchange one or more currency amounts at a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub tracking_code: TrackingCode,
    /// None for guest orders
    pub user_id: Option<UserId>,
    pub branch_id: BranchId,
    pub status: OrderStatus,
    pub client_email: String,
    pub client_phone: Option<String>,
    /// Present when the client asked for delivery
    pub delivery_address: Option<String>,
    /// Staff member who last moved the order
    pub operator_id: Option<UserId>,
    pub items: Vec<OrderItem>,
    pub documents: Vec<OrderDocument>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Places a new order from already-priced items.
    ///
    /// # Validation
    /// - At least one item
    /// - Each item exchanges two different currencies
    /// - Client email is well-formed
    pub fn new(
        branch_id: BranchId,
        user_id: Option<UserId>,
        client_email: String,
        client_phone: Option<String>,
        delivery_address: Option<String>,
        items: Vec<OrderItem>,
    ) -> Result<Self, DomainError> {
        if items.is_empty() {
            return Err(DomainError::Validation(
                "Order must contain at least one item".into(),
            ));
        }
        if items.iter().any(|i| i.from_currency == i.to_currency) {
            return Err(DomainError::Validation(
                "Source and target currencies must differ".into(),
            ));
        }
        let client_email = client_email.trim().to_string();
        if !super::is_valid_email(&client_email) {
            return Err(DomainError::Validation(format!(
                "Invalid client email: {}",
                client_email
            )));
        }
        let client_phone = non_blank(client_phone);
        if client_phone.as_ref().is_some_and(|p| p.chars().count() > 20) {
            return Err(DomainError::Validation(
                "Client phone cannot exceed 20 characters".into(),
            ));
        }

        let now = Utc::now();
        Ok(Self {
            id: OrderId::new(),
            tracking_code: TrackingCode::generate(),
            user_id,
            branch_id,
            status: OrderStatus::New,
            client_email,
            client_phone,
            delivery_address: non_blank(delivery_address),
            operator_id: None,
            items,
            documents: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn requests_delivery(&self) -> bool {
        self.delivery_address.is_some()
    }

    pub fn has_document(&self, doc_type: DocumentType) -> bool {
        self.documents.iter().any(|d| d.doc_type == doc_type)
    }

    /// Required document types not yet attached.
    pub fn missing_documents(&self) -> Vec<DocumentType> {
        DocumentType::REQUIRED_FOR_COMPLETION
            .into_iter()
            .filter(|t| !self.has_document(*t))
            .collect()
    }

    pub fn can_transition(&self, target: OrderStatus) -> bool {
        self.status.can_transition_to(target)
    }

    /// Checks a transition without applying it.
    ///
    /// The edge is checked first; document requirements only apply to a legal
    /// move into `completed`.
    pub fn check_transition(&self, target: OrderStatus) -> Result<(), DomainError> {
        if !self.can_transition(target) {
            return Err(DomainError::InvalidTransition {
                current: self.status,
                requested: target,
                allowed: self.status.allowed_transitions().to_vec(),
            });
        }
        if target == OrderStatus::Completed {
            let missing = self.missing_documents();
            if !missing.is_empty() {
                return Err(DomainError::MissingRequirements { missing });
            }
        }
        Ok(())
    }

    /// Moves the order to `target`, returning the previous status.
    pub fn transition(&mut self, target: OrderStatus) -> Result<OrderStatus, DomainError> {
        self.check_transition(target)?;
        let previous = self.status;
        self.status = target;
        self.updated_at = Utc::now();
        Ok(previous)
    }

    pub fn total_from_amount(&self) -> Decimal {
        self.items.iter().map(|i| i.from_amount).sum()
    }

    pub fn total_to_amount(&self) -> Decimal {
        self.items.iter().map(|i| i.to_amount).sum()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
