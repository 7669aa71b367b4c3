//! Error types for the exchange back office.

use exchange_rates::RateError;
use rust_decimal::Decimal;

use crate::domain::{BranchId, CurrencyCode, DocumentType, OrderStatus};

/// Domain-level errors (business rule violations).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DomainError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No active rate for {from} -> {to} at branch {branch_id}")]
    RateNotFound {
        branch_id: BranchId,
        from: CurrencyCode,
        to: CurrencyCode,
    },

    #[error("Amount {amount} {currency} is below the minimum of {min_amount} {currency}")]
    BelowMinimum {
        amount: Decimal,
        min_amount: Decimal,
        currency: CurrencyCode,
    },

    #[error("Cannot move order from {current} to {requested}")]
    InvalidTransition {
        current: OrderStatus,
        requested: OrderStatus,
        allowed: Vec<OrderStatus>,
    },

    #[error("Missing required documents: {}", join(missing))]
    MissingRequirements { missing: Vec<DocumentType> },

    #[error("Validation error: {0}")]
    Validation(String),
}

fn join(missing: &[DocumentType]) -> String {
    missing
        .iter()
        .map(DocumentType::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl DomainError {
    /// Converts an engine error, attaching the currency a minimum refers to.
    pub fn from_rate_error(err: RateError, currency: CurrencyCode) -> Self {
        match err {
            RateError::BelowMinimum { amount, min_amount } => DomainError::BelowMinimum {
                amount,
                min_amount,
                currency,
            },
            other => other.into(),
        }
    }
}

impl From<RateError> for DomainError {
    fn from(err: RateError) -> Self {
        match err {
            RateError::InvalidInput(msg) => DomainError::InvalidInput(msg),
            RateError::InvalidCurrencyCode(code) => {
                DomainError::Validation(format!("Invalid currency code: {}", code))
            }
            e @ RateError::BelowMinimum { .. } => DomainError::InvalidInput(e.to_string()),
        }
    }
}

/// Access-policy refusals.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Invalid credentials: {0}")]
    InvalidToken(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

/// Repository-level errors (data access failures).
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Entity not found")]
    NotFound,

    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Application-level errors (for HTTP responses).
///
/// Maps cleanly to HTTP status codes.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Domain(DomainError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DomainError> for AppError {
    fn from(err: DomainError) -> Self {
        AppError::Domain(err)
    }
}

impl From<AccessError> for AppError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Unauthenticated => AppError::Unauthorized(err.to_string()),
            AccessError::InvalidToken(msg) => AppError::Unauthorized(msg),
            AccessError::Forbidden(msg) => AppError::Forbidden(msg),
        }
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::Domain(e) => AppError::Domain(e),
            RepoError::NotFound => AppError::NotFound("Resource not found".into()),
            RepoError::Database(e) => AppError::Internal(e),
            RepoError::Transaction(e) => AppError::Internal(e),
            RepoError::Conflict(e) => AppError::Conflict(e),
        }
    }
}
