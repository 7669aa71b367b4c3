//! Errors raised by the rate engine and the balance accountant.

use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Amount {amount} is below the minimum of {min_amount}")]
    BelowMinimum { amount: Decimal, min_amount: Decimal },

    #[error("Invalid currency code: {0}")]
    InvalidCurrencyCode(String),
}
