//! Rate Engine.
//!
//! Converts an amount through a resolved branch rate in either direction and
//! enforces the rate's minimum from-amount. Looking the rate up (and failing
//! when none is active) belongs to the caller.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::currency::{CurrencyCode, round_half_up};
use crate::error::RateError;

/// Which side of the exchange the caller supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The from-amount is known; compute what the client receives.
    ToAmountFromFromAmount,
    /// The to-amount is known; compute what the client has to hand over.
    FromAmountFromToAmount,
}

impl Direction {
    /// Picks the direction from a pair of optional amounts.
    ///
    /// Exactly one amount must be present.
    pub fn select(
        amount_from: Option<Decimal>,
        amount_to: Option<Decimal>,
    ) -> Result<(Self, Decimal), RateError> {
        match (amount_from, amount_to) {
            (Some(amount), None) => Ok((Self::ToAmountFromFromAmount, amount)),
            (None, Some(amount)) => Ok((Self::FromAmountFromToAmount, amount)),
            (Some(_), Some(_)) => Err(RateError::InvalidInput(
                "Specify only one of amount_from or amount_to".into(),
            )),
            (None, None) => Err(RateError::InvalidInput(
                "Specify either amount_from or amount_to".into(),
            )),
        }
    }
}

/// The parts of a stored rate the engine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuote {
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    /// Units of `to` per one unit of `from`.
    pub rate: Decimal,
    /// Smallest accepted from-amount.
    pub min_amount: Decimal,
}

/// Result of a conversion. Amounts carry full precision until `rounded` is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Conversion {
    pub from_currency: CurrencyCode,
    pub to_currency: CurrencyCode,
    #[schema(value_type = String, example = "100.00")]
    pub amount_from: Decimal,
    #[schema(value_type = String, example = "92.00")]
    pub amount_to: Decimal,
    #[schema(value_type = String, example = "0.92")]
    pub rate: Decimal,
    #[schema(value_type = String, example = "10")]
    pub min_amount: Decimal,
}

impl Conversion {
    /// Rounds both amounts half-up for display. The rate is left untouched.
    pub fn rounded(self, from_dp: u32, to_dp: u32) -> Self {
        Self {
            amount_from: round_half_up(self.amount_from, from_dp),
            amount_to: round_half_up(self.amount_to, to_dp),
            ..self
        }
    }
}

/// Converts `amount` through `quote`.
///
/// # Errors
/// - `InvalidInput` for a negative amount, a non-positive rate, a negative
///   minimum, or arithmetic overflow
/// - `BelowMinimum` when the resulting from-amount is below `min_amount`
///   (an amount exactly at the minimum is accepted)
pub fn convert(
    quote: &RateQuote,
    direction: Direction,
    amount: Decimal,
) -> Result<Conversion, RateError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(RateError::InvalidInput("Amount cannot be negative".into()));
    }
    if quote.rate <= Decimal::ZERO {
        return Err(RateError::InvalidInput("Rate must be positive".into()));
    }
    if quote.min_amount < Decimal::ZERO {
        return Err(RateError::InvalidInput(
            "Minimum amount cannot be negative".into(),
        ));
    }

    let (amount_from, amount_to) = match direction {
        Direction::ToAmountFromFromAmount => {
            let to = amount
                .checked_mul(quote.rate)
                .ok_or_else(|| RateError::InvalidInput("Amount is too large".into()))?;
            (amount, to)
        }
        Direction::FromAmountFromToAmount => {
            let from = amount
                .checked_div(quote.rate)
                .ok_or_else(|| RateError::InvalidInput("Amount is too large".into()))?;
            (from, amount)
        }
    };

    if amount_from < quote.min_amount {
        return Err(RateError::BelowMinimum {
            amount: amount_from,
            min_amount: quote.min_amount,
        });
    }

    Ok(Conversion {
        from_currency: quote.from,
        to_currency: quote.to,
        amount_from,
        amount_to,
        rate: quote.rate,
        min_amount: quote.min_amount,
    })
}
