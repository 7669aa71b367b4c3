//! Exchange rate domain model.

use chrono::{DateTime, Utc};
use exchange_rates::RateQuote;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::currency::CurrencyCode;
use super::ids::{BranchId, RateId};
use crate::error::DomainError;

/// A branch's price for one directed currency pair.
///
/// At most one rate exists per (branch, from, to).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ExchangeRate {
    pub id: RateId,
    pub branch_id: BranchId,
    pub from_currency: CurrencyCode,
    pub to_currency: CurrencyCode,
    /// Units of `to_currency` per one unit of `from_currency`
    #[schema(value_type = String, example = "41.25")]
    pub rate: Decimal,
    /// Smallest from-amount accepted at this rate
    #[schema(value_type = String, example = "10")]
    pub min_amount: Decimal,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl ExchangeRate {
    /// Creates a new active rate.
    ///
    /// # Validation
    /// - from and to currencies differ
    /// - rate is positive
    /// - min_amount is not negative
    pub fn new(
        branch_id: BranchId,
        from_currency: CurrencyCode,
        to_currency: CurrencyCode,
        rate: Decimal,
        min_amount: Decimal,
    ) -> Result<Self, DomainError> {
        if from_currency == to_currency {
            return Err(DomainError::Validation(
                "Source and target currencies must differ".into(),
            ));
        }
        validate_values(rate, min_amount)?;

        Ok(Self {
            id: RateId::new(),
            branch_id,
            from_currency,
            to_currency,
            rate,
            min_amount,
            is_active: true,
            updated_at: Utc::now(),
        })
    }

    /// Applies a partial update, re-validating the result.
    pub fn update(
        &mut self,
        rate: Option<Decimal>,
        min_amount: Option<Decimal>,
        is_active: Option<bool>,
    ) -> Result<(), DomainError> {
        let rate = rate.unwrap_or(self.rate);
        let min_amount = min_amount.unwrap_or(self.min_amount);
        validate_values(rate, min_amount)?;

        self.rate = rate;
        self.min_amount = min_amount;
        if let Some(active) = is_active {
            self.is_active = active;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// The engine's view of this rate.
    pub fn quote(&self) -> RateQuote {
        RateQuote {
            from: self.from_currency,
            to: self.to_currency,
            rate: self.rate,
            min_amount: self.min_amount,
        }
    }
}

fn validate_values(rate: Decimal, min_amount: Decimal) -> Result<(), DomainError> {
    if rate <= Decimal::ZERO {
        return Err(DomainError::Validation("Rate must be positive".into()));
    }
    if min_amount < Decimal::ZERO {
        return Err(DomainError::Validation(
            "Minimum amount cannot be negative".into(),
        ));
    }
    Ok(())
}
